//! Container images a workflow runs its steps in.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::eyre::{eyre, Result};
use derive_getters::Getters;

use super::ImageSpec;
use crate::cache::sha256_hex;
use crate::config::{default_cache_dir, EngineSettings};
use crate::executor::Executor;
use crate::log::*;

/// Runtime executables tried in order when an image has to be pulled.
pub const RUNTIME_CANDIDATES: [&str; 2] = ["apptainer.lima", "apptainer"];

#[derive(thiserror::Error, Debug)]
pub enum ImageError {
    #[error("no container runtime found (tried {0})")]
    NoRuntime(String),
    #[error("pulling {image} failed: {reason}")]
    Pull { image: String, reason: String },
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Checksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("could not verify {path}: {reason}")]
    Verify { path: PathBuf, reason: String },
    #[error("image directory: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ImageProvider: std::fmt::Debug + Send + Sync {
    /// Make sure the image is available locally and return its path.
    async fn ensure(&self, image: &ImageSpec) -> Result<PathBuf, ImageError>;
}

/// Apptainer images pulled from an OCI registry and kept as `<name>.sif`
/// files in one directory.
#[derive(Getters, Debug, Clone)]
pub struct ApptainerImages {
    dir: PathBuf,
    registry: String,
    executor: Arc<dyn Executor>,
    candidates: Vec<String>,
}

impl ApptainerImages {
    pub fn new<P: Into<PathBuf>>(dir: P, registry: &str, executor: Arc<dyn Executor>) -> Self {
        Self {
            dir: dir.into(),
            registry: registry.into(),
            executor,
            candidates: RUNTIME_CANDIDATES.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn from_settings(engine: &EngineSettings, executor: Arc<dyn Executor>) -> Result<Self> {
        let dir = match engine.image_dir() {
            Some(dir) => dir.clone(),
            None => default_cache_dir()
                .map(|dir| dir.join("images"))
                .ok_or_else(|| eyre!("no image directory configured and no cache dir available"))?,
        };
        Ok(Self::new(dir, engine.image_registry(), executor))
    }

    pub fn with_candidates(mut self, candidates: &[&str]) -> Self {
        self.candidates = candidates.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn image_path(&self, image: &ImageSpec) -> PathBuf {
        self.dir.join(format!("{}.sif", image.name))
    }

    async fn runtime(&self) -> Result<PathBuf, ImageError> {
        let candidates = self.candidates.clone();
        let found = tokio::task::spawn_blocking(move || {
            candidates
                .iter()
                .find_map(|candidate| which::which(candidate).ok())
        })
        .await
        .map_err(|e| ImageError::NoRuntime(format!("{} ({})", self.candidates.join(", "), e)))?;
        found.ok_or_else(|| ImageError::NoRuntime(self.candidates.join(", ")))
    }

    async fn pull(&self, image: &ImageSpec, dest: &Path) -> Result<(), ImageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let runtime = self.runtime().await?;
        let source = format!("docker://{}/{}:{}", self.registry, image.name, image.version);
        info!("pulling {} into {}", source, dest.display());

        let argv = vec![
            runtime.display().to_string(),
            "pull".to_string(),
            dest.display().to_string(),
            source,
        ];
        let output = self
            .executor
            .execute(&argv)
            .await
            .map_err(|e| ImageError::Pull {
                image: image.name.clone(),
                reason: e.to_string(),
            })?;
        if output.returncode != 0 {
            return Err(ImageError::Pull {
                image: image.name.clone(),
                reason: format!("exit code {}: {}", output.returncode, output.stderr.trim()),
            });
        }
        if !tokio::fs::try_exists(dest).await? {
            return Err(ImageError::Pull {
                image: image.name.clone(),
                reason: format!("{} was not written", dest.display()),
            });
        }
        Ok(())
    }

    async fn verify(&self, path: &Path, expected: &str) -> Result<(), ImageError> {
        let owned = path.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || sha256_hex(&owned))
            .await
            .map_err(|e| ImageError::Verify {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
            .map_err(|e| ImageError::Verify {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if !actual.eq_ignore_ascii_case(expected) {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!("could not remove {}: {}", path.display(), e);
            }
            return Err(ImageError::Checksum {
                path: path.to_path_buf(),
                expected: expected.to_string(),
                actual,
            });
        }
        debug!("{} matches its checksum", path.display());
        Ok(())
    }
}

#[async_trait]
impl ImageProvider for ApptainerImages {
    #[tracing::instrument(skip(self))]
    async fn ensure(&self, image: &ImageSpec) -> Result<PathBuf, ImageError> {
        let dest = self.image_path(image);
        if tokio::fs::try_exists(&dest).await? {
            info!("using cached image {}", dest.display());
        } else {
            self.pull(image, &dest).await?;
        }
        if let Some(expected) = &image.sha256 {
            self.verify(&dest, expected).await?;
        }
        Ok(dest)
    }
}
