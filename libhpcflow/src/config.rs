//! Settings shared by the CLI and the controller, read from a YAML file.

use std::path::{Path, PathBuf};

use color_eyre::eyre::{Result, WrapErr};
use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::log::*;
use crate::pipeline::WorkflowDefinition;
use crate::remote::host::{default_ssh_port, Port};

/// Env var that points at a settings file, consulted when no `--config` flag
/// is given.
pub const CONFIG_ENV: &str = "HPCFLOW_CONFIG";

#[derive(Getters, Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    cluster: ClusterSettings,
    #[serde(default)]
    remote: RemoteSettings,
    #[serde(default)]
    engine: EngineSettings,
    #[serde(default)]
    jobs: JobSettings,
    #[serde(default)]
    events: EventSettings,
    #[serde(default)]
    controller: ControllerSettings,
    #[serde(default)]
    workflows: Vec<WorkflowDefinition>,
}

impl Settings {
    /// Parse settings from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).wrap_err("deserializing settings")
    }

    /// Load settings from an explicit path, or the `HPCFLOW_CONFIG` path, or
    /// the per-user default location. Only an explicitly named file has to
    /// exist.
    #[tracing::instrument]
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let (path, required) = match explicit {
            Some(path) => (Some(path.to_path_buf()), true),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) => (Some(PathBuf::from(path)), true),
                None => (default_config_path(), false),
            },
        };

        match path {
            Some(path) if path.exists() => {
                debug!("reading settings from {}", path.display());
                let text = std::fs::read_to_string(&path)
                    .wrap_err_with(|| format!("reading settings file {}", path.display()))?;
                Self::from_yaml(&text)
            }
            Some(path) if required => Err(eyre!("settings file not found: {}", path.display())),
            _ => {
                debug!("no settings file, using defaults");
                Ok(Self::default())
            }
        }
    }
}

/// `<config dir>/hpcflow/settings.yaml` for the current user.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "hpcflow")
        .map(|dirs| dirs.config_dir().join("settings.yaml"))
}

/// `<cache dir>/hpcflow` for the current user.
pub fn default_cache_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "hpcflow").map(|dirs| dirs.cache_dir().to_path_buf())
}

pub fn default_passphrase_env() -> String {
    "HPCFLOW_SSH_PASSPHRASE".into()
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default)]
    host: String,
    #[serde(default = "self::default_ssh_port")]
    port: Port,
    #[serde(default)]
    username: String,
    /// Private key on disk. Without one the local SSH agent is used.
    #[serde(default)]
    key_path: Option<PathBuf>,
    #[serde(default = "self::default_passphrase_env")]
    passphrase_env: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            username: String::new(),
            key_path: None,
            passphrase_env: default_passphrase_env(),
        }
    }
}

pub fn default_work_root() -> String {
    "~/hpcflow-runs".into()
}

pub fn default_path_prefix() -> String {
    "$HOME/.local/bin".into()
}

pub fn default_launch_template() -> String {
    "hpcflow -vv run {workflow} --config input_file={target}".into()
}

pub fn default_genome_root() -> String {
    "~/genomes".into()
}

pub fn default_upload_root() -> String {
    "~/uploads".into()
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Parent of the per-job timestamped working directories.
    #[serde(default = "self::default_work_root")]
    work_root: String,
    /// Prepended to `$PATH` before the launch command runs.
    #[serde(default = "self::default_path_prefix")]
    path_prefix: String,
    /// Command run on the cluster for a submission. `{workflow}` and
    /// `{target}` are substituted, `{target}` shell-quoted.
    #[serde(default = "self::default_launch_template")]
    launch_template: String,
    /// Directory genome listings are taken relative to.
    #[serde(default = "self::default_genome_root")]
    genome_root: String,
    /// Directory uploads land under.
    #[serde(default = "self::default_upload_root")]
    upload_root: String,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            work_root: default_work_root(),
            path_prefix: default_path_prefix(),
            launch_template: default_launch_template(),
            genome_root: default_genome_root(),
            upload_root: default_upload_root(),
        }
    }
}

pub fn default_engine_executable() -> String {
    "snakemake".into()
}

pub fn default_cores() -> u32 {
    1
}

pub fn default_engine_jobs() -> u32 {
    20
}

pub fn default_mem_mb() -> u32 {
    4096
}

pub fn default_runtime_minutes() -> u32 {
    30
}

pub fn default_image_registry() -> String {
    "ghcr.io/wintermutant".into()
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "self::default_engine_executable")]
    executable: String,
    #[serde(default = "self::default_cores")]
    cores: u32,
    /// Maximum number of scheduler jobs the engine keeps in flight.
    #[serde(default = "self::default_engine_jobs")]
    jobs: u32,
    #[serde(default)]
    slurm_account: Option<String>,
    #[serde(default)]
    slurm_partition: Option<String>,
    #[serde(default = "self::default_mem_mb")]
    mem_mb: u32,
    #[serde(default = "self::default_runtime_minutes")]
    runtime_minutes: u32,
    /// Directory holding the workflow files. Relative workflow file names are
    /// resolved against it.
    #[serde(default)]
    workflow_dir: Option<PathBuf>,
    /// Container registry images are pulled from.
    #[serde(default = "self::default_image_registry")]
    image_registry: String,
    /// Where pulled images are kept; `<cache dir>/images` when unset.
    #[serde(default)]
    image_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            executable: default_engine_executable(),
            cores: default_cores(),
            jobs: default_engine_jobs(),
            slurm_account: None,
            slurm_partition: None,
            mem_mb: default_mem_mb(),
            runtime_minutes: default_runtime_minutes(),
            workflow_dir: None,
            image_registry: default_image_registry(),
            image_dir: None,
        }
    }
}

pub fn default_poll_interval_secs() -> u64 {
    15
}

pub fn default_max_concurrent() -> usize {
    4
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default = "self::default_poll_interval_secs")]
    poll_interval_secs: u64,
    #[serde(default = "self::default_max_concurrent")]
    max_concurrent: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

pub fn default_event_poll_secs() -> u64 {
    10
}

pub fn default_heartbeat_secs() -> u64 {
    7
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    #[serde(default = "self::default_event_poll_secs")]
    poll_secs: u64,
    #[serde(default = "self::default_heartbeat_secs")]
    heartbeat_secs: u64,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            poll_secs: default_event_poll_secs(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

pub fn default_controller_port() -> u16 {
    2345
}

pub fn default_workflow() -> String {
    "margie".into()
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    #[serde(default = "self::default_controller_port")]
    port: u16,
    /// Workflow launched when a submission does not name one.
    #[serde(default = "self::default_workflow")]
    default_workflow: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            port: default_controller_port(),
            default_workflow: default_workflow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result;

    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() -> Result<()> {
        let settings = Settings::from_yaml("cluster:\n  host: login.example.edu\n  username: alice\n")?;
        assert_eq!("login.example.edu", settings.cluster().host());
        assert_eq!(22, *settings.cluster().port());
        assert_eq!(15, *settings.jobs().poll_interval_secs());
        assert_eq!(7, *settings.events().heartbeat_secs());
        assert_eq!("snakemake", settings.engine().executable());
        assert!(settings.cluster().key_path().is_none());
        assert_eq!("~/genomes", settings.remote().genome_root());
        assert_eq!("~/uploads", settings.remote().upload_root());
        Ok(())
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let missing = Path::new("/definitely/not/here/settings.yaml");
        assert!(Settings::load(Some(missing)).is_err());
    }

    #[test]
    fn test_engine_overrides() -> Result<()> {
        let settings = Settings::from_yaml(
            "engine:\n  slurm_account: lab\n  slurm_partition: cpu\n  jobs: 5\n",
        )?;
        assert_eq!(Some("lab"), settings.engine().slurm_account().as_deref());
        assert_eq!(5, *settings.engine().jobs());
        assert_eq!(1, *settings.engine().cores());
        Ok(())
    }

    #[test]
    fn test_workflow_definitions() -> Result<()> {
        let settings = Settings::from_yaml(
            "workflows:\n  - name: annotate\n    snakefile: /opt/flows/annotate.smk\n    images:\n      - name: prodigal\n        version: 2.6.3-v1.0\n        sha256: abc123\n    cache_outputs:\n      prodigal: ['prodigal/{stem}.gff']\n",
        )?;
        assert_eq!(1, settings.workflows().len());
        let annotate = &settings.workflows()[0];
        assert_eq!("annotate", annotate.name);
        assert_eq!(Some("abc123"), annotate.images[0].sha256.as_deref());
        assert_eq!(vec!["prodigal/{stem}.gff"], annotate.cache_outputs["prodigal"]);
        assert_eq!("margie", settings.controller().default_workflow());
        Ok(())
    }
}
