//! File listing, download and upload on the login node.
//!
//! Everything goes over the exec channel with plain POSIX tools, so no SFTP
//! subsystem is required on the login node.

use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};

use crate::executor::RemoteExec;
use crate::log::*;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PathError {
    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),
    #[error("parent directory segments are not allowed: {0}")]
    Traversal(String),
    #[error("not a plain file name: {0:?}")]
    FileName(String),
}

/// Accept only paths that stay inside the directory they are joined onto.
/// An empty path means the directory itself.
pub fn validate_relative_path(path: &str) -> Result<&str, PathError> {
    if path.starts_with('/') {
        return Err(PathError::Absolute(path.to_string()));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(PathError::Traversal(path.to_string()));
    }
    Ok(path)
}

/// A single path component: non-empty, no `/`, not `.` or `..`.
pub fn validate_file_name(name: &str) -> Result<&str, PathError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(PathError::FileName(name.to_string()));
    }
    Ok(name)
}

/// Shell-quote a remote path, leaving a leading `~/` to expand as `$HOME`.
pub fn quote_remote(path: &str) -> String {
    if path == "~" {
        return "\"$HOME\"".to_string();
    }
    match path.strip_prefix("~/") {
        Some(rest) if rest.is_empty() => "\"$HOME\"".to_string(),
        Some(rest) => format!("\"$HOME\"/{}", shell_words::quote(rest)),
        None => shell_words::quote(path).into_owned(),
    }
}

/// `base` joined with an already validated relative path.
pub fn join_remote(base: &str, relative: &str) -> String {
    let relative = relative.trim_end_matches('/');
    if relative.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), relative)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub size: u64,
}

pub fn list_command(dir: &str) -> String {
    format!(
        "find {} -mindepth 1 -maxdepth 1 -printf '%y|%s|%f\\n'",
        quote_remote(dir)
    )
}

pub fn read_command(path: &str) -> String {
    format!("cat -- {}", quote_remote(path))
}

/// Create `dir`, copy stdin into `dir/name`, then print the stored size.
pub fn upload_command(dir: &str, name: &str) -> String {
    let path = quote_remote(&join_remote(dir, name));
    format!(
        "mkdir -p {} && cat > {} && stat -c %s {}",
        quote_remote(dir),
        path,
        path
    )
}

/// File name endings treated as genome assemblies.
pub const GENOME_SUFFIXES: [&str; 8] = [
    ".fasta", ".fa", ".fna", ".fas", ".fasta.gz", ".fa.gz", ".fna.gz", ".fas.gz",
];

pub fn is_genome_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    GENOME_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

/// Keep subdirectories and genome files from a listing.
pub fn genome_entries(entries: Vec<RemoteEntry>) -> Vec<RemoteEntry> {
    entries
        .into_iter()
        .filter(|entry| entry.entry_type == EntryType::Directory || is_genome_file(&entry.name))
        .collect()
}

/// Where an upload ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub remote_path: String,
    pub size: u64,
}

/// Parse `find -printf '%y|%s|%f\n'` output. Anything that is not a
/// directory is listed as a file; malformed lines are skipped.
pub fn parse_listing(output: &str) -> Vec<RemoteEntry> {
    let mut entries: Vec<RemoteEntry> = output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '|');
            let kind = parts.next()?;
            let size = parts.next()?.parse::<u64>().ok()?;
            let name = parts.next()?;
            if name.is_empty() {
                return None;
            }
            let entry_type = if kind == "d" {
                EntryType::Directory
            } else {
                EntryType::File
            };
            Some(RemoteEntry {
                name: name.to_string(),
                entry_type,
                size,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

/// List a remote directory. A missing directory is an error.
#[tracing::instrument(skip(exec))]
pub async fn list_dir<R: RemoteExec + ?Sized>(exec: &mut R, dir: &str) -> Result<Vec<RemoteEntry>> {
    let output = exec.exec_capture(&list_command(dir)).await?;
    if output.exit_status != 0 {
        return Err(eyre!(
            "listing {} failed: {}",
            dir,
            output.stderr_lossy().trim()
        ));
    }
    Ok(parse_listing(&output.stdout_lossy()))
}

/// Read a whole remote file.
#[tracing::instrument(skip(exec))]
pub async fn read_file<R: RemoteExec + ?Sized>(exec: &mut R, path: &str) -> Result<Vec<u8>> {
    let output = exec.exec_capture(&read_command(path)).await?;
    if output.exit_status != 0 {
        return Err(eyre!(
            "reading {} failed: {}",
            path,
            output.stderr_lossy().trim()
        ));
    }
    debug!("read {} bytes from {}", output.stdout.len(), path);
    Ok(output.stdout)
}

/// Write `content` to `dir/name`, creating `dir` first. The returned size
/// is what the remote side reports after writing.
#[tracing::instrument(skip(exec, content), fields(bytes = content.len()))]
pub async fn write_file<R: RemoteExec + ?Sized>(
    exec: &mut R,
    dir: &str,
    name: &str,
    content: &[u8],
) -> Result<StoredFile> {
    let name = validate_file_name(name)?;
    let remote_path = join_remote(dir, name);
    let output = exec
        .exec_with_input(&upload_command(dir, name), content)
        .await?;
    if output.exit_status != 0 {
        return Err(eyre!(
            "writing {} failed: {}",
            remote_path,
            output.stderr_lossy().trim()
        ));
    }
    let size = match output.stdout_lossy().trim().parse::<u64>() {
        Ok(size) => size,
        Err(_) => {
            warn!("no size reported for {}, assuming {} bytes", remote_path, content.len());
            content.len() as u64
        }
    };
    if size != content.len() as u64 {
        return Err(eyre!(
            "{} holds {} bytes, expected {}",
            remote_path,
            size,
            content.len()
        ));
    }
    info!("stored {} ({} bytes)", remote_path, size);
    Ok(StoredFile { remote_path, size })
}
