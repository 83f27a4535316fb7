//! The cluster as seen by the job runner and the API: launch a streaming
//! command, ask the scheduler about jobs, move files in and out.

use std::collections::HashMap;

use async_trait::async_trait;
use color_eyre::eyre::Result;
use derive_getters::Getters;

use super::files::{self, RemoteEntry, StoredFile};
use super::slurm::{self, BatchResources, StatusRecord};
use super::Connection;
use crate::config::RemoteSettings;
use crate::executor::{ssh, LogSource};
use crate::log::*;

/// Marker line naming the working directory a launched command runs in.
pub const WORKDIR_MARKER: &str = "__WORKDIR__:";

#[async_trait]
pub trait ClusterBackend: std::fmt::Debug + Send + Sync {
    /// Start `command` in a fresh working directory and stream its output.
    /// The first line of the stream is the [`WORKDIR_MARKER`].
    async fn launch(&self, command: &str) -> Result<Box<dyn LogSource>>;

    /// Queue lookup with history fallback for one scheduler job.
    async fn query_status(&self, job_id: &str) -> Result<StatusRecord>;

    /// Batched lookup; see [`slurm::query_job_status_batch`].
    async fn query_status_batch(&self, job_ids: &[String]) -> Result<HashMap<String, StatusRecord>>;

    async fn list_dir(&self, dir: &str) -> Result<Vec<RemoteEntry>>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Write `body` as an sbatch script and return the scheduler job id.
    async fn submit_batch(&self, body: &str, resources: &BatchResources) -> Result<String>;

    /// Store `content` as `dir/name`, creating `dir` if needed.
    async fn upload(&self, dir: &str, name: &str, content: &[u8]) -> Result<StoredFile>;
}

/// `<root>/batch/<id>.sh`
pub fn batch_script_path(root: &str, id: &str) -> String {
    format!("{}/batch/{}.sh", root.trim_end_matches('/'), id)
}

/// Build the shell line that runs `command` inside `work_dir`, merging
/// stderr into stdout and announcing the resolved directory first.
pub fn launch_command(path_prefix: &str, work_dir: &str, command: &str) -> String {
    format!(
        "export PATH={}:$PATH && mkdir -p {} && cd {} && echo \"{}$(pwd)\" && {} 2>&1",
        path_prefix, work_dir, work_dir, WORKDIR_MARKER, command
    )
}

/// `<root>/<YYYY-MM-DD-HHMM>-<suffix>`.
pub fn work_dir_name(root: &str, suffix: &str) -> String {
    let stamp = time::OffsetDateTime::now_utc()
        .format(time::macros::format_description!(
            "[year]-[month]-[day]-[hour][minute]"
        ))
        .unwrap_or_else(|_| "run".to_string());
    format!("{}/{}-{}", root.trim_end_matches('/'), stamp, suffix)
}

/// [`ClusterBackend`] over SSH. Every operation opens its own session and
/// closes it afterwards; sessions are never shared between jobs.
#[derive(Getters, Debug, Clone)]
pub struct SshCluster {
    connection: Connection,
    remote: RemoteSettings,
}

impl SshCluster {
    pub fn new(connection: Connection, remote: RemoteSettings) -> Self {
        Self { connection, remote }
    }
}

#[async_trait]
impl ClusterBackend for SshCluster {
    #[tracing::instrument(skip(self))]
    async fn launch(&self, command: &str) -> Result<Box<dyn LogSource>> {
        let session = self.connection.connect().await?;
        let work_dir = work_dir_name(self.remote.work_root(), &nanoid::nanoid!(6));
        info!("running in working directory: {}", work_dir);
        let wrapped = launch_command(self.remote.path_prefix(), &work_dir, command);
        let source = ssh::run_command(session, &wrapped).await?;
        Ok(Box::new(source))
    }

    async fn query_status(&self, job_id: &str) -> Result<StatusRecord> {
        let mut session = self.connection.connect().await?;
        let result = slurm::query_job_status(&mut session, job_id).await;
        session.close().await;
        result
    }

    async fn query_status_batch(&self, job_ids: &[String]) -> Result<HashMap<String, StatusRecord>> {
        let mut session = self.connection.connect().await?;
        let result = slurm::query_job_status_batch(&mut session, job_ids).await;
        session.close().await;
        result
    }

    async fn list_dir(&self, dir: &str) -> Result<Vec<RemoteEntry>> {
        let mut session = self.connection.connect().await?;
        let result = files::list_dir(&mut session, dir).await;
        session.close().await;
        result
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut session = self.connection.connect().await?;
        let result = files::read_file(&mut session, path).await;
        session.close().await;
        result
    }

    #[tracing::instrument(skip(self, body))]
    async fn submit_batch(&self, body: &str, resources: &BatchResources) -> Result<String> {
        let mut session = self.connection.connect().await?;
        let path = batch_script_path(self.remote.work_root(), &nanoid::nanoid!(8));
        let result = slurm::submit_batch(&mut session, &path, body, resources).await;
        session.close().await;
        result
    }

    #[tracing::instrument(skip(self, content))]
    async fn upload(&self, dir: &str, name: &str, content: &[u8]) -> Result<StoredFile> {
        let mut session = self.connection.connect().await?;
        let result = files::write_file(&mut session, dir, name, content).await;
        session.close().await;
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::executor::ChannelLogSource;

    /// In-memory cluster. Replies are consumed in order; every call is
    /// counted.
    #[derive(Debug, Default)]
    pub(crate) struct FakeCluster {
        pub launches: Mutex<VecDeque<Result<ChannelLogSource, String>>>,
        pub launched: Mutex<Vec<String>>,
        pub batch_replies: Mutex<VecDeque<Result<HashMap<String, StatusRecord>, String>>>,
        pub batch_queries: Mutex<Vec<Vec<String>>>,
        pub single_replies: Mutex<VecDeque<Result<StatusRecord, String>>>,
        pub files: Mutex<HashMap<String, Vec<u8>>>,
        pub submitted: Mutex<Vec<(String, BatchResources)>>,
        pub calls: AtomicUsize,
    }

    impl FakeCluster {
        pub fn push_launch(&self, source: Result<ChannelLogSource, String>) {
            self.launches.lock().push_back(source);
        }

        pub fn push_batch(&self, reply: Result<HashMap<String, StatusRecord>, String>) {
            self.batch_replies.lock().push_back(reply);
        }

        pub fn push_single(&self, reply: Result<StatusRecord, String>) {
            self.single_replies.lock().push_back(reply);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ClusterBackend for FakeCluster {
        async fn launch(&self, command: &str) -> Result<Box<dyn LogSource>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.launched.lock().push(command.to_string());
            let next = self.launches.lock().pop_front();
            match next {
                Some(Ok(source)) => Ok(Box::new(source)),
                Some(Err(e)) => Err(eyre!(e)),
                None => Err(eyre!("no launch scripted")),
            }
        }

        async fn query_status(&self, _job_id: &str) -> Result<StatusRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.single_replies.lock().pop_front();
            match next {
                Some(Ok(record)) => Ok(record),
                Some(Err(e)) => Err(eyre!(e)),
                None => Ok(StatusRecord::not_found()),
            }
        }

        async fn query_status_batch(&self, job_ids: &[String]) -> Result<HashMap<String, StatusRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch_queries.lock().push(job_ids.to_vec());
            let next = self.batch_replies.lock().pop_front();
            match next {
                Some(Ok(reply)) => Ok(reply),
                Some(Err(e)) => Err(eyre!(e)),
                None => Ok(HashMap::new()),
            }
        }

        async fn list_dir(&self, dir: &str) -> Result<Vec<RemoteEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            let mut entries: Vec<RemoteEntry> = self
                .files
                .lock()
                .iter()
                .filter_map(|(path, content)| {
                    let name = path.strip_prefix(&prefix)?;
                    (!name.contains('/')).then(|| RemoteEntry {
                        name: name.to_string(),
                        entry_type: files::EntryType::File,
                        size: content.len() as u64,
                    })
                })
                .collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(entries)
        }

        async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.files
                .lock()
                .get(path)
                .cloned()
                .ok_or_else(|| eyre!("cat: {}: No such file or directory", path))
        }

        async fn submit_batch(&self, body: &str, resources: &BatchResources) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut submitted = self.submitted.lock();
            submitted.push((body.to_string(), resources.clone()));
            Ok(format!("{}", 1000 + submitted.len()))
        }

        async fn upload(&self, dir: &str, name: &str, content: &[u8]) -> Result<StoredFile> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = files::validate_file_name(name)?;
            let remote_path = files::join_remote(dir, name);
            self.files.lock().insert(remote_path.clone(), content.to_vec());
            Ok(StoredFile {
                remote_path,
                size: content.len() as u64,
            })
        }
    }

    #[test]
    fn test_launch_command_shape() {
        let line = launch_command("$HOME/.local/bin", "~/runs/2026-01-01-0000-abc", "hpcflow run margie");
        assert_eq!(
            "export PATH=$HOME/.local/bin:$PATH && mkdir -p ~/runs/2026-01-01-0000-abc && cd ~/runs/2026-01-01-0000-abc && echo \"__WORKDIR__:$(pwd)\" && hpcflow run margie 2>&1",
            line
        );
    }

    #[test]
    fn test_batch_script_path() {
        assert_eq!("~/runs/batch/a1.sh", batch_script_path("~/runs/", "a1"));
    }

    #[tokio::test]
    async fn test_fake_upload_is_listed() -> Result<()> {
        let cluster = FakeCluster::default();
        let stored = cluster.upload("/u/lab", "a.fa", b">c1").await?;
        assert_eq!("/u/lab/a.fa", stored.remote_path);
        let entries = cluster.list_dir("/u/lab").await?;
        assert_eq!(1, entries.len());
        assert_eq!(3, entries[0].size);
        assert!(cluster.upload("/u/lab", "..", b"x").await.is_err());
        Ok(())
    }

    #[test]
    fn test_work_dir_name() {
        let name = work_dir_name("~/runs/", "xyz");
        assert!(name.starts_with("~/runs/"));
        assert!(name.ends_with("-xyz"));
        // ~/runs/YYYY-MM-DD-HHMM-xyz
        assert_eq!("~/runs/".len() + 15 + 4, name.len());
    }
}
