use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::Result;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::parse;
use super::store::JobStore;
use super::{JobStatus, JobUpdate};
use crate::config::JobSettings;
use crate::executor::{LogSource, PartialLogStream};
use crate::log::*;
use crate::remote::cluster::ClusterBackend;
use crate::remote::slurm::{self, CACHED};

pub const SUBMITTING_PHASE: &str = "Submitting via SSH";
pub const DONE_PHASE: &str = "Done";

const CHECK_STEP: Duration = Duration::from_secs(1);

/// Runs submitted jobs against a cluster and keeps the [`JobStore`] current.
///
/// Each job gets its own task, bounded by a semaphore, plus one
/// reconciliation task that lives exactly as long as the job is running.
#[derive(Debug, Clone)]
pub struct JobRunner {
    store: Arc<JobStore>,
    backend: Arc<dyn ClusterBackend>,
    poll_interval: Duration,
    permits: Arc<Semaphore>,
}

impl JobRunner {
    pub fn new(
        store: Arc<JobStore>,
        backend: Arc<dyn ClusterBackend>,
        poll_interval: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            backend,
            poll_interval,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn from_settings(
        store: Arc<JobStore>,
        backend: Arc<dyn ClusterBackend>,
        settings: &JobSettings,
    ) -> Self {
        Self::new(
            store,
            backend,
            Duration::from_secs(*settings.poll_interval_secs()),
            *settings.max_concurrent(),
        )
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn ClusterBackend> {
        &self.backend
    }

    /// Start `command` for an already created job in the background. Returns
    /// immediately; the job stays pending until a worker slot frees up.
    pub fn submit(&self, job_id: &str, command: &str) -> JoinHandle<()> {
        let runner = self.clone();
        let job_id = job_id.to_string();
        let command = command.to_string();
        tokio::spawn(async move { runner.run(job_id, command).await })
    }

    #[tracing::instrument(skip(self, command))]
    async fn run(&self, job_id: String, command: String) {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("worker pool closed: {}", e);
                self.fail(&job_id, &e.to_string());
                return;
            }
        };

        self.store.update(
            &job_id,
            JobUpdate::status(JobStatus::Running).with_phase(SUBMITTING_PHASE),
        );

        let cancel = CancellationToken::new();
        let reconciler = tokio::spawn(reconcile(
            self.store.clone(),
            self.backend.clone(),
            job_id.clone(),
            self.poll_interval,
            cancel.clone(),
        ));

        let outcome = match self.backend.launch(&command).await {
            Ok(mut source) => consume_stream(&self.store, &job_id, source.as_mut()).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                info!("job {} completed", job_id);
                self.store.update(
                    &job_id,
                    JobUpdate::status(JobStatus::Completed).with_phase(DONE_PHASE),
                );
            }
            Err(e) => {
                warn!("job {} failed: {}", job_id, e);
                self.fail(&job_id, &e.to_string());
            }
        }

        cancel.cancel();
        if let Err(e) = reconciler.await {
            error!("reconciliation task for {} panicked: {}", job_id, e);
        }
    }

    fn fail(&self, job_id: &str, reason: &str) {
        self.store.update(job_id, JobUpdate::status(JobStatus::Failed));
        self.store.append_log(job_id, &format!("\nError: {}", reason));
    }
}

/// Feed every line of `source` into the job until it ends. A clean end is
/// `Ok`; an aborted or broken stream is an error.
pub async fn consume_stream(store: &JobStore, job_id: &str, source: &mut dyn LogSource) -> Result<()> {
    let mut work_dir_seen = false;
    loop {
        match source.source().await? {
            PartialLogStream::Next(lines) => {
                for line in lines {
                    apply_line(store, job_id, &line, &mut work_dir_seen);
                }
            }
            PartialLogStream::End => return Ok(()),
            PartialLogStream::Abort(reason) => return Err(eyre!(reason)),
        }
    }
}

fn apply_line(store: &JobStore, job_id: &str, line: &str, work_dir_seen: &mut bool) {
    let facts = parse::scan(line);

    // The marker is bookkeeping, not output.
    if let Some(work_dir) = facts.work_dir {
        if !*work_dir_seen {
            *work_dir_seen = true;
            store.update(
                job_id,
                JobUpdate {
                    work_dir: Some(work_dir),
                    ..Default::default()
                },
            );
        }
        return;
    }

    store.append_log(job_id, line);

    if let Some(container) = facts.container {
        store.add_container(job_id, container);
    }
    if let Some(rule) = facts.cache_hit {
        store.add_cached_sub_job(job_id, &rule);
    }
    if let Some((scheduler_job_id, rule)) = facts.submission {
        debug!("job {} submitted {} for rule {}", job_id, scheduler_job_id, rule);
        store.add_sub_job(job_id, &scheduler_job_id, &rule);
    }
    if let Some(progress) = facts.progress {
        store.update(
            job_id,
            JobUpdate {
                steps_done: Some(progress.done),
                steps_total: Some(progress.total),
                progress_percent: Some(progress.percent),
                ..Default::default()
            },
        );
    }
    if facts.engine_started {
        store.update(
            job_id,
            JobUpdate {
                phase: Some(parse::ENGINE_PHASE.to_string()),
                ..Default::default()
            },
        );
    }
}

/// Whether the scheduler can still tell us something new about a sub-job.
fn needs_refresh(state: &str) -> bool {
    state != CACHED && !slurm::is_terminal(state)
}

fn is_running(store: &JobStore, job_id: &str) -> bool {
    store.status(job_id) == Some(JobStatus::Running)
}

/// Refresh the job's unsettled sub-jobs from the scheduler every `interval`
/// with one batched query, until the job stops running or `cancel` fires.
/// Query failures are logged and retried on the next tick.
#[tracing::instrument(skip(store, backend, cancel))]
pub async fn reconcile(
    store: Arc<JobStore>,
    backend: Arc<dyn ClusterBackend>,
    job_id: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    while is_running(&store, &job_id) && !cancel.is_cancelled() {
        let active: Vec<String> = store
            .list_sub_jobs(&job_id)
            .into_iter()
            .filter(|sub_job| needs_refresh(&sub_job.state))
            .map(|sub_job| sub_job.scheduler_job_id)
            .collect();

        if !active.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = backend.query_status_batch(&active) => match result {
                    Ok(statuses) => {
                        trace!("scheduler reported {} of {} sub-jobs", statuses.len(), active.len());
                        store.apply_scheduler_statuses(&job_id, &statuses);
                    }
                    Err(e) => warn!("scheduler status check for {} failed: {}", job_id, e),
                },
            }
        }

        let mut waited = Duration::ZERO;
        while waited < interval {
            if !is_running(&store, &job_id) {
                break;
            }
            let step = CHECK_STEP.min(interval - waited);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(step) => waited += step,
            }
        }
    }
    debug!("reconciliation for {} finished", job_id);
}
