//! Job state as a stream of timestamped status events.
//!
//! The stream polls a [`StatusWatcher`], emits whenever the reported state
//! changes or the heartbeat interval has passed, and finishes with exactly
//! one event flagged `done` once a terminal state shows up. Dropping the
//! stream has no effect on the job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::eyre::Result;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::Instant;

use super::store::JobStore;
use crate::config::EventSettings;
use crate::log::*;
use crate::remote::cluster::ClusterBackend;
use crate::remote::slurm::{self, NOT_FOUND};

/// What a watcher saw on one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub state: String,
    pub elapsed: String,
    pub detail: Option<String>,
}

#[async_trait]
pub trait StatusWatcher: std::fmt::Debug + Send + Sync {
    async fn observe(&self) -> Result<Observation>;
}

/// Event states after which the stream ends.
pub fn is_final_state(state: &str) -> bool {
    slurm::is_terminal(state) || state == NOT_FOUND
}

/// Watches a pipeline job through the [`JobStore`]. Job statuses are
/// reported upper-cased so they share the scheduler's vocabulary.
#[derive(Debug, Clone)]
pub struct StoreWatcher {
    store: Arc<JobStore>,
    job_id: String,
}

impl StoreWatcher {
    pub fn new<S: Into<String>>(store: Arc<JobStore>, job_id: S) -> Self {
        Self {
            store,
            job_id: job_id.into(),
        }
    }
}

#[async_trait]
impl StatusWatcher for StoreWatcher {
    async fn observe(&self) -> Result<Observation> {
        let job = self
            .store
            .get(&self.job_id)
            .ok_or_else(|| eyre!("job {} not found", self.job_id))?;
        let elapsed = OffsetDateTime::now_utc() - job.created_at;
        let detail = if job.steps_total > 0 {
            format!(
                "{} ({} of {} steps, {}%)",
                job.phase, job.steps_done, job.steps_total, job.progress_percent
            )
        } else {
            job.phase.clone()
        };
        Ok(Observation {
            state: job.status.to_string().to_uppercase(),
            elapsed: format_elapsed(elapsed.whole_seconds()),
            detail: Some(detail),
        })
    }
}

/// Watches a scheduler job directly.
#[derive(Debug, Clone)]
pub struct SchedulerWatcher {
    backend: Arc<dyn ClusterBackend>,
    scheduler_job_id: String,
}

impl SchedulerWatcher {
    pub fn new<S: Into<String>>(backend: Arc<dyn ClusterBackend>, scheduler_job_id: S) -> Self {
        Self {
            backend,
            scheduler_job_id: scheduler_job_id.into(),
        }
    }
}

#[async_trait]
impl StatusWatcher for SchedulerWatcher {
    async fn observe(&self) -> Result<Observation> {
        let record = self.backend.query_status(&self.scheduler_job_id).await?;
        Ok(Observation {
            state: record.state,
            elapsed: record.elapsed,
            detail: record.job_name,
        })
    }
}

/// `H:MM:SS`, the way the scheduler prints elapsed time.
pub fn format_elapsed(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl StatusEvent {
    fn progress(seen: &Observation, watched: Duration) -> Self {
        let mut message = format!(
            "Job {} (elapsed: {}, checking for: {}s)",
            seen.state.to_lowercase(),
            seen.elapsed,
            watched.as_secs()
        );
        if let Some(detail) = &seen.detail {
            message.push_str(" - ");
            message.push_str(detail);
        }
        Self {
            state: Some(seen.state.clone()),
            elapsed: Some(seen.elapsed.clone()),
            message: Some(message),
            done: false,
            error: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    fn finished(seen: &Observation) -> Self {
        Self {
            state: Some(seen.state.clone()),
            elapsed: Some(seen.elapsed.clone()),
            message: None,
            done: true,
            error: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    fn failed(error: String) -> Self {
        Self {
            state: None,
            elapsed: None,
            message: None,
            done: true,
            error: Some(error),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EventTiming {
    pub poll: Duration,
    pub heartbeat: Duration,
}

impl From<&EventSettings> for EventTiming {
    fn from(settings: &EventSettings) -> Self {
        Self {
            poll: Duration::from_secs(*settings.poll_secs()),
            heartbeat: Duration::from_secs(*settings.heartbeat_secs()),
        }
    }
}

struct Watch {
    watcher: Arc<dyn StatusWatcher>,
    timing: EventTiming,
    started: Instant,
    last_state: Option<String>,
    last_sent: Option<Instant>,
    queued: Vec<StatusEvent>,
    polled: bool,
    finished: bool,
}

impl Watch {
    /// Poll until there is something to say.
    async fn next_event(&mut self) -> Option<StatusEvent> {
        loop {
            if !self.queued.is_empty() {
                return Some(self.queued.remove(0));
            }
            if self.finished {
                return None;
            }
            if self.polled {
                tokio::time::sleep(self.timing.poll).await;
            }
            self.polled = true;
            self.poll_once().await;
        }
    }

    async fn poll_once(&mut self) {
        let seen = match self.watcher.observe().await {
            Ok(seen) => seen,
            Err(e) => {
                warn!("status watcher failed: {}", e);
                self.queued
                    .push(StatusEvent::failed(format!("Error checking status: {}", e)));
                self.finished = true;
                return;
            }
        };

        let now = Instant::now();
        let changed = self.last_state.as_deref() != Some(seen.state.as_str());
        let stale = self
            .last_sent
            .map_or(true, |sent| now.duration_since(sent) >= self.timing.heartbeat);
        if changed || stale {
            self.queued
                .push(StatusEvent::progress(&seen, now.duration_since(self.started)));
            self.last_state = Some(seen.state.clone());
            self.last_sent = Some(now);
        }

        if is_final_state(&seen.state) {
            self.queued.push(StatusEvent::finished(&seen));
            self.finished = true;
        }
    }
}

/// Event stream for one watcher. The first observation is taken immediately.
pub fn status_events(
    watcher: Arc<dyn StatusWatcher>,
    timing: EventTiming,
) -> impl Stream<Item = StatusEvent> + Send {
    let watch = Watch {
        watcher,
        timing,
        started: Instant::now(),
        last_state: None,
        last_sent: None,
        queued: vec![],
        polled: false,
        finished: false,
    };
    stream::unfold(watch, |mut watch| async move {
        let event = watch.next_event().await?;
        Some((event, watch))
    })
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use parking_lot::Mutex;

    use super::*;
    use crate::jobs::{JobStatus, JobUpdate};
    use crate::remote::cluster::tests::FakeCluster;
    use crate::remote::slurm::StatusRecord;

    #[derive(Debug)]
    struct ScriptedWatcher {
        states: Mutex<Vec<Result<&'static str, &'static str>>>,
    }

    impl ScriptedWatcher {
        fn new(states: Vec<Result<&'static str, &'static str>>) -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(states),
            })
        }
    }

    #[async_trait]
    impl StatusWatcher for ScriptedWatcher {
        async fn observe(&self) -> Result<Observation> {
            let mut states = self.states.lock();
            if states.is_empty() {
                return Err(eyre!("script exhausted"));
            }
            match states.remove(0) {
                Ok(state) => Ok(Observation {
                    state: state.to_string(),
                    elapsed: "0:10".to_string(),
                    detail: None,
                }),
                Err(e) => Err(eyre!(e)),
            }
        }
    }

    fn timing(poll: u64, heartbeat: u64) -> EventTiming {
        EventTiming {
            poll: Duration::from_secs(poll),
            heartbeat: Duration::from_secs(heartbeat),
        }
    }

    fn states(events: &[StatusEvent]) -> Vec<(Option<&str>, bool)> {
        events
            .iter()
            .map(|e| (e.state.as_deref(), e.done))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_and_final_event() {
        let watcher = ScriptedWatcher::new(vec![Ok("PENDING"), Ok("RUNNING"), Ok("COMPLETED")]);
        let events: Vec<StatusEvent> = status_events(watcher, timing(10, 7)).collect().await;
        assert_eq!(
            vec![
                (Some("PENDING"), false),
                (Some("RUNNING"), false),
                (Some("COMPLETED"), false),
                (Some("COMPLETED"), true),
            ],
            states(&events)
        );
        assert_eq!(1, events.iter().filter(|e| e.done).count());
        assert!(events[1]
            .message
            .as_deref()
            .unwrap()
            .starts_with("Job running (elapsed: 0:10, checking for: 10s)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_without_change() {
        let watcher = ScriptedWatcher::new(vec![
            Ok("RUNNING"),
            Ok("RUNNING"),
            Ok("RUNNING"),
            Ok("RUNNING"),
            Ok("RUNNING"),
            Ok("TIMEOUT"),
        ]);
        // Polls at 0, 2, 4, 6, 8 and 10 seconds.
        let events: Vec<StatusEvent> = status_events(watcher, timing(2, 7)).collect().await;
        assert_eq!(
            vec![
                (Some("RUNNING"), false),
                (Some("RUNNING"), false),
                (Some("TIMEOUT"), false),
                (Some("TIMEOUT"), true),
            ],
            states(&events)
        );
        assert!(events[1].message.as_deref().unwrap().contains("checking for: 8s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_error_ends_stream() {
        let watcher = ScriptedWatcher::new(vec![Ok("RUNNING"), Err("ssh: connection refused")]);
        let events: Vec<StatusEvent> = status_events(watcher, timing(10, 7)).collect().await;
        assert_eq!(2, events.len());
        assert!(events[1].done);
        assert_eq!(
            Some("Error checking status: ssh: connection refused"),
            events[1].error.as_deref()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_watcher_not_found_is_final() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.push_single(Ok(StatusRecord::new("PENDING", "0:00")));
        let watcher = Arc::new(SchedulerWatcher::new(cluster.clone(), "4242"));
        let events: Vec<StatusEvent> = status_events(watcher, timing(10, 7)).collect().await;
        assert_eq!(
            vec![
                (Some("PENDING"), false),
                (Some(NOT_FOUND), false),
                (Some(NOT_FOUND), true),
            ],
            states(&events)
        );
        assert_eq!(2, cluster.calls());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_watcher_follows_job() {
        let store = Arc::new(JobStore::new());
        store.create("j1", "genome.fasta", None);
        store.update("j1", JobUpdate::status(JobStatus::Running));

        let watcher = Arc::new(StoreWatcher::new(store.clone(), "j1"));
        let mut events = Box::pin(status_events(watcher, timing(10, 7)));

        let first = events.next().await.unwrap();
        assert_eq!(Some("RUNNING"), first.state.as_deref());

        store.update("j1", JobUpdate::status(JobStatus::Completed).with_phase("Done"));
        let second = events.next().await.unwrap();
        assert_eq!(Some("COMPLETED"), second.state.as_deref());
        assert!(second.message.as_deref().unwrap().ends_with("- Done"));
        assert!(events.next().await.unwrap().done);
        assert!(events.next().await.is_none());
    }

    #[test]
    fn test_serialized_shape() -> Result<()> {
        let event = StatusEvent::finished(&Observation {
            state: "COMPLETED".into(),
            elapsed: "0:42".into(),
            detail: None,
        });
        let value = serde_json::to_value(&event)?;
        assert_eq!(serde_json::json!("COMPLETED"), value["state"]);
        assert_eq!(serde_json::json!(true), value["done"]);
        assert!(value.get("error").is_none());
        assert!(value.get("message").is_none());

        let progress = StatusEvent::progress(
            &Observation {
                state: "RUNNING".into(),
                elapsed: "0:42".into(),
                detail: None,
            },
            Duration::from_secs(3),
        );
        assert!(serde_json::to_value(&progress)?.get("done").is_none());
        Ok(())
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!("0:00:05", format_elapsed(5));
        assert_eq!("1:01:01", format_elapsed(3661));
        assert_eq!("0:00:00", format_elapsed(-3));
    }
}
