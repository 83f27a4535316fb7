use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{ContainerRef, Job, JobStatus, JobUpdate, SubJob};
use crate::log::*;
use crate::remote::slurm::{StatusRecord, CACHED, SUBMITTED};

/// Scheduler id used for steps that were restored from the output cache and
/// never reached the scheduler.
pub const CACHED_SUB_JOB_ID: &str = "—";

/// Elapsed time of a sub-job the scheduler has not reported on yet.
pub const INITIAL_ELAPSED: &str = "00:00:00";

/// In-memory table of jobs.
///
/// The outer lock only guards membership; every record has its own lock, so
/// the runner and reconciliation loop of one job never contend with another
/// job. No lock is ever held across an `.await`.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<String, Arc<Mutex<Job>>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, job_id: &str) -> Option<Arc<Mutex<Job>>> {
        self.jobs.read().get(job_id).cloned()
    }

    /// Apply `f` to the job if it exists. Returns whether it did.
    fn with_job<F: FnOnce(&mut Job)>(&self, job_id: &str, f: F) -> bool {
        match self.record(job_id) {
            Some(record) => {
                f(&mut record.lock());
                true
            }
            None => {
                debug!("ignoring update for unknown job {}", job_id);
                false
            }
        }
    }

    /// Register a new pending job. If the id is already taken the existing
    /// job is left alone and returned.
    pub fn create<S: Into<String>>(&self, job_id: &str, target: S, owner: Option<String>) -> Job {
        let mut jobs = self.jobs.write();
        if let Some(existing) = jobs.get(job_id) {
            warn!("job {} already exists, not replacing it", job_id);
            return existing.lock().clone();
        }
        let job = Job::new(job_id, target, owner);
        jobs.insert(job_id.to_string(), Arc::new(Mutex::new(job.clone())));
        info!("created job {}", job_id);
        job
    }

    /// Snapshot of the job as it is right now.
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.record(job_id).map(|record| record.lock().clone())
    }

    pub fn exists(&self, job_id: &str) -> bool {
        self.jobs.read().contains_key(job_id)
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.record(job_id).map(|record| record.lock().status)
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.read().keys().cloned().collect()
    }

    /// Apply the set fields of `update`. A status change that would move the
    /// job backwards, or out of a terminal state, is dropped; the other
    /// fields still apply.
    pub fn update(&self, job_id: &str, update: JobUpdate) -> bool {
        self.with_job(job_id, |job| {
            if let Some(status) = update.status {
                if job.status.can_become(status) {
                    job.status = status;
                } else {
                    warn!(
                        "refusing status change {} -> {} for job {}",
                        job.status, status, job_id
                    );
                }
            }
            if let Some(phase) = update.phase {
                job.phase = phase;
            }
            if let Some(work_dir) = update.work_dir {
                job.work_dir = Some(work_dir);
            }
            if let Some(done) = update.steps_done {
                job.steps_done = done;
            }
            if let Some(total) = update.steps_total {
                job.steps_total = total;
            }
            if let Some(percent) = update.progress_percent {
                job.progress_percent = percent;
            }
        })
    }

    /// Append one line (plus newline) to the job log.
    pub fn append_log(&self, job_id: &str, line: &str) -> bool {
        self.with_job(job_id, |job| {
            job.log.push_str(line);
            job.log.push('\n');
        })
    }

    pub fn add_sub_job(&self, job_id: &str, scheduler_job_id: &str, rule_name: &str) -> bool {
        self.push_sub_job(job_id, scheduler_job_id, rule_name, SUBMITTED)
    }

    /// Record a step that was satisfied from the output cache. It is born
    /// terminal so the reconciliation loop never asks the scheduler about it.
    pub fn add_cached_sub_job(&self, job_id: &str, rule_name: &str) -> bool {
        self.push_sub_job(job_id, CACHED_SUB_JOB_ID, rule_name, CACHED)
    }

    fn push_sub_job(&self, job_id: &str, scheduler_job_id: &str, rule_name: &str, state: &str) -> bool {
        self.with_job(job_id, |job| {
            job.sub_jobs.push(SubJob {
                scheduler_job_id: scheduler_job_id.to_string(),
                rule_name: rule_name.to_string(),
                state: state.to_string(),
                elapsed: INITIAL_ELAPSED.to_string(),
            })
        })
    }

    pub fn add_container(&self, job_id: &str, container: ContainerRef) -> bool {
        self.with_job(job_id, |job| job.containers.push(container))
    }

    pub fn list_sub_jobs(&self, job_id: &str) -> Vec<SubJob> {
        self.record(job_id)
            .map(|record| record.lock().sub_jobs.clone())
            .unwrap_or_default()
    }

    /// Write scheduler answers back onto every sub-job with a matching id.
    /// Cached entries are never touched.
    pub fn apply_scheduler_statuses(&self, job_id: &str, statuses: &HashMap<String, StatusRecord>) -> bool {
        self.with_job(job_id, |job| {
            for sub_job in job.sub_jobs.iter_mut() {
                if sub_job.state == CACHED {
                    continue;
                }
                if let Some(record) = statuses.get(&sub_job.scheduler_job_id) {
                    sub_job.state = record.state.clone();
                    sub_job.elapsed = record.elapsed.clone();
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_get() {
        let store = JobStore::new();
        let job = store.create("j1", "/data/genome.fasta", Some("alice".into()));
        assert_eq!(JobStatus::Pending, job.status);
        assert_eq!("Initializing", job.phase);

        let fetched = store.get("j1").unwrap();
        assert_eq!(Some("alice".to_string()), fetched.owner_id);
        assert!(store.get("j2").is_none());
        assert!(store.status("j2").is_none());
    }

    #[test]
    fn test_create_keeps_existing_job() {
        let store = JobStore::new();
        store.create("j1", "/data/genome.fasta", Some("alice".into()));
        store.update("j1", JobUpdate::status(JobStatus::Running));

        let again = store.create("j1", "/data/other.fasta", None);
        assert_eq!("/data/genome.fasta", again.target);
        assert_eq!(JobStatus::Running, again.status);
        assert_eq!(Some("alice".to_string()), store.get("j1").unwrap().owner_id);
        assert_eq!(1, store.job_ids().len());
    }

    #[test]
    fn test_status_is_monotonic() {
        let store = JobStore::new();
        store.create("j1", "t", None);
        store.update("j1", JobUpdate::status(JobStatus::Running));
        store.update("j1", JobUpdate::status(JobStatus::Failed).with_phase("Broken"));
        store.update("j1", JobUpdate::status(JobStatus::Completed).with_phase("Done"));
        store.update("j1", JobUpdate::status(JobStatus::Running));

        let job = store.get("j1").unwrap();
        assert_eq!(JobStatus::Failed, job.status);
        // The phase still follows the last write.
        assert_eq!("Done", job.phase);
    }

    #[test]
    fn test_log_only_appends() {
        let store = JobStore::new();
        store.create("j1", "t", None);
        store.append_log("j1", "one");
        store.append_log("j1", "");
        store.append_log("j1", "two");
        assert_eq!("one\n\ntwo\n", store.get("j1").unwrap().log);
        assert!(!store.append_log("nope", "lost"));
    }

    #[test]
    fn test_sub_jobs() {
        let store = JobStore::new();
        store.create("j1", "t", None);
        store.add_sub_job("j1", "1001", "prodigal");
        store.add_cached_sub_job("j1", "pfam");

        let subs = store.list_sub_jobs("j1");
        assert_eq!(2, subs.len());
        assert_eq!(SUBMITTED, subs[0].state);
        assert_eq!(INITIAL_ELAPSED, subs[0].elapsed);
        assert_eq!(CACHED_SUB_JOB_ID, subs[1].scheduler_job_id);
        assert_eq!(CACHED, subs[1].state);
        assert!(store.list_sub_jobs("missing").is_empty());
    }

    #[test]
    fn test_apply_scheduler_statuses() {
        let store = JobStore::new();
        store.create("j1", "t", None);
        store.add_sub_job("j1", "1001", "prodigal");
        store.add_sub_job("j1", "1002", "pfam");
        store.add_cached_sub_job("j1", "cog");

        let mut statuses = HashMap::new();
        statuses.insert("1001".to_string(), StatusRecord::new("COMPLETED", "00:04:10"));
        statuses.insert(CACHED_SUB_JOB_ID.to_string(), StatusRecord::new("FAILED", "0:00"));
        store.apply_scheduler_statuses("j1", &statuses);

        let subs = store.list_sub_jobs("j1");
        assert_eq!("COMPLETED", subs[0].state);
        assert_eq!("00:04:10", subs[0].elapsed);
        assert_eq!(SUBMITTED, subs[1].state);
        assert_eq!(CACHED, subs[2].state);
    }

    #[test]
    fn test_concurrent_writers() {
        let store = Arc::new(JobStore::new());
        store.create("j1", "t", None);
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        store.append_log("j1", &format!("{}-{}", n, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(800, store.get("j1").unwrap().log.lines().count());
    }
}
