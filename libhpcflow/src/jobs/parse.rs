//! Scraping the pipeline's log output.
//!
//! The engine and the scheduler plugin only emit free text, so every pattern
//! here is a contract with their output format. Each has a test against a
//! literal captured line.

use std::sync::LazyLock;

use regex::Regex;

use super::ContainerRef;
use crate::log::*;
use crate::remote::cluster::WORKDIR_MARKER;

pub const CONTAINER_MARKER: &str = "__CONTAINER__:";

/// Line the orchestrator prints for every step restored from the cache.
pub const CACHE_HIT_PREFIX: &str = "Cache HIT for ";

/// Phase shown once the engine has announced itself.
pub const ENGINE_PHASE: &str = "Running Snakemake";

#[allow(clippy::expect_used)]
static SLURM_SUBMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"SLURM jobid (\d+) \(log:.*?/slurm_logs/(?:rule_|group_[^_]+_)(\w+)/")
        .expect("constant regex pattern")
});

#[allow(clippy::expect_used)]
static SLURM_SUBMIT_FALLBACK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SLURM jobid (\d+)").expect("constant regex pattern"));

#[allow(clippy::expect_used)]
static STEPS_PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) of (\d+) steps \((\d+)%\) done").expect("constant regex pattern")
});

#[allow(clippy::expect_used)]
static CACHE_HIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Cache HIT for (\w+)").expect("constant regex pattern"));

#[allow(clippy::expect_used)]
static FAILED_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Error in rule (\w+):").expect("constant regex pattern"));

/// Rule name recorded when the submission line does not name one.
pub const UNKNOWN_RULE: &str = "unknown";

/// `<done> of <total> steps (<pct>%) done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: u32,
    pub total: u32,
    pub percent: u32,
}

/// Everything one log line told us. A single line can carry several
/// markers; the runner applies them in field order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LineFacts {
    pub work_dir: Option<String>,
    pub container: Option<ContainerRef>,
    pub cache_hit: Option<String>,
    /// `(scheduler job id, rule name)`.
    pub submission: Option<(String, String)>,
    pub progress: Option<Progress>,
    pub engine_started: bool,
}

impl LineFacts {
    pub fn is_empty(&self) -> bool {
        *self == LineFacts::default()
    }
}

/// Value after the work-dir marker, if the line is one.
pub fn work_dir(line: &str) -> Option<&str> {
    line.strip_prefix(WORKDIR_MARKER).map(str::trim)
}

/// Embedded container metadata. A marker with a payload that is not a JSON
/// object is ignored.
pub fn container(line: &str) -> Option<ContainerRef> {
    let (_, payload) = line.split_once(CONTAINER_MARKER)?;
    match serde_json::from_str::<ContainerRef>(payload.trim()) {
        Ok(container) => Some(container),
        Err(e) => {
            debug!("skipping malformed container payload {:?}: {}", payload, e);
            None
        }
    }
}

pub fn cache_hit(line: &str) -> Option<String> {
    CACHE_HIT.captures(line).map(|caps| caps[1].to_string())
}

/// A scheduler submission. The detailed form naming the rule wins over the
/// bare job id.
pub fn submission(line: &str) -> Option<(String, String)> {
    if let Some(caps) = SLURM_SUBMIT.captures(line) {
        return Some((caps[1].to_string(), caps[2].to_string()));
    }
    SLURM_SUBMIT_FALLBACK
        .captures(line)
        .map(|caps| (caps[1].to_string(), UNKNOWN_RULE.to_string()))
}

pub fn progress(line: &str) -> Option<Progress> {
    let caps = STEPS_PROGRESS.captures(line)?;
    Some(Progress {
        done: caps[1].parse().ok()?,
        total: caps[2].parse().ok()?,
        percent: caps[3].parse().ok()?,
    })
}

pub fn engine_started(line: &str) -> bool {
    line.to_lowercase().contains("snakemake")
}

/// Last progress line in `text`, if any.
pub fn last_progress(text: &str) -> Option<Progress> {
    text.lines().filter_map(progress).last()
}

/// Distinct rule names from `Error in rule <name>:` lines, in order of first
/// appearance.
pub fn failed_rules(text: &str) -> Vec<String> {
    let mut rules: Vec<String> = vec![];
    for caps in FAILED_RULE.captures_iter(text) {
        let rule = &caps[1];
        if !rules.iter().any(|seen| seen == rule) {
            rules.push(rule.to_string());
        }
    }
    rules
}

/// Run every matcher over one line.
pub fn scan(line: &str) -> LineFacts {
    if let Some(dir) = work_dir(line) {
        return LineFacts {
            work_dir: Some(dir.to_string()),
            ..Default::default()
        };
    }
    LineFacts {
        work_dir: None,
        container: container(line),
        cache_hit: cache_hit(line),
        submission: submission(line),
        progress: progress(line),
        engine_started: engine_started(line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_with_rule() {
        let line = "Job 3 has been submitted with SLURM jobid 48213377 (log: /home/u/run/.snakemake/slurm_logs/rule_prodigal/48213377.log).";
        assert_eq!(
            Some(("48213377".to_string(), "prodigal".to_string())),
            submission(line)
        );
    }

    #[test]
    fn test_submission_with_group() {
        let line = "Job 7 has been submitted with SLURM jobid 48213390 (log: /scratch/x/.snakemake/slurm_logs/group_annot_pfam/48213390.log).";
        assert_eq!(
            Some(("48213390".to_string(), "pfam".to_string())),
            submission(line)
        );
    }

    #[test]
    fn test_submission_fallback() {
        let line = "Submitted job 2 with external jobid 'SLURM jobid 48213401'.";
        assert_eq!(
            Some(("48213401".to_string(), UNKNOWN_RULE.to_string())),
            submission(line)
        );
        assert_eq!(None, submission("Submitted batch job 12"));
    }

    #[test]
    fn test_progress() {
        assert_eq!(
            Some(Progress {
                done: 2,
                total: 4,
                percent: 50
            }),
            progress("2 of 4 steps (50%) done")
        );
        assert_eq!(
            Some(Progress {
                done: 3,
                total: 3,
                percent: 100
            }),
            progress("[Thu Oct  1 10:02:11 2026] 3 of 3 steps (100%) done")
        );
        assert_eq!(None, progress("Finished job 0."));
    }

    #[test]
    fn test_cache_hit() {
        assert_eq!(Some("prodigal".to_string()), cache_hit("* Cache HIT for prodigal"));
        assert_eq!(None, cache_hit("Cache MISS for prodigal"));
    }

    #[test]
    fn test_container_payload() {
        let line = r#"__CONTAINER__:{"name":"pfam","version":"v1.0","sif":"/c/pfam.sif"}"#;
        let parsed = container(line).unwrap();
        assert_eq!(Some("pfam".to_string()), parsed.name);
        assert_eq!(Some("/c/pfam.sif".to_string()), parsed.sif);
        assert_eq!(None, container("__CONTAINER__:{not json"));
        assert_eq!(None, container("__CONTAINER__:[1,2]"));
        assert_eq!(None, container("no marker here"));
    }

    #[test]
    fn test_work_dir_marker() {
        assert_eq!(
            Some("/home/u/hpcflow-runs/2026-10-16-0930-abc123"),
            work_dir("__WORKDIR__:/home/u/hpcflow-runs/2026-10-16-0930-abc123")
        );
        let facts = scan("__WORKDIR__:/tmp/x snakemake");
        assert_eq!(Some("/tmp/x snakemake".to_string()), facts.work_dir);
        assert!(!facts.engine_started);
    }

    #[test]
    fn test_engine_started() {
        assert!(engine_started("Building DAG of jobs... (Snakemake 8.4.2)"));
        assert!(engine_started("snakemake -s Snakefile"));
        assert!(!engine_started("Building DAG of jobs..."));
    }

    #[test]
    fn test_scan_plain_line() {
        assert!(scan("Select jobs to execute...").is_empty());
    }

    #[test]
    fn test_failed_rules_are_distinct() {
        let stderr = "Error in rule stepB:\n    jobid: 2\nError in rule stepC:\nError in rule stepB:\n";
        assert_eq!(vec!["stepB", "stepC"], failed_rules(stderr));
        assert!(failed_rules("all good").is_empty());
    }

    #[test]
    fn test_last_progress_wins() {
        let stderr = "1 of 3 steps (33%) done\nnoise\n2 of 3 steps (67%) done\n";
        assert_eq!(2, last_progress(stderr).unwrap().done);
        assert_eq!(None, last_progress(""));
    }
}
