//! Slurm queue and accounting lookups.
//!
//! State and elapsed-time strings are passed through exactly as the scheduler
//! prints them. The only interpretation done here is sorting a small closed
//! set of states into "terminal".

use std::collections::{HashMap, HashSet};

use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};

use crate::executor::RemoteExec;
use crate::log::*;

pub const SUBMITTED: &str = "SUBMITTED";
pub const CACHED: &str = "CACHED";
pub const NOT_FOUND: &str = "NOT_FOUND";
pub const ZERO_ELAPSED: &str = "0:00";

/// Scheduler states after which a job never changes again.
pub const TERMINAL_STATES: [&str; 4] = ["COMPLETED", "FAILED", "CANCELLED", "TIMEOUT"];

/// Whether the scheduler will report anything new for a job in `state`.
/// sacct decorates some states (`CANCELLED by 1234`), so only the first word
/// counts.
pub fn is_terminal(state: &str) -> bool {
    let head = state.split_whitespace().next().unwrap_or("");
    TERMINAL_STATES
        .iter()
        .any(|terminal| head.eq_ignore_ascii_case(terminal))
}

/// Scheduler job ids are numeric, optionally with an array suffix.
pub fn is_job_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_')
}

/// What the scheduler says about one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub state: String,
    pub elapsed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    pub exists: bool,
}

impl StatusRecord {
    pub fn new<S: Into<String>, E: Into<String>>(state: S, elapsed: E) -> Self {
        Self {
            state: state.into(),
            elapsed: elapsed.into(),
            job_name: None,
            exists: true,
        }
    }

    pub fn not_found() -> Self {
        Self {
            state: NOT_FOUND.into(),
            elapsed: ZERO_ELAPSED.into(),
            job_name: None,
            exists: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        is_terminal(&self.state)
    }
}

pub fn squeue_single_command(job_id: &str) -> String {
    format!("squeue -j {} --format=\"%T %M %j\" --noheader", job_id)
}

pub fn sacct_single_command(job_id: &str) -> String {
    format!(
        "sacct -j {} --format=JobName,State,Elapsed --noheader --parsable2 | head -1",
        job_id
    )
}

pub fn squeue_batch_command(job_ids: &[String]) -> String {
    format!(
        "squeue -j {} --format=\"%i %T %M\" --noheader 2>/dev/null",
        job_ids.join(",")
    )
}

pub fn sacct_batch_command(job_ids: &[String]) -> String {
    format!(
        "sacct -j {} --format=JobID,State,Elapsed --noheader --parsable2 2>/dev/null",
        job_ids.join(",")
    )
}

/// `RUNNING 1:23 rule_prodigal` → record. Missing columns fall back to
/// placeholders rather than failing.
pub fn parse_squeue_single(output: &str) -> Option<StatusRecord> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut parts = line.split_whitespace();
    let state = parts.next().unwrap_or("UNKNOWN");
    let elapsed = parts.next().unwrap_or(ZERO_ELAPSED);
    let mut record = StatusRecord::new(state, elapsed);
    record.job_name = parts.next().map(str::to_string);
    Some(record)
}

/// `margie|COMPLETED|00:10:02` → record.
pub fn parse_sacct_single(output: &str) -> Option<StatusRecord> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let parts: Vec<&str> = line.split('|').collect();
    let job_name = parts.first().copied().unwrap_or("UNKNOWN");
    let state = parts.get(1).copied().unwrap_or("UNKNOWN");
    let elapsed = parts.get(2).copied().unwrap_or(ZERO_ELAPSED);
    let mut record = StatusRecord::new(state, elapsed);
    record.job_name = Some(job_name.to_string());
    Some(record)
}

/// Lines of `%i %T %M`. Lines with fewer than three columns are skipped.
pub fn parse_squeue_batch(output: &str) -> HashMap<String, StatusRecord> {
    let mut out = HashMap::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            if !line.trim().is_empty() {
                debug!("skipping unparseable squeue line: {}", line);
            }
            continue;
        }
        out.insert(parts[0].to_string(), StatusRecord::new(parts[1], parts[2]));
    }
    out
}

/// Lines of `JobID|State|Elapsed`. Step rows (`123.batch`, `123.extern`)
/// are folded onto their parent id; the first row for an id wins.
pub fn parse_sacct_batch(output: &str) -> HashMap<String, StatusRecord> {
    let mut out = HashMap::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() < 3 {
            if !line.trim().is_empty() {
                debug!("skipping unparseable sacct line: {}", line);
            }
            continue;
        }
        let id = parts[0].split('.').next().unwrap_or(parts[0]);
        out.entry(id.to_string())
            .or_insert_with(|| StatusRecord::new(parts[1], parts[2]));
    }
    out
}

/// Look up one job: active queue first, then accounting history. A job
/// neither knows about is reported as [`NOT_FOUND`], not as an error.
#[tracing::instrument(skip(exec))]
pub async fn query_job_status<R: RemoteExec + ?Sized>(
    exec: &mut R,
    job_id: &str,
) -> Result<StatusRecord> {
    if !is_job_id(job_id) {
        return Err(eyre!("invalid scheduler job id: {:?}", job_id));
    }

    let squeue = exec.exec_capture(&squeue_single_command(job_id)).await?;
    if let Some(record) = parse_squeue_single(&squeue.stdout_lossy()) {
        return Ok(record);
    }

    let sacct = exec.exec_capture(&sacct_single_command(job_id)).await?;
    Ok(parse_sacct_single(&sacct.stdout_lossy()).unwrap_or_else(StatusRecord::not_found))
}

/// Look up many jobs in at most two round trips: one squeue over all ids,
/// then one sacct over the ids squeue did not report. Ids that neither knows
/// about are absent from the result.
#[tracing::instrument(skip(exec))]
pub async fn query_job_status_batch<R: RemoteExec + ?Sized>(
    exec: &mut R,
    job_ids: &[String],
) -> Result<HashMap<String, StatusRecord>> {
    let mut seen = HashSet::new();
    let ids: Vec<String> = job_ids
        .iter()
        .filter(|id| {
            let valid = is_job_id(id);
            if !valid {
                debug!("not querying non-scheduler id {:?}", id);
            }
            valid && seen.insert(id.as_str())
        })
        .cloned()
        .collect();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let squeue = exec.exec_capture(&squeue_batch_command(&ids)).await?;
    let mut results: HashMap<String, StatusRecord> = parse_squeue_batch(&squeue.stdout_lossy())
        .into_iter()
        .filter(|(id, _)| ids.contains(id))
        .collect();

    let missing: Vec<String> = ids
        .iter()
        .filter(|id| !results.contains_key(*id))
        .cloned()
        .collect();
    if !missing.is_empty() {
        let sacct = exec.exec_capture(&sacct_batch_command(&missing)).await?;
        for (id, record) in parse_sacct_batch(&sacct.stdout_lossy()) {
            if missing.contains(&id) {
                results.entry(id).or_insert(record);
            }
        }
    }

    Ok(results)
}

/// Heredoc delimiter used when writing batch scripts.
const SCRIPT_DELIMITER: &str = "HPCFLOW_BATCH_SCRIPT";

fn default_nodes() -> u32 {
    1
}

fn default_cpus() -> u32 {
    4
}

fn default_mem() -> String {
    "4G".into()
}

fn default_time_limit() -> String {
    "00:30:00".into()
}

fn default_job_name() -> String {
    "remote_job".into()
}

/// `#SBATCH` header values for a hand-written batch script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResources {
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default = "self::default_nodes")]
    pub nodes: u32,
    #[serde(default = "self::default_cpus")]
    pub cpus: u32,
    #[serde(default = "self::default_mem")]
    pub mem: String,
    #[serde(default = "self::default_time_limit")]
    pub time: String,
    #[serde(default = "self::default_job_name")]
    pub job_name: String,
}

impl Default for BatchResources {
    fn default() -> Self {
        Self {
            account: None,
            partition: None,
            nodes: default_nodes(),
            cpus: default_cpus(),
            mem: default_mem(),
            time: default_time_limit(),
            job_name: default_job_name(),
        }
    }
}

/// Full batch script: shebang, `#SBATCH` header, login profile, then `body`.
pub fn batch_script(body: &str, resources: &BatchResources) -> String {
    let mut script = String::from("#!/bin/bash\n");
    if let Some(account) = &resources.account {
        script.push_str(&format!("#SBATCH -A {}\n", account));
    }
    if let Some(partition) = &resources.partition {
        script.push_str(&format!("#SBATCH --partition={}\n", partition));
    }
    script.push_str(&format!(
        "#SBATCH --nodes={}\n#SBATCH --cpus-per-task={}\n#SBATCH --mem={}\n#SBATCH --time={}\n#SBATCH --job-name={}\n\nsource /etc/profile\n\n{}\n",
        resources.nodes, resources.cpus, resources.mem, resources.time, resources.job_name, body.trim_end()
    ));
    script
}

/// Write `script` to `script_path` with a quoted heredoc and hand it to
/// sbatch. `script_path` is used as is so that `~` still expands.
pub fn submit_batch_command(script_path: &str, script: &str) -> Result<String> {
    if script.lines().any(|line| line.trim() == SCRIPT_DELIMITER) {
        return Err(eyre!("batch script may not contain the line {}", SCRIPT_DELIMITER));
    }
    let dir = script_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(".");
    Ok(format!(
        "mkdir -p {dir} && cat > {path} << '{delim}' && sbatch {path}\n{script}\n{delim}\n",
        dir = dir,
        path = script_path,
        delim = SCRIPT_DELIMITER,
        script = script.trim_end(),
    ))
}

/// `Submitted batch job 12345` (possibly with `; cluster` suffixes) → `12345`.
pub fn parse_submission(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Submitted batch job")?;
        let id = rest.split_whitespace().next()?.trim_end_matches(';');
        is_job_id(id).then(|| id.to_string())
    })
}

/// Submit a batch script and return the scheduler job id. One round trip.
#[tracing::instrument(skip(exec, body))]
pub async fn submit_batch<R: RemoteExec + ?Sized>(
    exec: &mut R,
    script_path: &str,
    body: &str,
    resources: &BatchResources,
) -> Result<String> {
    let command = submit_batch_command(script_path, &batch_script(body, resources))?;
    let output = exec.exec_capture(&command).await?;
    let stdout = output.stdout_lossy();
    if output.exit_status != 0 {
        return Err(eyre!(
            "sbatch failed with status {}: {}",
            output.exit_status,
            output.stderr_lossy().trim()
        ));
    }
    match parse_submission(&stdout) {
        Some(id) => {
            info!("submitted batch job {}", id);
            Ok(id)
        }
        None => Err(eyre!("sbatch did not report a job id: {}", stdout.trim())),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;

    use super::*;
    use crate::executor::CommandOutput;

    /// Replays canned stdout per call and records every command and
    /// whatever was written to its stdin.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedExec {
        pub commands: Vec<String>,
        pub inputs: Vec<Vec<u8>>,
        pub replies: VecDeque<String>,
        pub exit_status: u32,
    }

    impl ScriptedExec {
        pub fn new(replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        pub fn failing(status: u32, replies: &[&str]) -> Self {
            Self {
                exit_status: status,
                ..Self::new(replies)
            }
        }
    }

    #[async_trait]
    impl RemoteExec for ScriptedExec {
        async fn exec_capture(&mut self, command: &str) -> Result<CommandOutput> {
            self.commands.push(command.to_string());
            let stdout = self.replies.pop_front().unwrap_or_default();
            let stderr = if self.exit_status == 0 {
                vec![]
            } else {
                b"command failed".to_vec()
            };
            Ok(CommandOutput {
                exit_status: self.exit_status,
                stdout: stdout.into_bytes(),
                stderr,
            })
        }

        async fn exec_with_input(&mut self, command: &str, input: &[u8]) -> Result<CommandOutput> {
            self.inputs.push(input.to_vec());
            self.exec_capture(command).await
        }
    }

    #[test]
    fn test_batch_script_header() {
        let resources = BatchResources {
            account: Some("lab".into()),
            partition: Some("cpu".into()),
            ..Default::default()
        };
        let script = batch_script("echo hi\n", &resources);
        assert!(script.starts_with("#!/bin/bash\n#SBATCH -A lab\n#SBATCH --partition=cpu\n"));
        assert!(script.contains("#SBATCH --cpus-per-task=4\n"));
        assert!(script.contains("#SBATCH --time=00:30:00\n"));
        assert!(script.ends_with("source /etc/profile\n\necho hi\n"));

        let bare = batch_script("true", &BatchResources::default());
        assert!(!bare.contains("#SBATCH -A"));
        assert!(!bare.contains("--partition"));
    }

    #[test]
    fn test_parse_submission() {
        assert_eq!(Some("12345".to_string()), parse_submission("Submitted batch job 12345\n"));
        assert_eq!(
            Some("77".to_string()),
            parse_submission("sbatch: note\nSubmitted batch job 77; on cluster negishi\n")
        );
        assert_eq!(None, parse_submission("sbatch: error: invalid partition\n"));
        assert_eq!(None, parse_submission("Submitted batch job\n"));
    }

    #[tokio::test]
    async fn test_submit_batch_writes_script_and_parses_id() -> Result<()> {
        let mut exec = ScriptedExec::new(&["Submitted batch job 4242\n"]);
        let id = submit_batch(&mut exec, "~/hpcflow-runs/batch/abc.sh", "srun hostname", &BatchResources::default()).await?;
        assert_eq!("4242", id);
        assert_eq!(1, exec.commands.len());
        let command = &exec.commands[0];
        assert!(command.starts_with(
            "mkdir -p ~/hpcflow-runs/batch && cat > ~/hpcflow-runs/batch/abc.sh << 'HPCFLOW_BATCH_SCRIPT' && sbatch ~/hpcflow-runs/batch/abc.sh\n#!/bin/bash\n"
        ));
        assert!(command.contains("srun hostname\nHPCFLOW_BATCH_SCRIPT\n"));
        Ok(())
    }

    #[tokio::test]
    async fn test_submit_batch_errors() {
        let mut exec = ScriptedExec::new(&["nothing useful\n"]);
        assert!(submit_batch(&mut exec, "~/b/a.sh", "true", &BatchResources::default()).await.is_err());

        let mut exec = ScriptedExec::failing(1, &[""]);
        assert!(submit_batch(&mut exec, "~/b/a.sh", "true", &BatchResources::default()).await.is_err());

        let mut exec = ScriptedExec::new(&[]);
        let sneaky = "echo hi\nHPCFLOW_BATCH_SCRIPT\nrm -rf ~";
        assert!(submit_batch(&mut exec, "~/b/a.sh", sneaky, &BatchResources::default()).await.is_err());
        assert!(exec.commands.is_empty());
    }

    #[test]
    fn test_terminal_states() {
        assert!(is_terminal("COMPLETED"));
        assert!(is_terminal("CANCELLED by 4242"));
        assert!(is_terminal("timeout"));
        assert!(!is_terminal("RUNNING"));
        assert!(!is_terminal("PENDING"));
        assert!(!is_terminal(SUBMITTED));
        assert!(!is_terminal(NOT_FOUND));
        assert!(!is_terminal(""));
    }

    #[test]
    fn test_job_id_shape() {
        assert!(is_job_id("10234567"));
        assert!(is_job_id("123_4"));
        assert!(!is_job_id("—"));
        assert!(!is_job_id("1; rm -rf ~"));
        assert!(!is_job_id(""));
    }

    #[test]
    fn test_parse_squeue_single() {
        let record = parse_squeue_single("  RUNNING 12:04 rule_prodigal\n").unwrap();
        assert_eq!("RUNNING", record.state);
        assert_eq!("12:04", record.elapsed);
        assert_eq!(Some("rule_prodigal".to_string()), record.job_name);
        assert!(parse_squeue_single("\n  \n").is_none());
    }

    #[test]
    fn test_parse_sacct_batch_folds_steps() {
        let output = "101|COMPLETED|00:01:10\n101.batch|COMPLETED|00:01:10\n101.extern|COMPLETED|00:01:11\n102|FAILED|00:00:03\ngarbage\n";
        let parsed = parse_sacct_batch(output);
        assert_eq!(2, parsed.len());
        assert_eq!(StatusRecord::new("COMPLETED", "00:01:10"), parsed["101"]);
        assert_eq!("FAILED", parsed["102"].state);
    }

    #[test]
    fn test_parse_squeue_batch_skips_short_lines() {
        let parsed = parse_squeue_batch("201 RUNNING 0:42\n202 PENDING\n\n");
        assert_eq!(1, parsed.len());
        assert_eq!("0:42", parsed["201"].elapsed);
    }

    #[tokio::test]
    async fn test_single_falls_back_to_sacct() -> Result<()> {
        let mut exec = ScriptedExec::new(&["", "margie|COMPLETED|00:10:02\n"]);
        let record = query_job_status(&mut exec, "555").await?;
        assert_eq!("COMPLETED", record.state);
        assert_eq!("00:10:02", record.elapsed);
        assert_eq!(Some("margie".to_string()), record.job_name);
        assert_eq!(2, exec.commands.len());
        assert!(exec.commands[0].starts_with("squeue -j 555"));
        assert!(exec.commands[1].starts_with("sacct -j 555"));
        Ok(())
    }

    #[tokio::test]
    async fn test_single_not_found_is_not_an_error() -> Result<()> {
        let mut exec = ScriptedExec::new(&["", ""]);
        let record = query_job_status(&mut exec, "556").await?;
        assert_eq!(StatusRecord::not_found(), record);
        assert!(!record.exists);
        Ok(())
    }

    #[tokio::test]
    async fn test_single_queue_hit_needs_one_round_trip() -> Result<()> {
        let mut exec = ScriptedExec::new(&["PENDING 0:00 snakejob\n"]);
        let record = query_job_status(&mut exec, "557").await?;
        assert_eq!("PENDING", record.state);
        assert_eq!(1, exec.commands.len());
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_uses_at_most_two_round_trips() -> Result<()> {
        let ids: Vec<String> = (1..=50).map(|i| (1000 + i).to_string()).collect();
        let mut exec = ScriptedExec::new(&[
            "1001 RUNNING 1:00\n1002 PENDING 0:00\n",
            "1003|COMPLETED|00:02:00\n1003.batch|COMPLETED|00:02:00\n1999|FAILED|0:01\n",
        ]);
        let results = query_job_status_batch(&mut exec, &ids).await?;
        assert_eq!(2, exec.commands.len());
        assert_eq!(3, results.len());
        assert_eq!("RUNNING", results["1001"].state);
        assert_eq!("COMPLETED", results["1003"].state);
        assert!(!results.contains_key("1999"));
        // the follow-up only asks about what squeue missed
        assert!(!exec.commands[1].contains("1001"));
        assert!(exec.commands[1].contains("1050"));
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_all_in_queue_skips_sacct() -> Result<()> {
        let ids = vec!["7".to_string(), "8".to_string()];
        let mut exec = ScriptedExec::new(&["7 RUNNING 0:10\n8 RUNNING 0:11\n"]);
        let results = query_job_status_batch(&mut exec, &ids).await?;
        assert_eq!(1, exec.commands.len());
        assert_eq!(2, results.len());
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_without_valid_ids_makes_no_calls() -> Result<()> {
        let mut exec = ScriptedExec::new(&[]);
        let results = query_job_status_batch(&mut exec, &["—".to_string()]).await?;
        assert!(results.is_empty());
        assert!(exec.commands.is_empty());
        Ok(())
    }
}
