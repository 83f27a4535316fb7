//! Provenance: one row per pipeline run, kept beside the cache.

use std::fmt;
use std::path::Path;

use color_eyre::eyre::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{now_rfc3339, OutputCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => f.write_str("success"),
            RunStatus::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub input_hash: String,
    pub workflow_name: String,
    pub input_path: String,
    pub rules_completed: u32,
    pub status: String,
    pub loaded_at: String,
}

impl OutputCache {
    /// Append a run-log row and return its generated id.
    pub fn record_run(
        &self,
        input_hash: &str,
        workflow_name: &str,
        input_path: &Path,
        rules_completed: u32,
        status: RunStatus,
    ) -> Result<String> {
        let conn = self.open()?;
        let run_id = nanoid::nanoid!();
        conn.execute(
            "INSERT INTO run_log \
             (run_id, input_hash, workflow_name, input_path, rules_completed, status, loaded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                input_hash,
                workflow_name,
                input_path.display().to_string(),
                rules_completed,
                status.to_string(),
                now_rfc3339(),
            ],
        )?;
        Ok(run_id)
    }

    /// Most recent runs first.
    pub fn runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        if !self.path().exists() {
            return Ok(vec![]);
        }
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, input_hash, workflow_name, input_path, rules_completed, status, loaded_at \
             FROM run_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RunRecord {
                run_id: row.get(0)?,
                input_hash: row.get(1)?,
                workflow_name: row.get(2)?,
                input_path: row.get(3)?,
                rules_completed: row.get(4)?,
                status: row.get(5)?,
                loaded_at: row.get(6)?,
            })
        })?;
        let mut runs = vec![];
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }
}
