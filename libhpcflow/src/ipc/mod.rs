use serde::{Deserialize, Serialize};

use crate::remote::files::RemoteEntry;
use crate::remote::slurm::BatchResources;

/// Header carrying the caller's identity for owner checks.
pub const OWNER_HEADER: &str = "x-owner-id";

#[doc(hidden)]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    /// Input file path on the cluster.
    pub target: String,
    #[serde(default)]
    pub owner: Option<String>,
    /// Workflow to run; the controller's default when absent.
    #[serde(default)]
    pub workflow: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubmitResponse {
    pub job_id: String,
    pub accepted: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileListing {
    pub job_id: String,
    pub path: String,
    pub entries: Vec<RemoteEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    /// Script body placed after the generated `#SBATCH` header.
    pub script: String,
    #[serde(default)]
    pub resources: BatchResources,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BatchResponse {
    pub success: bool,
    pub job_id: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GenomeListing {
    pub path: String,
    pub genomes: Vec<RemoteEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub remote_path: String,
    pub file_size: u64,
    pub message: String,
}
