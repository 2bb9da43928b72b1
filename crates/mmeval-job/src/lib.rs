use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const REDACTED: &str = "<redacted>";

/// Opaque job identifier, unique within a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    /// Status only moves forward one step: pending -> running -> {finished, failed}.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Finished)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dataset name or an ordered sequence of names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dataset {
    One(String),
    Many(Vec<String>),
}

impl Dataset {
    pub fn names(&self) -> Vec<&str> {
        match self {
            Dataset::One(name) => vec![name.as_str()],
            Dataset::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }

    /// Rejects empty sequences and blank names.
    pub fn validate(&self) -> Result<(), String> {
        let names = self.names();
        if names.is_empty() {
            return Err("dataset list must not be empty".to_string());
        }
        if names.iter().any(|n| n.trim().is_empty()) {
            return Err("dataset names must be non-empty".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(","))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    All,
    Infer,
    Eval,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::All => "all",
            RunMode::Infer => "infer",
            RunMode::Eval => "eval",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the child's standard streams are attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    Pty,
    Pipe,
}

/// Optional run parameters. Empty strings count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lmdeploy_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lmdeploy_api_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lmdeploy_model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge_api_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge_model_name: Option<String>,
    #[serde(rename = "LMUData", skip_serializing_if = "Option::is_none")]
    pub lmu_data: Option<String>,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_pty: Option<bool>,
}

pub fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.trim().is_empty())
}

impl JobConfig {
    pub fn attach_mode(&self) -> AttachMode {
        if self.use_pty.unwrap_or(true) {
            AttachMode::Pty
        } else {
            AttachMode::Pipe
        }
    }

    /// True when enough is supplied to describe a custom model definition.
    pub fn has_model_credentials(&self) -> bool {
        non_empty(&self.lmdeploy_api_key).is_some() && non_empty(&self.lmdeploy_api_base).is_some()
    }

    pub fn redacted(&self) -> Self {
        let mask = |v: &Option<String>| non_empty(v).map(|_| REDACTED.to_string());
        Self {
            lmdeploy_api_key: mask(&self.lmdeploy_api_key),
            judge_api_key: mask(&self.judge_api_key),
            ..self.clone()
        }
    }
}

/// Submit input, as handed over by the request layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default, alias = "data")]
    pub dataset: Option<Dataset>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub config: JobConfig,
}

/// Serializable job view; also the snapshot entry format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    #[serde(alias = "job_id")]
    pub id: JobId,
    pub model: String,
    #[serde(alias = "data")]
    pub dataset: Dataset,
    pub created_at: DateTime<Utc>,
    pub work_dir: PathBuf,
    pub status: JobStatus,
    pub pid: Option<u32>,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, alias = "extra_args")]
    pub config: JobConfig,
}
