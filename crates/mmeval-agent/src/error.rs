use mmeval_job::JobStatus;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("job not finished (status: {status})")]
    NotFinished { status: JobStatus },

    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist snapshot {path}: {reason}")]
    Persistence { path: String, reason: String },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}

pub type Result<T> = std::result::Result<T, JobError>;

impl JobError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        JobError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "validation",
            JobError::NotFound(_) => "not_found",
            JobError::NotFinished { .. } => "not_finished",
            JobError::Spawn { .. } => "spawn_failed",
            JobError::Io { .. } => "io",
            JobError::Persistence { .. } => "persistence",
            JobError::InvalidTransition { .. } => "invalid_transition",
        }
    }

    /// Client errors are the caller's to fix; everything else is ours.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            JobError::Validation(_) | JobError::NotFound(_) | JobError::NotFinished { .. }
        )
    }

    fn hint(&self) -> Option<String> {
        match self {
            JobError::NotFinished { .. } => {
                Some("Poll the job status until it reports `finished`.".to_string())
            }
            JobError::Spawn { .. } => Some(
                "Check MMEVAL_PYTHON / MMEVAL_RUN_SCRIPT point at an installed evaluator."
                    .to_string(),
            ),
            _ => None,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: truncate_utf8(&self.to_string(), MAX_MESSAGE_BYTES),
            hint: self.hint().map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
        }
    }
}

/// Error body rendered by the request layer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() || parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
