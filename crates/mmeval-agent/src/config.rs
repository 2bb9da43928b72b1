use std::{path::PathBuf, time::Duration};

const DEFAULT_TAIL_AVG_LINE_BYTES: u64 = 200;
const DEFAULT_FOLLOW_POLL_MS: u64 = 300;
const DEFAULT_DRAIN_GRACE_MS: u64 = 2000;
const DEFAULT_PTY_COLS: u64 = 120;
const DEFAULT_PTY_ROWS: u64 = 40;

pub const SNAPSHOT_FILE: &str = ".mmeval_jobs.json";
pub const SERVICE_LOG_FILE: &str = "mmeval_service.log";

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

fn clamp_or(v: Option<u64>, lo: u64, hi: u64, default: u64) -> u64 {
    v.map(|v| v.clamp(lo, hi)).unwrap_or(default)
}

fn absolutize(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    }
}

/// What to do with jobs the snapshot still records as `running`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StalePolicy {
    /// Mark them `failed`; their process did not survive the restart.
    Fail,
    /// Leave the recorded status untouched.
    Keep,
}

pub(crate) fn parse_stale_policy(raw: Option<&str>) -> StalePolicy {
    match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("keep") | Some("stale") => StalePolicy::Keep,
        _ => StalePolicy::Fail,
    }
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub work_root: PathBuf,
    pub service_log: PathBuf,
    pub python: String,
    pub run_script: PathBuf,
    pub model: String,
    pub tail_avg_line_bytes: u64,
    pub follow_poll: Duration,
    pub drain_grace: Duration,
    pub pty_cols: u16,
    pub pty_rows: u16,
    pub stale_running: StalePolicy,
}

impl AgentConfig {
    /// Defaults rooted at `root`, ignoring the environment.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let work_root = absolutize(root.into());
        Self {
            service_log: work_root.join(SERVICE_LOG_FILE),
            work_root,
            python: "python".to_string(),
            run_script: PathBuf::from("run.py"),
            model: "lmdeploy".to_string(),
            tail_avg_line_bytes: DEFAULT_TAIL_AVG_LINE_BYTES,
            follow_poll: Duration::from_millis(DEFAULT_FOLLOW_POLL_MS),
            drain_grace: Duration::from_millis(DEFAULT_DRAIN_GRACE_MS),
            pty_cols: DEFAULT_PTY_COLS as u16,
            pty_rows: DEFAULT_PTY_ROWS as u16,
            stale_running: StalePolicy::Fail,
        }
    }

    pub fn from_env() -> Self {
        let root = env_string("MMEVAL_ROOT").unwrap_or_else(|| "./outputs".to_string());
        let mut cfg = Self::with_root(root);

        if let Some(p) = env_string("MMEVAL_SERVICE_LOG") {
            cfg.service_log = absolutize(PathBuf::from(p));
        }
        if let Some(p) = env_string("MMEVAL_PYTHON") {
            cfg.python = p;
        }
        if let Some(p) = env_string("MMEVAL_RUN_SCRIPT") {
            cfg.run_script = absolutize(PathBuf::from(p));
        }
        if let Some(m) = env_string("MMEVAL_MODEL") {
            cfg.model = m;
        }

        cfg.tail_avg_line_bytes = clamp_or(
            env_u64("MMEVAL_TAIL_AVG_LINE_BYTES"),
            16,
            64 * 1024,
            DEFAULT_TAIL_AVG_LINE_BYTES,
        );
        cfg.follow_poll = Duration::from_millis(clamp_or(
            env_u64("MMEVAL_FOLLOW_POLL_MS"),
            10,
            5000,
            DEFAULT_FOLLOW_POLL_MS,
        ));
        cfg.drain_grace = Duration::from_millis(clamp_or(
            env_u64("MMEVAL_DRAIN_GRACE_MS"),
            100,
            60_000,
            DEFAULT_DRAIN_GRACE_MS,
        ));
        cfg.pty_cols = clamp_or(env_u64("MMEVAL_PTY_COLS"), 20, 1000, DEFAULT_PTY_COLS) as u16;
        cfg.pty_rows = clamp_or(env_u64("MMEVAL_PTY_ROWS"), 5, 500, DEFAULT_PTY_ROWS) as u16;
        cfg.stale_running = parse_stale_policy(env_string("MMEVAL_STALE_RUNNING").as_deref());
        cfg
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.work_root.join(SNAPSHOT_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_or_applies_bounds_and_default() {
        assert_eq!(clamp_or(None, 10, 20, 15), 15);
        assert_eq!(clamp_or(Some(5), 10, 20, 15), 10);
        assert_eq!(clamp_or(Some(50), 10, 20, 15), 20);
        assert_eq!(clamp_or(Some(12), 10, 20, 15), 12);
    }

    #[test]
    fn stale_policy_defaults_to_fail() {
        assert_eq!(parse_stale_policy(None), StalePolicy::Fail);
        assert_eq!(parse_stale_policy(Some("bogus")), StalePolicy::Fail);
        assert_eq!(parse_stale_policy(Some(" KEEP ")), StalePolicy::Keep);
    }

    #[test]
    fn with_root_derives_paths() {
        let cfg = AgentConfig::with_root("/srv/mmeval");
        assert_eq!(cfg.snapshot_path(), PathBuf::from("/srv/mmeval/.mmeval_jobs.json"));
        assert_eq!(cfg.service_log, PathBuf::from("/srv/mmeval/mmeval_service.log"));
        assert_eq!(cfg.stale_running, StalePolicy::Fail);
    }

    #[test]
    fn relative_root_is_made_absolute() {
        let cfg = AgentConfig::with_root("outputs");
        assert!(cfg.work_root.is_absolute());
        assert!(cfg.work_root.ends_with("outputs"));
    }
}
