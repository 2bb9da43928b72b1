use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use mmeval_job::JobId;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

pub const SUMMARY_LOG: &str = "job.log";
pub const RUN_LOG_PREFIX: &str = "run_";
pub const RUN_LOG_SUFFIX: &str = ".log";
pub const RUN_TAG: &str = "[RUN]";

pub fn timestamp_ms(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

pub fn run_log_name(at: DateTime<Utc>) -> String {
    format!(
        "{RUN_LOG_PREFIX}{}{RUN_LOG_SUFFIX}",
        at.format("%Y%m%dT%H%M%SZ")
    )
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

/// Central append-only log shared by every job.
#[derive(Debug, Clone)]
pub struct ServiceLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl ServiceLog {
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = open_append(&path).await?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One write per call, so lines from concurrent jobs never split.
    async fn append(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut f = self.file.lock().await;
        f.write_all(bytes).await?;
        f.flush().await
    }
}

/// Dual-sink writer for one run: the per-run log plus the central log.
/// Every write is flushed immediately so followers see it promptly.
#[derive(Debug)]
pub struct LogMux {
    job_id: JobId,
    run: File,
    run_path: PathBuf,
    service: ServiceLog,
    write_errors: u64,
}

impl LogMux {
    /// Writes the summary log and creates the per-run log.
    pub async fn open(
        work_dir: &Path,
        job_id: &JobId,
        service: ServiceLog,
        started: DateTime<Utc>,
    ) -> std::io::Result<Self> {
        let run_name = run_log_name(started);
        let run_path = work_dir.join(&run_name);
        let summary_path = work_dir.join(SUMMARY_LOG);

        let mut summary = open_append(&summary_path).await?;
        summary
            .write_all(
                format!(
                    "Per-run log: {run_name}\nCreated at: {}\n",
                    started.format("%Y%m%dT%H%M%SZ")
                )
                .as_bytes(),
            )
            .await?;
        summary.flush().await?;

        let run = open_append(&run_path).await?;
        Ok(Self {
            job_id: job_id.clone(),
            run,
            run_path,
            service,
            write_errors: 0,
        })
    }

    pub fn run_log_path(&self) -> &Path {
        &self.run_path
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }

    fn note_error(&mut self, sink: &str, e: std::io::Error) {
        self.write_errors += 1;
        if self.write_errors == 1 {
            tracing::warn!(job_id = %self.job_id, sink, error = %e, "log write failed");
        }
    }

    async fn write_run(&mut self, bytes: &[u8]) {
        let res = async {
            self.run.write_all(bytes).await?;
            self.run.flush().await
        }
        .await;
        if let Err(e) = res {
            self.note_error("run", e);
        }
    }

    async fn write_service(&mut self, bytes: &[u8]) {
        if let Err(e) = self.service.append(bytes).await {
            self.note_error("service", e);
        }
    }

    /// Orchestrator message, timestamped to the millisecond.
    pub async fn log(&mut self, msg: &str) {
        let ts = timestamp_ms(Utc::now());
        self.write_run(format!("[{ts}] {msg}\n").as_bytes()).await;
        let line = format!("[{ts}] [{}] {msg}\n", self.job_id);
        self.write_service(line.as_bytes()).await;
    }

    /// Pipe-mode child line, tagged and timestamped like any message.
    pub async fn tagged(&mut self, line: &str) {
        self.log(&format!("{RUN_TAG} {line}")).await;
    }

    /// Terminal-mode child output, byte for byte, control sequences included.
    pub async fn raw(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.write_run(bytes).await;
        self.write_service(bytes).await;
    }

    /// Untimestamped text for the per-run transcript only.
    pub async fn transcript(&mut self, text: &str) {
        self.write_run(text.as_bytes()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_dir_for;
    use chrono::TimeZone;

    #[test]
    fn run_log_names_sort_by_time() {
        let a = Utc.with_ymd_and_hms(2025, 1, 9, 23, 59, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        assert_eq!(run_log_name(a), "run_20250109T235959Z.log");
        assert!(run_log_name(a) < run_log_name(b));
    }

    #[test]
    fn timestamps_have_millisecond_precision() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(timestamp_ms(at), "2023-11-14 22:13:20.123");
    }

    #[tokio::test]
    async fn open_writes_summary_naming_run_log() {
        let dir = temp_dir_for("mux-open");
        let service = ServiceLog::open(dir.join("svc.log")).await.unwrap();
        let id = JobId("job1".into());
        let mux = LogMux::open(&dir, &id, service, Utc::now()).await.unwrap();

        let summary = std::fs::read_to_string(dir.join(SUMMARY_LOG)).unwrap();
        let name = mux.run_log_path().file_name().unwrap().to_string_lossy();
        assert!(summary.starts_with(&format!("Per-run log: {name}\n")));
        assert!(mux.run_log_path().is_file());
    }

    #[tokio::test]
    async fn messages_reach_both_logs_with_prefixes() {
        let dir = temp_dir_for("mux-log");
        let service = ServiceLog::open(dir.join("svc.log")).await.unwrap();
        let id = JobId("job42".into());
        let mut mux = LogMux::open(&dir, &id, service.clone(), Utc::now())
            .await
            .unwrap();

        mux.log("Job starting").await;
        mux.tagged("epoch 1").await;

        let run = std::fs::read_to_string(mux.run_log_path()).unwrap();
        let lines: Vec<&str> = run.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] Job starting"));
        assert!(lines[1].ends_with("] [RUN] epoch 1"));

        let svc = std::fs::read_to_string(service.path()).unwrap();
        assert!(svc.lines().all(|l| l.contains("] [job42] ")));
        assert_eq!(mux.write_errors(), 0);
    }

    #[tokio::test]
    async fn raw_output_is_verbatim() {
        let dir = temp_dir_for("mux-raw");
        let service = ServiceLog::open(dir.join("svc.log")).await.unwrap();
        let mut mux = LogMux::open(&dir, &JobId("j".into()), service.clone(), Utc::now())
            .await
            .unwrap();

        let chunk = b"\x1b[1;32mProgress: 50%\x1b[0m\r\xff partial";
        mux.raw(chunk).await;

        assert_eq!(std::fs::read(mux.run_log_path()).unwrap(), chunk.to_vec());
        assert_eq!(std::fs::read(service.path()).unwrap(), chunk.to_vec());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_jobs_share_service_log_without_tearing() {
        let dir = temp_dir_for("mux-shared");
        let service = ServiceLog::open(dir.join("svc.log")).await.unwrap();

        let mut handles = Vec::new();
        for j in 0..4 {
            let service = service.clone();
            let work = dir.join(format!("w{j}"));
            handles.push(tokio::spawn(async move {
                let id = JobId(format!("job{j}"));
                let mut mux = LogMux::open(&work, &id, service, Utc::now()).await.unwrap();
                for i in 0..50 {
                    mux.log(&format!("message {i}")).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let svc = std::fs::read_to_string(service.path()).unwrap();
        let lines: Vec<&str> = svc.lines().collect();
        assert_eq!(lines.len(), 200);
        assert!(lines.iter().all(|l| l.starts_with('[') && l.contains("] [job")));
    }
}
