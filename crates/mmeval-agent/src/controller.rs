use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use futures_util::Stream;
use mmeval_job::{AttachMode, JobId, JobSpec, JobStatus, JobView};
use tokio::io::AsyncWriteExt;

use crate::config::AgentConfig;
use crate::dry_run;
use crate::error::{JobError, Result, format_error_chain};
use crate::launcher::{LaunchEnv, Launcher};
use crate::log_mux::{LogMux, SUMMARY_LOG, ServiceLog};
use crate::log_reader;
use crate::runner::{LaunchSpec, ProcessRunner, RunOutcome, channel_for};
use crate::store::{Job, JobDraft, JobStore};

const WAIT_POLL: Duration = Duration::from_millis(50);

struct Inner {
    config: AgentConfig,
    store: JobStore,
    launcher: Launcher,
    service_log: ServiceLog,
}

/// Entry point for callers: submits jobs, runs each on its own task, and
/// serves status, results and logs.
#[derive(Clone)]
pub struct JobController {
    inner: Arc<Inner>,
}

impl JobController {
    /// Opens the work root and central log, then reloads the snapshot.
    pub async fn open(config: AgentConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.work_root)
            .await
            .with_context(|| format!("create work root {}", config.work_root.display()))?;
        let service_log = ServiceLog::open(&config.service_log)
            .await
            .with_context(|| format!("open service log {}", config.service_log.display()))?;

        let store = JobStore::new(&config.work_root, config.snapshot_path());
        let report = store.load(config.stale_running).await;
        tracing::info!(
            loaded = report.loaded,
            skipped = report.skipped,
            reaped = report.reaped.len(),
            stale = report.stale.len(),
            "job snapshot loaded"
        );
        for id in &report.reaped {
            tracing::warn!(job_id = %id, "job was running before restart; marked failed");
        }
        for id in &report.stale {
            tracing::warn!(job_id = %id, "job has no live process after restart");
        }

        let launcher = Launcher::new(config.python.clone(), config.run_script.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                launcher,
                service_log,
            }),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub async fn submit(&self, spec: JobSpec) -> Result<JobView> {
        let dataset = spec
            .dataset
            .ok_or_else(|| JobError::Validation("dataset is required".to_string()))?;
        dataset.validate().map_err(JobError::Validation)?;

        let job = self
            .inner
            .store
            .create(JobDraft {
                model: self.inner.config.model.clone(),
                dataset,
                work_dir: spec.work_dir,
                mode: spec.mode,
                config: spec.config,
            })
            .await?;
        tracing::info!(
            job_id = %job.id,
            work_dir = %job.work_dir.display(),
            dry_run = job.config.dry_run,
            "job submitted"
        );

        let view = job.view();
        let this = self.clone();
        tokio::spawn(async move { this.run_job(job.id).await });
        Ok(view)
    }

    pub async fn get_status(&self, id: &str) -> Result<JobView> {
        Ok(self.inner.store.get(id).await?.view())
    }

    pub async fn list(&self) -> Vec<JobView> {
        self.inner.store.list().await.iter().map(Job::view).collect()
    }

    /// Waits until the job is finished or failed, or `timeout` elapses.
    /// Returns the last observed view either way.
    pub async fn wait_terminal(&self, id: &str, timeout: Duration) -> Result<JobView> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let view = self.get_status(id).await?;
            if view.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(view);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Files under the job's work dir, relative and sorted.
    pub async fn list_result_files(&self, id: &str) -> Result<Vec<String>> {
        let job = self.inner.store.get(id).await?;
        if job.status != JobStatus::Finished {
            return Err(JobError::NotFinished { status: job.status });
        }
        let root = job.work_dir.clone();
        match tokio::task::spawn_blocking(move || walk_relative(&root)).await {
            Ok(Ok(files)) => Ok(files),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(JobError::NotFound(
                format!("work dir {}", job.work_dir.display()),
            )),
            Ok(Err(e)) => Err(JobError::io("list results", e)),
            Err(e) => Err(JobError::io("list results", std::io::Error::other(e))),
        }
    }

    /// One result file of a finished job, resolved inside its work dir.
    pub async fn result_file(&self, id: &str, rel_path: Option<&str>) -> Result<PathBuf> {
        let job = self.inner.store.get(id).await?;
        if job.status != JobStatus::Finished {
            return Err(JobError::NotFinished { status: job.status });
        }
        let rel = rel_path.map(str::trim).filter(|p| !p.is_empty()).ok_or_else(|| {
            JobError::Validation("path is required (relative to the work dir)".to_string())
        })?;
        let path = job.work_dir.join(log_reader::normalize_rel_path(rel)?);
        if !log_reader::is_file(&path).await {
            return Err(JobError::NotFound(format!("result file {rel}")));
        }
        Ok(path)
    }

    pub async fn tail_log(&self, id: &str, path: Option<&str>, n: usize) -> Result<String> {
        let job = self.inner.store.get(id).await?;
        let log = log_reader::select_log(&job.work_dir, path).await?;
        let lines = log_reader::tail(&log, n, self.inner.config.tail_avg_line_bytes).await?;
        if lines.is_empty() {
            return Ok(String::new());
        }
        let mut text = lines.join("\n");
        text.push('\n');
        Ok(text)
    }

    pub async fn follow_log(
        &self,
        id: &str,
        path: Option<&str>,
        timeout: Duration,
    ) -> Result<impl Stream<Item = String> + Send + 'static> {
        let job = self.inner.store.get(id).await?;
        let log = log_reader::select_log(&job.work_dir, path).await?;
        Ok(log_reader::follow(
            log,
            timeout,
            self.inner.config.follow_poll,
        ))
    }

    async fn run_job(&self, id: JobId) {
        let job = match self.inner.store.mark_running(&id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "job could not start");
                return;
            }
        };

        let mut logs = match LogMux::open(
            &job.work_dir,
            &id,
            self.inner.service_log.clone(),
            Utc::now(),
        )
        .await
        {
            Ok(logs) => logs,
            Err(e) => {
                let msg = format!("cannot open job logs: {e}");
                tracing::error!(job_id = %id, error = %e, "cannot open job logs");
                append_summary(&job.work_dir, &msg).await;
                self.finish(&id, JobStatus::Failed, None, Some(msg)).await;
                return;
            }
        };

        logs.log(&format!(
            "Job starting. Mode: {}. Work dir: {}",
            job.mode,
            job.work_dir.display()
        ))
        .await;

        let outcome = if job.config.dry_run {
            match dry_run::simulate(&job, &mut logs).await {
                Ok(_) => RunOutcome {
                    status: JobStatus::Finished,
                    exit_code: None,
                    error: None,
                },
                Err(e) => {
                    let msg = format_error_chain(&e);
                    logs.log(&format!("[ERROR] Job failed with exception: {msg}"))
                        .await;
                    RunOutcome {
                        status: JobStatus::Failed,
                        exit_code: None,
                        error: Some(msg),
                    }
                }
            }
        } else {
            self.run_real(&job, &mut logs).await
        };

        if logs.write_errors() > 0 {
            tracing::warn!(job_id = %id, errors = logs.write_errors(), "job log writes failed");
        }
        self.finish(&id, outcome.status, outcome.exit_code, outcome.error)
            .await;
    }

    async fn run_real(&self, job: &Job, logs: &mut LogMux) -> RunOutcome {
        logs.log("[INFO] Real run mode. Preparing to execute the evaluator.")
            .await;

        let env = self.inner.launcher.build_environment(job);
        let names = if env.set.is_empty() {
            "None".to_string()
        } else {
            env.set.join(", ")
        };
        logs.log(&format!(
            "[DEBUG] Environment variables set for subprocess: {names}"
        ))
        .await;

        let side = match self.inner.launcher.build_side_config(job) {
            Ok(side) => side,
            Err(e) => {
                logs.log(&format!("[ERROR] Job failed with exception: {e}"))
                    .await;
                return RunOutcome {
                    status: JobStatus::Failed,
                    exit_code: None,
                    error: Some(e.to_string()),
                };
            }
        };

        let outcome = self
            .execute(job, &env, side.as_ref().map(|s| s.path()), logs)
            .await;

        if let Some(side) = side {
            let path = side.path().display().to_string();
            match side.close() {
                Ok(()) => {
                    logs.log(&format!("[DEBUG] Cleaned up temporary config file: {path}"))
                        .await
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, path = %path, error = %e, "side config cleanup failed");
                    logs.log(&format!(
                        "[WARN] Failed to remove temporary config file {path}: {e}"
                    ))
                    .await
                }
            }
        }
        outcome
    }

    async fn execute(
        &self,
        job: &Job,
        env: &LaunchEnv,
        side_config: Option<&Path>,
        logs: &mut LogMux,
    ) -> RunOutcome {
        let cfg = &self.inner.config;
        let command = self.inner.launcher.build_command(job, side_config);
        logs.log(&format!("[INFO] Executing command: {}", command.display()))
            .await;

        let mut runner = ProcessRunner::new(
            channel_for(job.config.attach_mode(), cfg.pty_cols, cfg.pty_rows),
            cfg.drain_grace,
        );
        logs.log(match runner.mode() {
            AttachMode::Pty => "[DEBUG] Using PTY for subprocess execution.",
            AttachMode::Pipe => "[DEBUG] Using PIPE for subprocess execution (no TTY).",
        })
        .await;

        let cwd = std::env::current_dir().unwrap_or_else(|_| job.work_dir.clone());
        let spec = LaunchSpec {
            command: &command,
            env,
            cwd: &cwd,
        };

        let child = match runner.spawn(&spec) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "spawn failed");
                logs.log(&format!("[ERROR] Job failed with exception: {e}"))
                    .await;
                return RunOutcome {
                    status: JobStatus::Failed,
                    exit_code: None,
                    error: Some(e.to_string()),
                };
            }
        };

        tracing::info!(job_id = %job.id, pid = ?child.pid, mode = ?child.mode, "child spawned");
        self.inner.store.set_pid(&job.id, child.pid).await;
        runner.drain(child, logs).await
    }

    async fn finish(
        &self,
        id: &JobId,
        status: JobStatus,
        exit_code: Option<i32>,
        message: Option<String>,
    ) {
        match self
            .inner
            .store
            .mark_terminal(id, status, exit_code, message)
            .await
        {
            Ok(job) => {
                tracing::info!(job_id = %id, status = %job.status, exit_code = ?job.exit_code, "job done")
            }
            Err(e) => tracing::error!(job_id = %id, error = %e, "cannot record job outcome"),
        }
    }
}

/// Last resort when the run log cannot be opened.
async fn append_summary(work_dir: &Path, msg: &str) {
    let res = async {
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(work_dir.join(SUMMARY_LOG))
            .await?;
        f.write_all(format!("[ERROR] {msg}\n").as_bytes()).await?;
        f.flush().await
    }
    .await;
    if let Err(e) = res {
        tracing::debug!(error = %e, "summary log append failed");
    }
}

fn walk_relative(root: &Path) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().into_owned());
            }
        }
    }
    out.sort();
    Ok(out)
}
