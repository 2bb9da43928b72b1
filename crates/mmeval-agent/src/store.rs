use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use mmeval_job::{Dataset, JobConfig, JobId, JobStatus, JobView, RunMode};
use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::config::StalePolicy;
use crate::error::{JobError, Result};

/// Registry entry. The live child is never stored here; `pid` is for display.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub model: String,
    pub dataset: Dataset,
    pub work_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub mode: RunMode,
    pub config: JobConfig,
    pub status: JobStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

impl Job {
    pub fn view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            model: self.model.clone(),
            dataset: self.dataset.clone(),
            created_at: self.created_at,
            work_dir: self.work_dir.clone(),
            status: self.status,
            pid: self.pid,
            mode: self.mode,
            exit_code: self.exit_code,
            message: self.message.clone(),
            config: self.config.redacted(),
        }
    }

    fn from_view(v: JobView) -> Self {
        Self {
            id: v.id,
            model: v.model,
            dataset: v.dataset,
            work_dir: v.work_dir,
            created_at: v.created_at,
            mode: v.mode,
            config: v.config,
            status: v.status,
            pid: None,
            exit_code: v.exit_code,
            message: v.message,
        }
    }
}

/// Validated submit input, ready to register.
#[derive(Debug, Clone)]
pub struct JobDraft {
    pub model: String,
    pub dataset: Dataset,
    pub work_dir: Option<PathBuf>,
    pub mode: RunMode,
    pub config: JobConfig,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
    /// Jobs recorded as running that were marked failed on load.
    pub reaped: Vec<JobId>,
    /// Jobs left in a non-terminal status with nothing driving them.
    pub stale: Vec<JobId>,
}

#[derive(Debug)]
struct Inner {
    work_root: PathBuf,
    snapshot_path: PathBuf,
    jobs: Mutex<HashMap<JobId, Job>>,
    // Serializes snapshot writes so an older view never lands after a newer one.
    persist_lock: Mutex<()>,
}

#[derive(Debug, Clone)]
pub struct JobStore {
    inner: Arc<Inner>,
}

impl JobStore {
    pub fn new(work_root: impl Into<PathBuf>, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                work_root: work_root.into(),
                snapshot_path: snapshot_path.into(),
                jobs: Mutex::new(HashMap::new()),
                persist_lock: Mutex::new(()),
            }),
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.inner.snapshot_path
    }

    fn resolve_work_dir(&self, id: &JobId, requested: Option<&Path>) -> PathBuf {
        match requested {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => self.inner.work_root.join(p),
            None => self.inner.work_root.join(id.as_str()),
        }
    }

    pub async fn create(&self, draft: JobDraft) -> Result<Job> {
        let id = JobId::new();
        let work_dir = self.resolve_work_dir(&id, draft.work_dir.as_deref());

        tokio::fs::create_dir_all(&work_dir).await.map_err(|e| {
            JobError::Validation(format!(
                "cannot create work dir {}: {e}",
                work_dir.display()
            ))
        })?;
        let meta = tokio::fs::metadata(&work_dir).await.map_err(|e| {
            JobError::Validation(format!("cannot stat work dir {}: {e}", work_dir.display()))
        })?;
        if meta.permissions().readonly() {
            return Err(JobError::Validation(format!(
                "work dir {} is not writable",
                work_dir.display()
            )));
        }

        let job = Job {
            id: id.clone(),
            model: draft.model,
            dataset: draft.dataset,
            work_dir,
            created_at: Utc::now(),
            mode: draft.mode,
            config: draft.config,
            status: JobStatus::Pending,
            pid: None,
            exit_code: None,
            message: None,
        };

        {
            let mut jobs = self.inner.jobs.lock().await;
            if jobs.contains_key(&id) {
                return Err(JobError::Validation(format!("duplicate job id {id}")));
            }
            jobs.insert(id, job.clone());
        }

        self.persist_logged().await;
        Ok(job)
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        let jobs = self.inner.jobs.lock().await;
        jobs.get(&JobId(id.to_string()))
            .cloned()
            .ok_or_else(|| JobError::NotFound(format!("job {id}")))
    }

    pub async fn list(&self) -> Vec<Job> {
        let mut out: Vec<Job> = self.inner.jobs.lock().await.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn mark_running(&self, id: &JobId) -> Result<Job> {
        self.transition(id, JobStatus::Running, |_| {}).await
    }

    pub async fn mark_terminal(
        &self,
        id: &JobId,
        status: JobStatus,
        exit_code: Option<i32>,
        message: Option<String>,
    ) -> Result<Job> {
        self.transition(id, status, |job| {
            job.pid = None;
            job.exit_code = exit_code;
            job.message = message;
        })
        .await
    }

    async fn transition(
        &self,
        id: &JobId,
        next: JobStatus,
        update: impl FnOnce(&mut Job),
    ) -> Result<Job> {
        let job = {
            let mut jobs = self.inner.jobs.lock().await;
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| JobError::NotFound(format!("job {id}")))?;
            if !job.status.can_transition_to(next) {
                return Err(JobError::InvalidTransition {
                    from: job.status,
                    to: next,
                });
            }
            job.status = next;
            update(job);
            job.clone()
        };

        tracing::debug!(job_id = %id, status = %next, "job status changed");
        self.persist_logged().await;
        Ok(job)
    }

    pub async fn set_pid(&self, id: &JobId, pid: Option<u32>) {
        {
            let mut jobs = self.inner.jobs.lock().await;
            let Some(job) = jobs.get_mut(id) else {
                return;
            };
            job.pid = pid;
        }
        self.persist_logged().await;
    }

    /// Writes the whole registry to the snapshot file (tmp + rename).
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.inner.persist_lock.lock().await;

        let data = {
            let jobs = self.inner.jobs.lock().await;
            let views: BTreeMap<&str, JobView> =
                jobs.iter().map(|(k, v)| (k.as_str(), v.view())).collect();
            serde_json::to_vec_pretty(&views)
        }
        .map_err(|e| self.persist_error(e.to_string()))?;

        let path = &self.inner.snapshot_path;
        let tmp = path.with_extension("json.tmp");
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| self.persist_error(format!("create temp file: {e}")))?;
        f.write_all(&data)
            .await
            .map_err(|e| self.persist_error(format!("write temp file: {e}")))?;
        f.flush().await.ok();
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| self.persist_error(format!("rename temp file: {e}")))?;
        Ok(())
    }

    fn persist_error(&self, reason: String) -> JobError {
        JobError::Persistence {
            path: self.inner.snapshot_path.display().to_string(),
            reason,
        }
    }

    /// Never fails the caller; the failure is only logged.
    pub(crate) async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!(error = %e, "snapshot write failed");
        }
    }

    /// Repopulates the registry from the snapshot. Malformed entries are skipped;
    /// no loaded job carries a live process.
    pub async fn load(&self, policy: StalePolicy) -> LoadReport {
        let mut report = LoadReport::default();
        let raw = match tokio::fs::read(&self.inner.snapshot_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
            Err(e) => {
                tracing::warn!(error = %e, path = %self.inner.snapshot_path.display(), "snapshot unreadable");
                return report;
            }
        };
        let entries: serde_json::Map<String, serde_json::Value> =
            match serde_json::from_slice(&raw) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "snapshot is not a JSON object; ignoring");
                    return report;
                }
            };

        {
            let mut jobs = self.inner.jobs.lock().await;
            for (key, value) in entries {
                let view = match serde_json::from_value::<JobView>(value) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "skipping malformed snapshot entry");
                        report.skipped += 1;
                        continue;
                    }
                };
                let mut job = Job::from_view(view);
                match job.status {
                    JobStatus::Running if policy == StalePolicy::Fail => {
                        job.status = JobStatus::Failed;
                        job.message = Some("process lost across service restart".to_string());
                        report.reaped.push(job.id.clone());
                    }
                    JobStatus::Running | JobStatus::Pending => {
                        report.stale.push(job.id.clone());
                    }
                    JobStatus::Finished | JobStatus::Failed => {}
                }
                report.loaded += 1;
                jobs.entry(job.id.clone()).or_insert(job);
            }
        }

        if !report.reaped.is_empty() {
            self.persist_logged().await;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_dir_for;

    fn draft(dataset: &str) -> JobDraft {
        JobDraft {
            model: "lmdeploy".to_string(),
            dataset: Dataset::One(dataset.to_string()),
            work_dir: None,
            mode: RunMode::All,
            config: JobConfig::default(),
        }
    }

    fn store_in(root: &Path) -> JobStore {
        JobStore::new(root, root.join(".mmeval_jobs.json"))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_creates_yield_distinct_ids() {
        let root = temp_dir_for("store-ids");
        let store = store_in(&root);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create(draft(&format!("D{i}"))).await.unwrap().id
            }));
        }
        let mut ids = std::collections::HashSet::new();
        for h in handles {
            ids.insert(h.await.unwrap());
        }
        assert_eq!(ids.len(), 16);
        assert_eq!(store.list().await.len(), 16);
    }

    #[tokio::test]
    async fn create_makes_work_dir_and_starts_pending() {
        let root = temp_dir_for("store-create");
        let store = store_in(&root);
        let job = store.create(draft("DatasetX")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.work_dir.is_dir());
        assert_eq!(job.work_dir, root.join(job.id.as_str()));
        assert!(store.snapshot_path().is_file());
    }

    #[tokio::test]
    async fn relative_work_dir_lands_under_root() {
        let root = temp_dir_for("store-reldir");
        let store = store_in(&root);
        let mut d = draft("DatasetX");
        d.work_dir = Some(PathBuf::from("custom/run1"));
        let job = store.create(d).await.unwrap();
        assert_eq!(job.work_dir, root.join("custom/run1"));
    }

    #[tokio::test]
    async fn uncreatable_work_dir_is_a_validation_error() {
        let root = temp_dir_for("store-baddir");
        std::fs::create_dir_all(&root).unwrap();
        let blocker = root.join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let store = store_in(&root);
        let mut d = draft("DatasetX");
        d.work_dir = Some(blocker.join("sub"));
        let err = store.create(d).await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = store_in(&temp_dir_for("store-missing"));
        assert!(matches!(
            store.get("nope").await.unwrap_err(),
            JobError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn status_never_skips_or_regresses() {
        let store = store_in(&temp_dir_for("store-monotonic"));
        let job = store.create(draft("DatasetX")).await.unwrap();

        let err = store
            .mark_terminal(&job.id, JobStatus::Finished, Some(0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));

        store.mark_running(&job.id).await.unwrap();
        store.set_pid(&job.id, Some(4242)).await;
        let done = store
            .mark_terminal(&job.id, JobStatus::Failed, Some(3), None)
            .await
            .unwrap();
        assert_eq!(done.exit_code, Some(3));
        assert_eq!(done.pid, None);

        assert!(store.mark_running(&job.id).await.is_err());
        assert_eq!(store.get(job.id.as_str()).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_fail_create() {
        let root = temp_dir_for("store-persist-fail");
        std::fs::create_dir_all(&root).unwrap();
        let blocker = root.join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let store = JobStore::new(&root, blocker.join("snap.json"));
        let job = store.create(draft("DatasetX")).await.unwrap();
        assert!(matches!(
            store.persist().await.unwrap_err(),
            JobError::Persistence { .. }
        ));
        assert!(store.get(job.id.as_str()).await.is_ok());
    }

    async fn seeded_snapshot(root: &Path) -> (JobId, JobId, JobId, JobId) {
        let store = store_in(root);
        let pending = store.create(draft("P")).await.unwrap().id;
        let running = store.create(draft("R")).await.unwrap().id;
        let finished = store.create(draft("F")).await.unwrap().id;
        let failed = store.create(draft("X")).await.unwrap().id;

        store.mark_running(&running).await.unwrap();
        store.set_pid(&running, Some(999_999)).await;
        store.mark_running(&finished).await.unwrap();
        store
            .mark_terminal(&finished, JobStatus::Finished, Some(0), None)
            .await
            .unwrap();
        store.mark_running(&failed).await.unwrap();
        store
            .mark_terminal(&failed, JobStatus::Failed, Some(1), None)
            .await
            .unwrap();
        (pending, running, finished, failed)
    }

    #[tokio::test]
    async fn reload_reaps_running_jobs_by_default() {
        let root = temp_dir_for("store-reload-fail");
        let (pending, running, finished, failed) = seeded_snapshot(&root).await;

        let reloaded = store_in(&root);
        let report = reloaded.load(StalePolicy::Fail).await;
        assert_eq!(report.loaded, 4);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.reaped, vec![running.clone()]);
        assert_eq!(report.stale, vec![pending.clone()]);

        let status = |id: &JobId| {
            let reloaded = reloaded.clone();
            let id = id.clone();
            async move { reloaded.get(id.as_str()).await.unwrap() }
        };
        assert_eq!(status(&pending).await.status, JobStatus::Pending);
        assert_eq!(status(&finished).await.status, JobStatus::Finished);
        assert_eq!(status(&failed).await.status, JobStatus::Failed);

        // The running job is not resumed: its process is gone.
        let r = status(&running).await;
        assert_eq!(r.status, JobStatus::Failed);
        assert_eq!(r.pid, None);
        assert!(r.message.is_some());

        // The reaped status is durable.
        let again = store_in(&root);
        let report = again.load(StalePolicy::Fail).await;
        assert!(report.reaped.is_empty());
        assert_eq!(
            again.get(running.as_str()).await.unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn reload_can_keep_running_jobs_stale() {
        let root = temp_dir_for("store-reload-keep");
        let (_pending, running, _finished, _failed) = seeded_snapshot(&root).await;

        let reloaded = store_in(&root);
        let report = reloaded.load(StalePolicy::Keep).await;
        assert!(report.reaped.is_empty());
        assert!(report.stale.contains(&running));

        let r = reloaded.get(running.as_str()).await.unwrap();
        assert_eq!(r.status, JobStatus::Running);
        assert_eq!(r.pid, None);
    }

    #[tokio::test]
    async fn load_skips_malformed_entries() {
        let root = temp_dir_for("store-malformed");
        std::fs::create_dir_all(&root).unwrap();
        let good = serde_json::json!({
            "id": "abc",
            "model": "lmdeploy",
            "dataset": ["A", "B"],
            "created_at": "2025-01-02T03:04:05Z",
            "work_dir": "/tmp/abc",
            "status": "finished",
            "pid": null,
            "config": {"dry_run": true}
        });
        let snapshot = serde_json::json!({
            "abc": good,
            "broken": {"id": 5},
            "also-broken": "nope"
        });
        std::fs::write(
            root.join(".mmeval_jobs.json"),
            serde_json::to_vec(&snapshot).unwrap(),
        )
        .unwrap();

        let store = store_in(&root);
        let report = store.load(StalePolicy::Fail).await;
        assert_eq!(report.loaded, 1);
        assert_eq!(report.skipped, 2);
        let job = store.get("abc").await.unwrap();
        assert_eq!(job.dataset.names(), vec!["A", "B"]);
        assert!(job.config.dry_run);
    }

    #[tokio::test]
    async fn load_tolerates_garbage_file() {
        let root = temp_dir_for("store-garbage");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(".mmeval_jobs.json"), b"{not json").unwrap();
        let store = store_in(&root);
        assert_eq!(store.load(StalePolicy::Fail).await, LoadReport::default());
    }

    #[tokio::test]
    async fn snapshot_redacts_credentials() {
        let root = temp_dir_for("store-redact");
        let store = store_in(&root);
        let mut d = draft("DatasetX");
        d.config.lmdeploy_api_key = Some("sk-very-secret".to_string());
        store.create(d).await.unwrap();

        let raw = std::fs::read_to_string(store.snapshot_path()).unwrap();
        assert!(!raw.contains("sk-very-secret"));
        assert!(raw.contains(mmeval_job::REDACTED));
    }
}
