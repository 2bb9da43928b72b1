use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
};

use mmeval_job::{JobConfig, RunMode, non_empty};

use crate::error::{JobError, Result};
use crate::store::Job;

/// Config fields forwarded to the child as environment variables.
fn env_overlay(c: &JobConfig) -> [(&'static str, &Option<String>); 7] {
    [
        ("LMDEPLOY_API_KEY", &c.lmdeploy_api_key),
        ("LMDEPLOY_API_BASE", &c.lmdeploy_api_base),
        ("LMDEPLOY_MODEL_NAME", &c.lmdeploy_model_name),
        ("OPENAI_API_KEY", &c.judge_api_key),
        ("OPENAI_API_BASE", &c.judge_api_base),
        ("LOCAL_LLM", &c.judge_model_name),
        ("LMUData", &c.lmu_data),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct LaunchEnv {
    /// Full child environment: the service's own plus the overlay.
    pub vars: BTreeMap<String, String>,
    /// Names of overlay variables actually set. Values are never logged.
    pub set: Vec<&'static str>,
}

/// Temporary model-definition file, removed when dropped.
#[derive(Debug)]
pub struct SideConfig {
    path: tempfile::TempPath,
}

impl SideConfig {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(self) -> std::io::Result<()> {
        self.path.close()
    }
}

#[derive(Debug, Clone)]
pub struct Launcher {
    python: String,
    run_script: PathBuf,
}

impl Launcher {
    pub fn new(python: impl Into<String>, run_script: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            run_script: run_script.into(),
        }
    }

    pub fn build_command(&self, job: &Job, side_config: Option<&Path>) -> LaunchCommand {
        let mut args = vec![self.run_script.display().to_string()];

        args.push("--data".to_string());
        args.extend(job.dataset.names().into_iter().map(str::to_string));
        args.push("--model".to_string());
        args.push(job.model.clone());
        args.push("--work-dir".to_string());
        args.push(job.work_dir.display().to_string());
        args.push("--reuse".to_string());

        if job.mode != RunMode::All {
            args.push("--mode".to_string());
            args.push(job.mode.as_str().to_string());
        }
        if let Some(p) = side_config {
            args.push("--config".to_string());
            args.push(p.display().to_string());
        }

        LaunchCommand {
            program: self.python.clone(),
            args,
        }
    }

    pub fn build_environment(&self, job: &Job) -> LaunchEnv {
        let mut vars: BTreeMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        let mut set = Vec::new();
        for (name, value) in env_overlay(&job.config) {
            if let Some(v) = non_empty(value) {
                vars.insert(name.to_string(), v.to_string());
                set.push(name);
            }
        }
        LaunchEnv { vars, set }
    }

    /// Writes a minimal model definition when credentials were supplied.
    pub fn build_side_config(&self, job: &Job) -> Result<Option<SideConfig>> {
        if !job.config.has_model_credentials() {
            return Ok(None);
        }

        let mut model = serde_json::Map::new();
        model.insert("class".into(), "LMDeployAPI".into());
        if let Some(k) = non_empty(&job.config.lmdeploy_api_key) {
            model.insert("key".into(), k.into());
        }
        if let Some(b) = non_empty(&job.config.lmdeploy_api_base) {
            model.insert("api_base".into(), b.into());
        }
        if let Some(m) = non_empty(&job.config.lmdeploy_model_name) {
            model.insert("model".into(), m.into());
        }
        let mut models = serde_json::Map::new();
        models.insert(job.model.clone(), serde_json::Value::Object(model));
        let doc = serde_json::json!({ "model": models, "data": {} });

        let mut file = tempfile::Builder::new()
            .prefix("mmeval_config_")
            .suffix(".json")
            .tempfile()
            .map_err(|e| JobError::io("create side config", e))?;
        let data = serde_json::to_vec(&doc)
            .map_err(|e| JobError::io("serialize side config", e.into()))?;
        file.write_all(&data)
            .and_then(|_| file.flush())
            .map_err(|e| JobError::io("write side config", e))?;

        Ok(Some(SideConfig {
            path: file.into_temp_path(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mmeval_job::{Dataset, JobId, JobStatus};

    fn job(dataset: Dataset, config: JobConfig) -> Job {
        Job {
            id: JobId::new(),
            model: "lmdeploy".to_string(),
            dataset,
            work_dir: PathBuf::from("/work/j1"),
            created_at: Utc::now(),
            mode: RunMode::All,
            config,
            status: JobStatus::Pending,
            pid: None,
            exit_code: None,
            message: None,
        }
    }

    fn launcher() -> Launcher {
        Launcher::new("python", "/opt/vlmeval/run.py")
    }

    #[test]
    fn command_for_single_dataset() {
        let j = job(Dataset::One("MMBench".into()), JobConfig::default());
        let cmd = launcher().build_command(&j, None);
        assert_eq!(cmd.program, "python");
        assert_eq!(
            cmd.args,
            vec![
                "/opt/vlmeval/run.py",
                "--data",
                "MMBench",
                "--model",
                "lmdeploy",
                "--work-dir",
                "/work/j1",
                "--reuse"
            ]
        );
    }

    #[test]
    fn command_repeats_dataset_values_and_appends_mode_and_config() {
        let mut j = job(
            Dataset::Many(vec!["A".into(), "B".into()]),
            JobConfig::default(),
        );
        j.mode = RunMode::Infer;
        let cmd = launcher().build_command(&j, Some(Path::new("/tmp/c.json")));
        let line = cmd.display();
        assert!(line.contains("--data A B --model"));
        assert!(line.ends_with("--reuse --mode infer --config /tmp/c.json"));
    }

    #[test]
    fn environment_overlays_only_present_fields() {
        let cfg = JobConfig {
            lmdeploy_api_key: Some("k1".into()),
            lmdeploy_api_base: Some("".into()),
            judge_model_name: Some("qwen".into()),
            lmu_data: Some("/datasets".into()),
            ..Default::default()
        };
        let env = launcher().build_environment(&job(Dataset::One("A".into()), cfg));
        assert_eq!(env.set, vec!["LMDEPLOY_API_KEY", "LOCAL_LLM", "LMUData"]);
        assert_eq!(env.vars.get("LMDEPLOY_API_KEY").map(String::as_str), Some("k1"));
        assert_eq!(env.vars.get("LOCAL_LLM").map(String::as_str), Some("qwen"));
        // Inherits the service environment.
        if let Ok(path) = std::env::var("PATH") {
            assert_eq!(env.vars.get("PATH"), Some(&path));
        }
    }

    #[test]
    fn environment_without_config_sets_nothing() {
        let env = launcher().build_environment(&job(Dataset::One("A".into()), JobConfig::default()));
        assert!(env.set.is_empty());
    }

    #[test]
    fn no_side_config_without_credentials() {
        let cfg = JobConfig {
            lmdeploy_api_key: Some("k".into()),
            ..Default::default()
        };
        let side = launcher()
            .build_side_config(&job(Dataset::One("A".into()), cfg))
            .unwrap();
        assert!(side.is_none());
    }

    #[test]
    fn side_config_describes_model_and_is_removed() {
        let cfg = JobConfig {
            lmdeploy_api_key: Some("k".into()),
            lmdeploy_api_base: Some("http://127.0.0.1:23333/v1".into()),
            lmdeploy_model_name: Some("internvl".into()),
            ..Default::default()
        };
        let side = launcher()
            .build_side_config(&job(Dataset::One("A".into()), cfg))
            .unwrap()
            .expect("side config");
        let path = side.path().to_path_buf();
        let v: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(v["model"]["lmdeploy"]["class"], "LMDeployAPI");
        assert_eq!(v["model"]["lmdeploy"]["api_base"], "http://127.0.0.1:23333/v1");
        assert_eq!(v["model"]["lmdeploy"]["model"], "internvl");

        side.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn side_config_is_removed_on_drop() {
        let cfg = JobConfig {
            lmdeploy_api_key: Some("k".into()),
            lmdeploy_api_base: Some("http://x".into()),
            ..Default::default()
        };
        let path = {
            let side = launcher()
                .build_side_config(&job(Dataset::One("A".into()), cfg))
                .unwrap()
                .unwrap();
            side.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
