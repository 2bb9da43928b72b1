use std::path::PathBuf;

use anyhow::Context;
use serde::Serialize;

use crate::log_mux::LogMux;
use crate::store::Job;

pub const PREDICTION_FILE: &str = "fake_prediction.json";
const PREDICTION_TEXT: &str = "This is a dry-run fake prediction.";
const PROGRESS_LINE: &str = "\x1b[1;32m[SIMULATED-TTY] Progress: 100%\x1b[0m\n";

#[derive(Debug, Serialize)]
struct FakePrediction {
    index: Vec<u32>,
    prediction: Vec<&'static str>,
}

/// Stands in for the evaluator: synthetic transcript plus one result artifact.
/// Returns the artifact path.
pub async fn simulate(job: &Job, logs: &mut LogMux) -> anyhow::Result<PathBuf> {
    logs.log("[INFO] Dry-run mode enabled. No real evaluation will be performed.")
        .await;
    logs.transcript(&format!(
        "Dry-run: no real evaluation performed.\nModel: {}\nData: {}\nWriting fake prediction file...\n",
        job.model, job.dataset
    ))
    .await;
    logs.transcript(PROGRESS_LINE).await;

    let fake = FakePrediction {
        index: vec![0],
        prediction: vec![PREDICTION_TEXT],
    };
    let path = job.work_dir.join(PREDICTION_FILE);
    let data = serde_json::to_vec_pretty(&fake).context("serialize fake prediction")?;
    tokio::fs::write(&path, data)
        .await
        .with_context(|| format!("write {}", path.display()))?;

    logs.log("[INFO] Dry-run finished successfully.").await;
    Ok(path)
}
