use std::{io::Write, path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

use mmeval_agent::config::{AgentConfig, StalePolicy};
use mmeval_agent::log_reader::{DEFAULT_FOLLOW_TIMEOUT, DEFAULT_TAIL_LINES};
use mmeval_agent::{JobController, JobError};
use mmeval_job::JobSpec;

#[derive(Parser, Debug)]
#[command(name = "mmeval-agent")]
#[command(version)]
#[command(about = "Runs evaluation jobs and serves their logs")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Submit a job spec (JSON file) and supervise it until it ends
    Submit {
        spec: PathBuf,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 24 * 3600)]
        timeout: u64,
    },

    /// Show one job
    Status { id: String },

    /// List all known jobs
    List,

    /// List result files of a finished job
    Results { id: String },

    /// Copy one result file of a finished job to stdout or a file
    Download {
        id: String,

        /// File path relative to the job's work dir
        #[arg(long)]
        path: Option<String>,

        /// Write here instead of stdout
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },

    /// Print the last lines of a job log
    Tail {
        id: String,

        #[arg(short = 'n', long, default_value_t = DEFAULT_TAIL_LINES)]
        lines: usize,

        /// Log path relative to the job's work dir
        #[arg(long)]
        path: Option<String>,
    },

    /// Stream new lines of a job log for a bounded time
    Follow {
        id: String,

        /// Seconds to follow before returning
        #[arg(long, default_value_t = DEFAULT_FOLLOW_TIMEOUT.as_secs())]
        timeout: u64,

        #[arg(long)]
        path: Option<String>,
    },
}

fn print_json<T: serde::Serialize>(v: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

async fn run(ctl: &JobController, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Submit { spec, timeout } => {
            let raw = tokio::fs::read(&spec)
                .await
                .with_context(|| format!("read {}", spec.display()))?;
            let spec: JobSpec = serde_json::from_slice(&raw)
                .map_err(|e| JobError::Validation(format!("invalid job spec: {e}")))?;

            let view = ctl.submit(spec).await?;
            tracing::info!(job_id = %view.id, work_dir = %view.work_dir.display(), "supervising job");

            let done = tokio::select! {
                v = ctl.wait_terminal(view.id.as_str(), Duration::from_secs(timeout)) => v?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!(job_id = %view.id, "interrupted; job left unfinished");
                    ctl.get_status(view.id.as_str()).await?
                }
            };
            print_json(&done)
        }
        Command::Status { id } => print_json(&ctl.get_status(&id).await?),
        Command::List => print_json(&ctl.list().await),
        Command::Results { id } => print_json(&ctl.list_result_files(&id).await?),
        Command::Download { id, path, out } => {
            let src = ctl.result_file(&id, path.as_deref()).await?;
            match out {
                Some(dest) => {
                    tokio::fs::copy(&src, &dest)
                        .await
                        .with_context(|| format!("copy {} to {}", src.display(), dest.display()))?;
                }
                None => {
                    let data = tokio::fs::read(&src)
                        .await
                        .with_context(|| format!("read {}", src.display()))?;
                    let mut stdout = std::io::stdout();
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
            }
            Ok(())
        }
        Command::Tail { id, lines, path } => {
            print!("{}", ctl.tail_log(&id, path.as_deref(), lines).await?);
            Ok(())
        }
        Command::Follow { id, timeout, path } => {
            let stream = ctl
                .follow_log(&id, path.as_deref(), Duration::from_secs(timeout))
                .await?;
            let mut stream = std::pin::pin!(stream);
            let mut out = std::io::stdout();
            while let Some(line) = stream.next().await {
                out.write_all(line.as_bytes())?;
                out.flush()?;
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = AgentConfig::from_env();
    if !matches!(args.command, Command::Submit { .. }) {
        // Only a submitter may reap; readers must not fail jobs another process owns.
        config.stale_running = StalePolicy::Keep;
    }
    let ctl = JobController::open(config).await?;

    if let Err(err) = run(&ctl, args.command).await {
        if let Some(job_err) = err.downcast_ref::<JobError>() {
            eprintln!("{}", serde_json::to_string(&job_err.payload())?);
            std::process::exit(if job_err.is_client_error() { 2 } else { 1 });
        }
        return Err(err);
    }
    Ok(())
}
