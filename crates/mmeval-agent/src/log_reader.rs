use std::{
    io::SeekFrom,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use futures_util::{Stream, stream};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader},
    time::Instant,
};

use crate::error::{JobError, Result};
use crate::log_mux::{RUN_LOG_PREFIX, RUN_LOG_SUFFIX, SUMMARY_LOG};

pub const DEFAULT_TAIL_LINES: usize = 200;
pub const DEFAULT_FOLLOW_TIMEOUT: Duration = Duration::from_secs(60);

/// Relative path under a job's work dir. Absolute paths and `..` are rejected.
pub(crate) fn normalize_rel_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);
    if p.is_absolute() {
        return Err(JobError::Validation(format!("path must be relative: {rel}")));
    }

    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                return Err(JobError::Validation(format!(
                    "path must not contain '..': {rel}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(JobError::Validation(format!("path must be relative: {rel}")));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(JobError::Validation("path must not be empty".to_string()));
    }
    Ok(out)
}

fn is_run_log(name: &str) -> bool {
    name.starts_with(RUN_LOG_PREFIX) && name.ends_with(RUN_LOG_SUFFIX)
}

pub(crate) async fn is_file(p: &Path) -> bool {
    tokio::fs::metadata(p).await.is_ok_and(|m| m.is_file())
}

/// Picks the log to read: the explicit path if given, else the newest per-run
/// log, else the summary log.
pub async fn select_log(work_dir: &Path, explicit: Option<&str>) -> Result<PathBuf> {
    if let Some(rel) = explicit.filter(|s| !s.trim().is_empty()) {
        let p = work_dir.join(normalize_rel_path(rel)?);
        if is_file(&p).await {
            return Ok(p);
        }
        return Err(JobError::NotFound(format!("log file {rel}")));
    }

    let mut latest: Option<String> = None;
    match tokio::fs::read_dir(work_dir).await {
        Ok(mut rd) => {
            while let Some(entry) = rd
                .next_entry()
                .await
                .map_err(|e| JobError::io("list work dir", e))?
            {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if is_run_log(&name) && latest.as_ref().is_none_or(|l| name > *l) {
                    latest = Some(name);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(JobError::io("list work dir", e)),
    }
    if let Some(name) = latest {
        return Ok(work_dir.join(name));
    }

    let summary = work_dir.join(SUMMARY_LOG);
    if is_file(&summary).await {
        return Ok(summary);
    }
    Err(JobError::NotFound(format!(
        "log in {}",
        work_dir.display()
    )))
}

fn split_lines_from_tail(buf: &[u8], max_lines: usize) -> Vec<String> {
    // Best-effort UTF-8: invalid sequences become U+FFFD.
    let text = String::from_utf8_lossy(buf);
    let mut out: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    if out.len() > max_lines {
        out.drain(0..(out.len() - max_lines));
    }
    out
}

/// Last `n` lines of `path`, in file order. Reads a window sized from
/// `avg_line_bytes * n` off the end and doubles it until enough complete
/// lines are in hand or the window reaches the start of the file.
pub async fn tail(path: &Path, n: usize, avg_line_bytes: u64) -> Result<Vec<String>> {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(JobError::NotFound(format!("log file {}", path.display())));
        }
        Err(e) => return Err(JobError::io("open log", e)),
    };
    if n == 0 {
        return Ok(Vec::new());
    }

    let len = file
        .metadata()
        .await
        .map_err(|e| JobError::io("stat log", e))?
        .len();
    let mut window = avg_line_bytes.max(1).saturating_mul(n as u64);

    loop {
        let start = len.saturating_sub(window);
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| JobError::io("seek log", e))?;
        let mut buf = Vec::with_capacity((len - start) as usize);
        (&mut file)
            .take(len - start)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| JobError::io("read log", e))?;

        let mut slice = buf.as_slice();
        if start > 0 {
            // The first line is probably cut by the seek.
            slice = match slice.iter().position(|b| *b == b'\n') {
                Some(i) => &slice[i + 1..],
                None => &[],
            };
        }

        let lines = split_lines_from_tail(slice, n);
        if lines.len() >= n || start == 0 {
            return Ok(lines);
        }
        window = window.saturating_mul(2);
    }
}

fn stream_error(e: &std::io::Error) -> String {
    format!("[stream-error] {e}\n")
}

enum Stage {
    Opening(PathBuf),
    Tailing {
        reader: BufReader<File>,
        partial: Vec<u8>,
    },
    Done,
}

struct Follower {
    deadline: Instant,
    poll: Duration,
    stage: Stage,
}

impl Follower {
    async fn next_line(&mut self) -> Option<String> {
        loop {
            match &mut self.stage {
                Stage::Done => return None,
                Stage::Opening(path) => {
                    let opened = async {
                        let mut f = File::open(&*path).await?;
                        f.seek(SeekFrom::End(0)).await?;
                        Ok::<_, std::io::Error>(f)
                    }
                    .await;
                    match opened {
                        Ok(f) => {
                            self.stage = Stage::Tailing {
                                reader: BufReader::new(f),
                                partial: Vec::new(),
                            };
                        }
                        Err(e) => {
                            self.stage = Stage::Done;
                            return Some(stream_error(&e));
                        }
                    }
                }
                Stage::Tailing { reader, partial } => {
                    let now = Instant::now();
                    if now >= self.deadline {
                        let rest = std::mem::take(partial);
                        self.stage = Stage::Done;
                        if rest.is_empty() {
                            return None;
                        }
                        let mut line = String::from_utf8_lossy(&rest).into_owned();
                        line.push('\n');
                        return Some(line);
                    }

                    match reader.read_until(b'\n', partial).await {
                        Ok(0) => {
                            tokio::time::sleep(self.poll.min(self.deadline - now)).await;
                        }
                        Ok(_) if partial.ends_with(b"\n") => {
                            let line = std::mem::take(partial);
                            return Some(String::from_utf8_lossy(&line).into_owned());
                        }
                        // Partial line at EOF: held until its newline arrives.
                        Ok(_) => {}
                        Err(e) => {
                            self.stage = Stage::Done;
                            return Some(stream_error(&e));
                        }
                    }
                }
            }
        }
    }
}

/// Lines appended to `path` from now until `timeout` elapses. Each item keeps
/// its trailing newline. A read error ends the stream with one
/// `[stream-error]` line.
pub fn follow(
    path: PathBuf,
    timeout: Duration,
    poll: Duration,
) -> impl Stream<Item = String> + Send + 'static {
    let follower = Follower {
        deadline: Instant::now() + timeout,
        poll: poll.max(Duration::from_millis(1)),
        stage: Stage::Opening(path),
    };
    stream::unfold(follower, |mut f| async move {
        let line = f.next_line().await?;
        Some((line, f))
    })
}
