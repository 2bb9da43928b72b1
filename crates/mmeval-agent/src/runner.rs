use std::{
    io::{BufRead, BufReader, Read},
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    path::Path,
    process::Stdio,
    time::Duration,
};

use mmeval_job::{AttachMode, JobStatus};
use portable_pty::{ChildKiller, CommandBuilder, PtySize, native_pty_system};
use tokio::sync::{mpsc, oneshot};

use crate::error::{JobError, Result};
use crate::launcher::{LaunchCommand, LaunchEnv};
use crate::log_mux::LogMux;

const PTY_READ_CHUNK: usize = 4096;

/// What a child process produced, as seen through its output channel.
#[derive(Debug)]
pub enum ChildOutput {
    /// Raw terminal bytes, forwarded verbatim.
    Chunk(Vec<u8>),
    /// One line of merged stdout/stderr, without its terminator.
    Line(String),
}

type ExitResult = std::io::Result<Option<i32>>;

/// A spawned child: its output stream and its eventual exit status.
#[derive(Debug)]
pub struct AttachedChild {
    pub pid: Option<u32>,
    pub mode: AttachMode,
    output: mpsc::UnboundedReceiver<ChildOutput>,
    exit: oneshot::Receiver<ExitResult>,
}

#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    pub command: &'a LaunchCommand,
    pub env: &'a LaunchEnv,
    pub cwd: &'a Path,
}

/// How a child's standard streams are attached and read.
pub trait OutputChannel: Send + Sync {
    fn mode(&self) -> AttachMode;
    fn spawn(&self, spec: &LaunchSpec<'_>) -> Result<AttachedChild>;
}

pub fn channel_for(mode: AttachMode, cols: u16, rows: u16) -> Box<dyn OutputChannel> {
    match mode {
        AttachMode::Pty => Box::new(PtyChannel::new(cols, rows)),
        AttachMode::Pipe => Box::new(PipeChannel),
    }
}

fn spawn_error(program: &str, reason: impl std::fmt::Display) -> JobError {
    JobError::Spawn {
        program: program.to_string(),
        reason: reason.to_string(),
    }
}

/// Child sees an interactive terminal; output arrives as raw chunks.
#[derive(Debug, Clone, Copy)]
pub struct PtyChannel {
    size: PtySize,
}

impl PtyChannel {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            size: PtySize {
                rows: rows.max(1),
                cols: cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            },
        }
    }
}

impl OutputChannel for PtyChannel {
    fn mode(&self) -> AttachMode {
        AttachMode::Pty
    }

    fn spawn(&self, spec: &LaunchSpec<'_>) -> Result<AttachedChild> {
        let program = spec.command.program.as_str();
        let pair = native_pty_system()
            .openpty(self.size)
            .map_err(|e| spawn_error(program, format!("openpty: {e:#}")))?;

        let mut builder = CommandBuilder::new(program);
        builder.args(&spec.command.args);
        builder.env_clear();
        for (k, v) in &spec.env.vars {
            builder.env(k, v);
        }
        if !spec.env.vars.contains_key("TERM") {
            builder.env("TERM", "xterm-256color");
        }
        builder.cwd(spec.cwd);

        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| spawn_error(program, format!("{e:#}")))?;
        // The slave end stays open only inside the child.
        drop(pair.slave);
        let pid = child.process_id();

        let mut reader = match pair.master.try_clone_reader() {
            Ok(r) => r,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(spawn_error(program, format!("attach pty reader: {e:#}")));
            }
        };
        let master = pair.master;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || {
            // Keeps the master descriptor alive for exactly as long as the drain.
            let _master = master;
            let mut buf = [0u8; PTY_READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(ChildOutput::Chunk(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO once the last slave reference closes.
                    Err(_) => break,
                }
            }
        });

        let (exit_tx, exit_rx) = oneshot::channel();
        std::thread::spawn(move || {
            let res = child.wait().map(|s| Some(s.exit_code() as i32));
            let _ = exit_tx.send(res);
        });

        Ok(AttachedChild {
            pid,
            mode: AttachMode::Pty,
            output: rx,
            exit: exit_rx,
        })
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the service dies, the child gets SIGTERM.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Pipe mode: stdout and stderr merged into one line stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipeChannel;

/// One pipe whose write end is handed to the child as both stdout and stderr,
/// so lines from the two streams keep their write order.
fn merged_pipe() -> std::io::Result<(std::fs::File, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: pipe(2) just returned two descriptors owned by nobody else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [&read, &write] {
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok((std::fs::File::from(read), write))
}

fn forward_lines<R: BufRead>(mut reader: R, tx: mpsc::UnboundedSender<ChildOutput>) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                if tx.send(ChildOutput::Line(line)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

impl OutputChannel for PipeChannel {
    fn mode(&self) -> AttachMode {
        AttachMode::Pipe
    }

    fn spawn(&self, spec: &LaunchSpec<'_>) -> Result<AttachedChild> {
        let program = spec.command.program.as_str();
        let (reader, writer) =
            merged_pipe().map_err(|e| spawn_error(program, format!("create pipe: {e}")))?;
        let writer_err = writer
            .try_clone()
            .map_err(|e| spawn_error(program, format!("clone pipe: {e}")))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&spec.command.args)
            .env_clear()
            .envs(&spec.env.vars)
            .current_dir(spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(writer_err));

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error(program, e))?;
        // Our copies of the write end live in `cmd`; EOF needs them closed.
        drop(cmd);
        let pid = child.id();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || forward_lines(BufReader::new(reader), tx));

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let res = child.wait().await.map(|s| s.code());
            let _ = exit_tx.send(res);
        });

        Ok(AttachedChild {
            pid,
            mode: AttachMode::Pipe,
            output: rx,
            exit: exit_rx,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    NotStarted,
    Spawning,
    Attached,
    Draining,
    Exited(Option<i32>),
    Reported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    /// Set when the exit status could not be determined.
    pub error: Option<String>,
}

/// Supervises one child from spawn to reported exit.
pub struct ProcessRunner {
    channel: Box<dyn OutputChannel>,
    drain_grace: Duration,
    phase: RunPhase,
}

impl ProcessRunner {
    pub fn new(channel: Box<dyn OutputChannel>, drain_grace: Duration) -> Self {
        Self {
            channel,
            drain_grace,
            phase: RunPhase::NotStarted,
        }
    }

    pub fn mode(&self) -> AttachMode {
        self.channel.mode()
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn advance(&mut self, next: RunPhase) {
        tracing::trace!(from = ?self.phase, to = ?next, "runner phase");
        self.phase = next;
    }

    pub fn spawn(&mut self, spec: &LaunchSpec<'_>) -> Result<AttachedChild> {
        self.advance(RunPhase::Spawning);
        match self.channel.spawn(spec) {
            Ok(child) => {
                self.advance(RunPhase::Attached);
                Ok(child)
            }
            Err(e) => {
                self.advance(RunPhase::Reported);
                Err(e)
            }
        }
    }

    async fn forward(logs: &mut LogMux, out: ChildOutput) {
        match out {
            ChildOutput::Chunk(bytes) => logs.raw(&bytes).await,
            ChildOutput::Line(line) => logs.tagged(&line).await,
        }
    }

    /// Forwards output until the stream ends, then reports the exit status.
    /// Once the child has exited, leftover output is drained for at most
    /// `drain_grace`, so a grandchild holding the stream cannot stall us.
    pub async fn drain(&mut self, child: AttachedChild, logs: &mut LogMux) -> RunOutcome {
        self.advance(RunPhase::Draining);
        let AttachedChild {
            mut output,
            mut exit,
            ..
        } = child;

        let mut exited: Option<ExitResult> = None;
        loop {
            tokio::select! {
                biased;
                item = output.recv() => match item {
                    Some(out) => Self::forward(logs, out).await,
                    None => break,
                },
                res = &mut exit => {
                    exited = Some(res.unwrap_or_else(|_| Err(std::io::Error::other("exit status lost"))));
                    break;
                }
            }
        }

        if exited.is_some() {
            let deadline = tokio::time::Instant::now() + self.drain_grace;
            loop {
                match tokio::time::timeout_at(deadline, output.recv()).await {
                    Ok(Some(out)) => Self::forward(logs, out).await,
                    Ok(None) => break,
                    Err(_) => {
                        logs.log("[WARN] Output still open after child exit; stopped draining.")
                            .await;
                        break;
                    }
                }
            }
        }

        let res = match exited {
            Some(res) => res,
            None => exit
                .await
                .unwrap_or_else(|_| Err(std::io::Error::other("exit status lost"))),
        };

        let outcome = match res {
            Ok(code) => {
                self.advance(RunPhase::Exited(code));
                let status = if code == Some(0) {
                    JobStatus::Finished
                } else {
                    JobStatus::Failed
                };
                let shown = code.map_or_else(|| "none (signal)".to_string(), |c| c.to_string());
                logs.log(&format!(
                    "[INFO] Command finished with exit code: {shown}. Job status: {status}"
                ))
                .await;
                RunOutcome {
                    status,
                    exit_code: code,
                    error: None,
                }
            }
            Err(e) => {
                self.advance(RunPhase::Exited(None));
                logs.log(&format!("[ERROR] Failed to collect exit status: {e}"))
                    .await;
                RunOutcome {
                    status: JobStatus::Failed,
                    exit_code: None,
                    error: Some(e.to_string()),
                }
            }
        };
        self.advance(RunPhase::Reported);
        outcome
    }
}
