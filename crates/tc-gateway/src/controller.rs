//! Agent process controller: one agent subprocess, attached to a pseudo-terminal.
//!
//! The child runs in its own process group so stopping it also reaches any
//! descendants. Output is decoded in a background task and delivered on a
//! bounded channel; that channel closing is the caller's "done" signal.

use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::openpty;
use nix::sys::signal::{killpg, Signal};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, OutputFlags, SetArg};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tc_types::config::AgentConfig;
use tc_types::message::StructuredMessage;

use crate::decoder::StreamDecoder;
use crate::error::ControllerError;

/// Capacity of the per-turn output channel.
pub const OUTPUT_BUFFER: usize = 100;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Held from `openpty` until the slave is dropped, so no other agent forks
/// while a terminal descriptor is still inheritable.
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub binary: String,
    pub work_dir: PathBuf,
    pub max_turns: u32,
    /// Omitted from the command line when empty.
    pub permission_mode: String,
}

impl ControllerOptions {
    pub fn from_config(agent: &AgentConfig, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: agent.binary.clone(),
            work_dir: work_dir.into(),
            max_turns: agent.max_turns,
            permission_mode: agent.permission_mode.clone(),
        }
    }
}

#[derive(Default)]
struct ControllerState {
    running: bool,
    session_id: Option<String>,
    pgid: Option<Pid>,
    terminal: Option<File>,
    cancel: Option<CancellationToken>,
}

pub struct AgentController {
    options: ControllerOptions,
    state: Arc<Mutex<ControllerState>>,
    exited: Arc<Notify>,
}

fn lock(state: &Mutex<ControllerState>) -> MutexGuard<'_, ControllerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AgentController {
    pub fn new(options: ControllerOptions) -> Self {
        Self {
            options,
            state: Arc::new(Mutex::new(ControllerState::default())),
            exited: Arc::new(Notify::new()),
        }
    }

    /// Command-line arguments for one invocation, in a fixed order.
    pub fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--max-turns".to_string(),
            self.options.max_turns.to_string(),
        ];
        if !self.options.permission_mode.is_empty() {
            args.push("--permission-mode".to_string());
            args.push(self.options.permission_mode.clone());
        }
        if let Some(id) = self.session_id() {
            args.push("--resume".to_string());
            args.push(id);
        }
        args
    }

    /// Spawn the agent for one prompt and return its decoded output.
    ///
    /// Cancelling `parent` has the same effect on the output stream as [`stop`](Self::stop).
    pub fn start(
        &self,
        parent: &CancellationToken,
        prompt: &str,
    ) -> Result<mpsc::Receiver<StructuredMessage>, ControllerError> {
        {
            let mut st = lock(&self.state);
            if st.running {
                return Err(ControllerError::AlreadyRunning);
            }
            st.running = true;
        }

        let args = self.build_args(prompt);
        let (child, reader, writer) = match self.spawn_child(&args) {
            Ok(parts) => parts,
            Err(e) => {
                lock(&self.state).running = false;
                return Err(e);
            }
        };

        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
        let cancel = parent.child_token();
        {
            let mut st = lock(&self.state);
            st.pgid = pgid;
            st.terminal = Some(writer);
            st.cancel = Some(cancel.clone());
        }
        info!(
            "Agent started: binary={}, pid={:?}, dir={}",
            self.options.binary,
            pgid,
            self.options.work_dir.display()
        );

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        tokio::spawn(stream_output(reader, tx, cancel, Arc::clone(&self.state)));
        tokio::spawn(reap(child, Arc::clone(&self.state), Arc::clone(&self.exited)));
        Ok(rx)
    }

    fn spawn_child(
        &self,
        args: &[String],
    ) -> Result<(Child, tokio::fs::File, File), ControllerError> {
        let spawn_err = |source: std::io::Error| ControllerError::Spawn {
            binary: self.options.binary.clone(),
            source,
        };

        let _spawning = SPAWN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let pty = openpty(None, None).map_err(|e| spawn_err(e.into()))?;
        // The child gets the slave through dup2'd stdio only.
        for fd in [&pty.master, &pty.slave] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .map_err(|e| spawn_err(e.into()))?;
        }

        // Raw output: no echo of our own input, no "\n" -> "\r\n" rewriting.
        let mut termios = tcgetattr(&pty.slave).map_err(|e| spawn_err(e.into()))?;
        termios.local_flags.remove(LocalFlags::ECHO);
        termios.output_flags.remove(OutputFlags::ONLCR);
        tcsetattr(&pty.slave, SetArg::TCSANOW, &termios).map_err(|e| spawn_err(e.into()))?;

        let stdio = |fd: &OwnedFd| fd.try_clone().map(Stdio::from);
        let mut cmd = Command::new(&self.options.binary);
        cmd.args(args)
            .current_dir(&self.options.work_dir)
            .stdin(stdio(&pty.slave).map_err(spawn_err)?)
            .stdout(stdio(&pty.slave).map_err(spawn_err)?)
            .stderr(stdio(&pty.slave).map_err(spawn_err)?)
            .process_group(0)
            .kill_on_drop(false);

        let child = cmd.spawn().map_err(spawn_err)?;
        // Only the child may hold the slave side, or the master never sees EOF.
        drop(cmd);
        drop(pty.slave);

        let writer = File::from(pty.master.try_clone().map_err(spawn_err)?);
        let reader = tokio::fs::File::from_std(File::from(pty.master));
        Ok((child, reader, writer))
    }

    /// Write `text` and a newline to the agent's terminal.
    pub async fn send_input(&self, text: &str) -> Result<(), ControllerError> {
        let terminal = {
            let st = lock(&self.state);
            st.terminal
                .as_ref()
                .ok_or(ControllerError::NoTerminal)?
                .try_clone()?
        };
        let mut terminal = tokio::fs::File::from_std(terminal);
        terminal.write_all(format!("{text}\n").as_bytes()).await?;
        terminal.flush().await?;
        debug!("Wrote {} bytes to agent terminal", text.len() + 1);
        Ok(())
    }

    /// Ask the whole process group to exit. No-op when nothing is running.
    pub fn stop(&self) -> Result<(), ControllerError> {
        let (pgid, cancel) = {
            let st = lock(&self.state);
            if !st.running {
                return Ok(());
            }
            (st.pgid, st.cancel.clone())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(pgid) = pgid {
            info!("Stopping agent process group {pgid}");
            signal_group(pgid, Signal::SIGTERM)?;
        }
        Ok(())
    }

    /// Kill the whole process group immediately.
    pub fn force_stop(&self) -> Result<(), ControllerError> {
        let (pgid, cancel) = {
            let st = lock(&self.state);
            (st.pgid, st.cancel.clone())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(pgid) = pgid {
            warn!("Killing agent process group {pgid}");
            signal_group(pgid, Signal::SIGKILL)?;
        }
        Ok(())
    }

    /// Stop, wait up to `grace` for the agent to exit, then kill it.
    /// Returns true if a kill was needed.
    pub async fn terminate(&self, grace: Duration) -> Result<bool, ControllerError> {
        self.stop()?;
        let deadline = tokio::time::Instant::now() + grace;
        while self.is_running() {
            if tokio::time::Instant::now() >= deadline {
                self.force_stop()?;
                return Ok(true);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(false)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Resolve once the agent process has been reaped. Immediate when idle.
    ///
    /// The output channel can close before this, e.g. during a stop's grace window.
    pub async fn wait_exited(&self) {
        loop {
            let exited = self.exited.notified();
            if !self.is_running() {
                return;
            }
            exited.await;
        }
    }

    /// The agent's resumable session id, once known.
    pub fn session_id(&self) -> Option<String> {
        lock(&self.state).session_id.clone()
    }

    pub fn set_session_id(&self, id: Option<String>) {
        lock(&self.state).session_id = id;
    }
}

fn signal_group(pgid: Pid, signal: Signal) -> Result<(), ControllerError> {
    match killpg(pgid, signal) {
        // Already gone.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn stream_output(
    reader: tokio::fs::File,
    tx: mpsc::Sender<StructuredMessage>,
    cancel: CancellationToken,
    state: Arc<Mutex<ControllerState>>,
) {
    let mut decoder = StreamDecoder::new(reader);
    let mut captured = false;

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = decoder.next_message() => msg,
        };
        let Some(msg) = msg else { break };

        if !captured {
            if let StructuredMessage::Init(init) = &msg {
                if !init.session_id.is_empty() {
                    captured = true;
                    lock(&state).session_id = Some(init.session_id.clone());
                    info!("Agent session id: {}", init.session_id);
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(msg) => {
                if sent.is_err() {
                    debug!("Output receiver dropped");
                    break;
                }
            }
        }
    }
    debug!("Output stream closed");
}

async fn reap(mut child: Child, state: Arc<Mutex<ControllerState>>, exited: Arc<Notify>) {
    match child.wait().await {
        Ok(status) => info!("Agent exited: {status}"),
        Err(e) => warn!("Failed to wait for agent: {e}"),
    }
    {
        let mut st = lock(&state);
        st.running = false;
        st.pgid = None;
        st.terminal = None;
        st.cancel = None;
    }
    exited.notify_waiters();
}
