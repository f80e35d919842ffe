use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::ProcessError;
use crate::lines::LineDecoder;

/// Terminator written after every command; the PTY drops the CR on input
pub const LINE_TERMINATOR: &str = "\r\n";

/// Default grace period between the polite termination request and the kill
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How often the supervisor polls the child for exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long to wait for the reader to drain buffered output after the child exits
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Configuration for spawning the engine
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
    /// Capacity of the output queue; a full queue blocks the reader
    pub output_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "pjsua".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            rows: 24,
            cols: 200,
            output_capacity: 256,
        }
    }
}

/// Snapshot of the supervised process
#[derive(Clone, Debug)]
pub struct EngineState {
    pub running: bool,
    pub pid: Option<u32>,
    pub program: String,
    pub args: Vec<String>,
}

/// Output delivered by the supervisor, in stream order
#[derive(Clone, Debug, PartialEq)]
pub enum EngineOutput {
    /// One decoded line, without its terminator
    Line { text: String, timestamp: i64 },
    /// The process is gone. Sent exactly once, always last.
    Exited,
}

/// Messages that can be sent to the engine actor
enum EngineMessage {
    WriteLine {
        text: String,
        respond_to: oneshot::Sender<Result<(), ProcessError>>,
    },
    GetState {
        respond_to: oneshot::Sender<EngineState>,
    },
    Terminate {
        grace: Duration,
        respond_to: oneshot::Sender<Result<(), ProcessError>>,
    },
}

/// Handle to communicate with the engine actor
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineMessage>,
}

impl EngineHandle {
    /// Write one command line, terminated and flushed before returning
    pub async fn write_line(&self, text: &str) -> Result<(), ProcessError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EngineMessage::WriteLine {
                text: text.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| ProcessError::ProcessExited)?;
        rx.await
            .map_err(|_| ProcessError::ChannelError("Failed to receive write response".into()))?
    }

    /// Get the current state of the process
    pub async fn state(&self) -> Result<EngineState, ProcessError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EngineMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| ProcessError::ProcessExited)?;
        rx.await
            .map_err(|_| ProcessError::ChannelError("Failed to receive state response".into()))
    }

    /// Ask the process to stop, killing it if it is still alive after `grace`.
    ///
    /// Returns once the process is gone. Terminating an already exited
    /// process is not an error.
    pub async fn terminate(&self, grace: Duration) -> Result<(), ProcessError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(EngineMessage::Terminate {
                grace,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// True once the supervisor task has stopped
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Fires `EngineOutput::Exited` at most once, from whichever side sees the exit first
#[derive(Clone)]
struct ExitNotifier {
    fired: Arc<AtomicBool>,
    tx: mpsc::Sender<EngineOutput>,
}

impl ExitNotifier {
    fn notify_blocking(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let _ = self.tx.blocking_send(EngineOutput::Exited);
        }
    }

    async fn notify(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(EngineOutput::Exited).await;
        }
    }
}

/// The actor that owns a single engine process
pub struct EngineActor {
    _master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    state: EngineState,
    receiver: mpsc::Receiver<EngineMessage>,
    exit: ExitNotifier,
    reader_done: Option<oneshot::Receiver<()>>,
}

impl EngineActor {
    /// Spawn the engine and return a handle plus its ordered output stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: EngineConfig,
    ) -> Result<(EngineHandle, mpsc::Receiver<EngineOutput>), ProcessError> {
        let (actor, handle, output) = Self::start(config)?;
        tokio::spawn(actor.run());
        Ok((handle, output))
    }

    fn start(
        config: EngineConfig,
    ) -> Result<(Self, EngineHandle, mpsc::Receiver<EngineOutput>), ProcessError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProcessError::SpawnFailed(format!("Failed to open PTY: {}", e)))?;

        configure_line_discipline(&*pair.master)?;

        let mut cmd = CommandBuilder::new(&config.program);
        for arg in &config.args {
            cmd.arg(arg);
        }

        if let Some(dir) = &config.working_dir {
            cmd.cwd(dir);
        }

        // Plain output keeps the classifier's substring tests simple
        cmd.env("TERM", "dumb");
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!("Spawning engine: {} ({} args)", config.program, config.args.len());

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn engine '{}': {}", config.program, e);
            ProcessError::SpawnFailed(e.to_string())
        })?;
        // The master only sees EOF once every slave handle is closed
        drop(pair.slave);

        let pid = child.process_id();
        info!("Engine process started with PID: {:?}", pid);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ProcessError::SpawnFailed(format!("Failed to clone PTY reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ProcessError::SpawnFailed(format!("Failed to take PTY writer: {}", e)))?;

        let (output_tx, output_rx) = mpsc::channel(config.output_capacity.max(1));
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (done_tx, done_rx) = oneshot::channel();

        let exit = ExitNotifier {
            fired: Arc::new(AtomicBool::new(false)),
            tx: output_tx.clone(),
        };

        // Blocking reader thread: forwards whole lines, blocking when the queue is full
        let reader_exit = exit.clone();
        std::thread::spawn(move || {
            let mut decoder = LineDecoder::new();
            let mut buffer = vec![0u8; 4096];
            'read: loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        debug!("Engine output EOF");
                        break;
                    }
                    Ok(n) => {
                        for text in decoder.push(&buffer[..n]) {
                            let line = EngineOutput::Line {
                                text,
                                timestamp: chrono::Utc::now().timestamp_millis(),
                            };
                            if output_tx.blocking_send(line).is_err() {
                                break 'read;
                            }
                        }
                    }
                    Err(e) => {
                        // EIO is how Linux reports a PTY whose slave side closed
                        debug!("Engine output closed: {}", e);
                        break;
                    }
                }
            }
            if let Some(text) = decoder.finish() {
                let _ = output_tx.blocking_send(EngineOutput::Line {
                    text,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
            }
            reader_exit.notify_blocking();
            let _ = done_tx.send(());
            debug!("Engine reader thread exiting");
        });

        let actor = Self {
            _master: pair.master,
            writer,
            child,
            state: EngineState {
                running: true,
                pid,
                program: config.program.clone(),
                args: config.args.clone(),
            },
            receiver: msg_rx,
            exit,
            reader_done: Some(done_rx),
        };

        Ok((actor, EngineHandle { sender: msg_tx }, output_rx))
    }

    async fn run(mut self) {
        info!("Engine supervisor started for PID {:?}", self.state.pid);
        let mut poll = tokio::time::interval(EXIT_POLL_INTERVAL);

        loop {
            tokio::select! {
                msg = self.receiver.recv() => {
                    let Some(msg) = msg else {
                        // Every handle dropped: nobody can stop the engine any more
                        let _ = self.handle_terminate(DEFAULT_TERMINATE_GRACE).await;
                        break;
                    };
                    match msg {
                        EngineMessage::WriteLine { text, respond_to } => {
                            let _ = respond_to.send(self.handle_write_line(&text));
                        }
                        EngineMessage::GetState { respond_to } => {
                            let _ = respond_to.send(self.state.clone());
                        }
                        EngineMessage::Terminate { grace, respond_to } => {
                            let result = self.handle_terminate(grace).await;
                            let _ = respond_to.send(result);
                            break;
                        }
                    }
                }
                _ = poll.tick() => {
                    if let Ok(Some(status)) = self.child.try_wait() {
                        info!("Engine process exited with status: {:?}", status);
                        self.mark_exited().await;
                        break;
                    }
                }
            }
        }

        info!("Engine supervisor shutting down");
    }

    fn handle_write_line(&mut self, text: &str) -> Result<(), ProcessError> {
        if !self.state.running {
            return Err(ProcessError::ProcessExited);
        }
        debug!("-> engine: {:?}", text);
        self.writer
            .write_all(text.as_bytes())
            .and_then(|_| self.writer.write_all(LINE_TERMINATOR.as_bytes()))
            .and_then(|_| self.writer.flush())
            .map_err(|e| ProcessError::WriteFailed(e.to_string()))
    }

    async fn handle_terminate(&mut self, grace: Duration) -> Result<(), ProcessError> {
        if !self.state.running {
            return Ok(());
        }

        // A failed polite request still ends in the kill below
        if let Err(e) = self.request_stop() {
            warn!("Termination request for PID {:?} failed: {}", self.state.pid, e);
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                info!("Engine stopped gracefully: {:?}", status);
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Engine PID {:?} still alive after {:?}, killing",
                    self.state.pid, grace
                );
                if let Err(e) = self.child.kill() {
                    // Still report the exit so the consumer is not left waiting
                    error!("Failed to kill engine PID {:?}: {}", self.state.pid, e);
                    self.mark_exited().await;
                    return Err(ProcessError::KillFailed(e.to_string()));
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.mark_exited().await;
        Ok(())
    }

    #[cfg(unix)]
    fn request_stop(&mut self) -> Result<(), ProcessError> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = self.state.pid {
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                .map_err(|e| ProcessError::KillFailed(e.to_string()))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn request_stop(&mut self) -> Result<(), ProcessError> {
        self.child
            .kill()
            .map_err(|e| ProcessError::KillFailed(e.to_string()))
    }

    /// Let the reader drain what the engine printed last, then report the exit
    async fn mark_exited(&mut self) {
        self.state.running = false;
        self.state.pid = None;
        if let Some(done) = self.reader_done.take() {
            if tokio::time::timeout(DRAIN_GRACE, done).await.is_err() {
                warn!("Engine output still open after exit, reporting exit anyway");
            }
        }
        self.exit.notify().await;
    }
}

/// Raw input with CR dropped: each `text\r\n` reaches the engine as exactly
/// one line, and nothing written is echoed back into the output stream.
#[cfg(unix)]
fn configure_line_discipline(master: &dyn MasterPty) -> Result<(), ProcessError> {
    use nix::sys::termios::{self, InputFlags, SetArg};
    use std::os::fd::BorrowedFd;

    let Some(fd) = master.as_raw_fd() else {
        return Ok(());
    };
    // SAFETY: the fd belongs to `master`, which outlives this call
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };

    let mut attrs = termios::tcgetattr(fd)
        .map_err(|e| ProcessError::SpawnFailed(format!("Failed to read PTY modes: {}", e)))?;
    termios::cfmakeraw(&mut attrs);
    attrs.input_flags.insert(InputFlags::IGNCR);
    termios::tcsetattr(fd, SetArg::TCSANOW, &attrs)
        .map_err(|e| ProcessError::SpawnFailed(format!("Failed to set PTY modes: {}", e)))
}

#[cfg(not(unix))]
fn configure_line_discipline(_master: &dyn MasterPty) -> Result<(), ProcessError> {
    Ok(())
}
