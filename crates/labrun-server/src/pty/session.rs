//! Process bridge
//!
//! Spawns a shell on a native pseudo-terminal and exposes it as:
//! - an input writer (dedicated thread, applied in write order)
//! - a stream of output events ending with a single exit event
//! - resize and kill operations

use std::io::{Read, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::types::{PtyEvent, SpawnRequest, TermSize};

const PTY_WRITE_CHUNK_SIZE: usize = 512;
pub const PTY_INPUT_CHANNEL_SIZE: usize = 1024;
pub const PTY_READ_BUFFER_SIZE: usize = 4096;

/// A running terminal process.
pub trait PtyProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Queue bytes for the process input. Never blocks.
    fn write_input(&self, data: &[u8]) -> Result<()>;

    fn resize(&self, size: TermSize) -> Result<()>;

    /// Signal the process to terminate.
    fn kill(&self);
}

/// A freshly spawned process and the receiving end of its output.
pub struct SpawnedPty {
    pub process: Arc<dyn PtyProcess>,
    pub events: mpsc::UnboundedReceiver<PtyEvent>,
}

pub trait PtySpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty>;
}

/// Spawns interactive shells on the host's native PTY implementation.
#[derive(Debug, Clone)]
pub struct NativePtySpawner {
    shell: String,
    cwd: PathBuf,
}

impl NativePtySpawner {
    pub fn new(shell: Option<String>, cwd: PathBuf) -> Self {
        let shell = shell
            .filter(|s| !s.is_empty())
            .unwrap_or_else(resolve_default_shell);
        Self { shell, cwd }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }
}

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(request.size.to_pty_size())
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.cwd(&self.cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        cmd.env("SHELL", &self.shell);
        cmd.env("LABRUN_RUN_ID", &request.run_id);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn shell")?;
        // The master only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")?;

        let (input_tx, input_rx) = std::sync::mpsc::sync_channel(PTY_INPUT_CHANNEL_SIZE);
        spawn_pty_writer_thread(request.run_id.clone(), writer, input_rx);

        let exited = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = oneshot::channel();
        let run_id = request.run_id.clone();
        let exited_flag = exited.clone();
        std::thread::spawn(move || {
            let exit_code = match child.wait() {
                Ok(status) => Some(status.exit_code()),
                Err(e) => {
                    warn!("[pty:{}] wait failed: {}", run_id, e);
                    None
                }
            };
            // Set before the exit event can be observed by the reader task.
            exited_flag.store(true, Ordering::SeqCst);
            let _ = exit_tx.send(exit_code);
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_pty_output(
            request.run_id.clone(),
            reader,
            events_tx,
            exit_rx,
        ));

        info!(
            "[pty:{}] Spawned {} (pid: {:?}, {}x{})",
            request.run_id, self.shell, pid, request.size.cols, request.size.rows
        );

        Ok(SpawnedPty {
            process: Arc::new(NativeProcess {
                run_id: request.run_id.clone(),
                master: Mutex::new(pair.master),
                killer: Mutex::new(killer),
                input_tx,
                exited,
                pid,
            }),
            events: events_rx,
        })
    }
}

struct NativeProcess {
    run_id: String,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Bounded for backpressure
    input_tx: SyncSender<Vec<u8>>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl PtyProcess for NativeProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write_input(&self, data: &[u8]) -> Result<()> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(anyhow!("shell has exited"));
        }
        if data.len() > 100 {
            debug!("[pty:{}] Queueing large input: {} bytes", self.run_id, data.len());
        }
        self.input_tx.try_send(data.to_vec()).map_err(|e| match e {
            TrySendError::Full(_) => anyhow!("PTY input queue is full"),
            TrySendError::Disconnected(_) => anyhow!("PTY input channel closed"),
        })
    }

    fn resize(&self, size: TermSize) -> Result<()> {
        self.master
            .lock()
            .resize(size.to_pty_size())
            .context("Failed to resize PTY")
    }

    fn kill(&self) {
        if let Err(e) = self.killer.lock().kill() {
            // Already exited is the common case here.
            debug!("[pty:{}] kill failed: {}", self.run_id, e);
        }
    }
}

/// Spawns a dedicated thread for PTY writes
fn spawn_pty_writer_thread(
    run_id: String,
    mut writer: Box<dyn IoWrite + Send>,
    input_rx: Receiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        debug!("[writer:{}] Writer thread started", run_id);
        let mut total_bytes_written: usize = 0;

        while let Ok(data) = input_rx.recv() {
            for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
                    error!(
                        "[writer:{}] Write error: {} (errno: {:?})",
                        run_id,
                        e,
                        e.raw_os_error()
                    );
                    return;
                }
            }
            total_bytes_written += data.len();
        }

        debug!(
            "[writer:{}] Writer thread finished. Total: {} bytes",
            run_id, total_bytes_written
        );
    });
}

/// Read PTY output until EOF, then report the exit status.
async fn read_pty_output(
    run_id: String,
    mut reader: Box<dyn Read + Send>,
    events: mpsc::UnboundedSender<PtyEvent>,
    exit_rx: oneshot::Receiver<Option<u32>>,
) {
    let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
    let mut utf8_buffer: Vec<u8> = Vec::new();
    let mut total_bytes_read: usize = 0;

    loop {
        let read_result = tokio::task::spawn_blocking(move || {
            let result = reader.read(&mut buf);
            (reader, buf, result)
        })
        .await;

        let (returned_reader, returned_buf, result) = match read_result {
            Ok(r) => r,
            Err(e) => {
                error!("[reader:{}] spawn_blocking panicked: {}", run_id, e);
                break;
            }
        };
        reader = returned_reader;
        buf = returned_buf;

        match result {
            Ok(0) => break,
            Ok(n) => {
                total_bytes_read += n;
                utf8_buffer.extend_from_slice(&buf[..n]);

                let valid_up_to = find_utf8_boundary(&utf8_buffer);
                if valid_up_to > 0 {
                    let data = String::from_utf8_lossy(&utf8_buffer[..valid_up_to]).into_owned();
                    utf8_buffer.drain(..valid_up_to);
                    if events.send(PtyEvent::Output(data)).is_err() {
                        debug!("[reader:{}] Output receiver dropped", run_id);
                    }
                }
            }
            // Linux reports EIO on the master once the slave side closes.
            Err(e) => {
                debug!("[reader:{}] Read ended: {}", run_id, e);
                break;
            }
        }
    }

    if !utf8_buffer.is_empty() {
        let data = String::from_utf8_lossy(&utf8_buffer).into_owned();
        let _ = events.send(PtyEvent::Output(data));
    }

    let exit_code = exit_rx.await.ok().flatten();
    info!(
        "[reader:{}] Process exited (code: {:?}, {} bytes read)",
        run_id, exit_code, total_bytes_read
    );
    let _ = events.send(PtyEvent::Exit { exit_code });
}

/// Find the last valid UTF-8 boundary in a byte slice
pub fn find_utf8_boundary(bytes: &[u8]) -> usize {
    if bytes.is_empty() {
        return 0;
    }

    if std::str::from_utf8(bytes).is_ok() {
        return bytes.len();
    }

    // Look back up to 4 bytes to find a complete sequence
    for i in 1..=4.min(bytes.len()) {
        let check_pos = bytes.len() - i;
        if std::str::from_utf8(&bytes[..check_pos]).is_ok() {
            return check_pos;
        }
    }

    // Invalid bytes in the middle: hand everything to the lossy decoder.
    bytes.len()
}

/// Pick an interactive shell when none is configured.
pub fn resolve_default_shell() -> String {
    if let Ok(shell_env) = std::env::var("SHELL") {
        if !shell_env.is_empty() && Path::new(&shell_env).exists() {
            return shell_env;
        }
    }

    for candidate in ["/bin/bash", "/usr/bin/bash", "/bin/sh", "/usr/bin/sh"] {
        if Path::new(candidate).exists() {
            return candidate.to_string();
        }
    }

    "/bin/sh".to_string()
}
