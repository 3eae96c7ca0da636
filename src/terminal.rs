//! Terminal Multiplexer (C8).
//!
//! Per-sandbox PTY sessions, each backed by a `docker exec -it` attach
//! through [`crate::container::ContainerRuntimeAdapter::exec_attached`].
//! PTY allocation uses `nix::pty::openpty`, adapted from the teacher's
//! guest-agent PTY helper (which forked/execved a shell directly inside a
//! microVM guest) to instead spawn the exec attach on the host and hand it
//! the slave end of the pair.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};

use crate::container::ContainerRuntimeAdapter;
use crate::error::{Error, Result};

/// Hard cap on concurrent terminals per sandbox.
pub const MAX_TERMINALS_PER_SANDBOX: usize = 5;
/// Ring buffer cap, in lines; halved on overflow.
pub const MAX_RING_LINES: usize = 10_000;
/// Output fan-out channel capacity per terminal.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

struct RingBuffer {
    lines: Vec<String>,
}

impl RingBuffer {
    fn new() -> Self {
        Self { lines: Vec::new() }
    }

    fn push(&mut self, chunk: &str) {
        for line in chunk.split_inclusive('\n') {
            self.lines.push(line.to_string());
        }
        if self.lines.len() > MAX_RING_LINES {
            let keep_from = self.lines.len() - MAX_RING_LINES / 2;
            self.lines.drain(0..keep_from);
        }
    }

    fn snapshot(&self) -> String {
        self.lines.concat()
    }
}

struct TerminalSession {
    id: String,
    sandbox_id: String,
    status: TerminalStatus,
    shell_path: String,
    created_at: chrono::DateTime<chrono::Utc>,
    exit_code: Option<i32>,
    buffer: Arc<Mutex<RingBuffer>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    input_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    resize_tx: tokio::sync::mpsc::Sender<(u16, u16)>,
    child: Option<tokio::process::Child>,
}

/// Public, cloneable view of a terminal's bookkeeping.
#[derive(Debug, Clone)]
pub struct TerminalInfo {
    pub id: String,
    pub sandbox_id: String,
    pub status: TerminalStatus,
    pub shell_path: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub exit_code: Option<i32>,
}

/// Owns every live terminal across all sandboxes.
pub struct TerminalMultiplexer {
    runtime: Arc<dyn ContainerRuntimeAdapter>,
    sessions: Mutex<HashMap<String, TerminalSession>>,
}

impl TerminalMultiplexer {
    pub fn new(runtime: Arc<dyn ContainerRuntimeAdapter>) -> Self {
        Self {
            runtime,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn count_for_sandbox(sessions: &HashMap<String, TerminalSession>, sandbox_id: &str) -> usize {
        sessions.values().filter(|s| s.sandbox_id == sandbox_id).count()
    }

    /// Open a new PTY-backed terminal attached to `runtime_id`'s shell.
    /// Rejects with `LimitReached` at the per-sandbox cap.
    pub async fn connect(&self, sandbox_id: &str, runtime_id: &str, shell: &str) -> Result<String> {
        let mut sessions = self.sessions.lock().await;
        if Self::count_for_sandbox(&sessions, sandbox_id) >= MAX_TERMINALS_PER_SANDBOX {
            return Err(Error::LimitReached(format!(
                "sandbox {sandbox_id} already has {MAX_TERMINALS_PER_SANDBOX} terminals"
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (master, slave) = open_pty()?;

        let env = HashMap::new();
        let child = self
            .runtime
            .exec_attached(runtime_id, &[shell.to_string()], &env, slave)
            .await?;

        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, mut input_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(256);
        let (resize_tx, mut resize_rx) = tokio::sync::mpsc::channel::<(u16, u16)>(16);

        let master_fd = master.try_clone().map_err(Error::from)?;
        let mut master_reader = tokio::fs::File::from_std(master.try_clone().map_err(Error::from)?);
        let mut master_writer = tokio::fs::File::from_std(master);

        let reader_tx = output_tx.clone();
        let session_id = id.clone();
        let buffer = Arc::new(Mutex::new(RingBuffer::new()));
        let reader_buffer = buffer.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match master_reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        reader_buffer.lock().await.push(&String::from_utf8_lossy(&buf[..n]));
                        let _ = reader_tx.send(buf[..n].to_vec());
                    }
                }
            }
            tracing::debug!(terminal_id = %session_id, "terminal reader exited");
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    input = input_rx.recv() => {
                        match input {
                            Some(bytes) => {
                                if master_writer.write_all(&bytes).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    resize = resize_rx.recv() => {
                        match resize {
                            Some((cols, rows)) => {
                                let _ = set_winsize(&master_fd, cols, rows);
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        let session = TerminalSession {
            id: id.clone(),
            sandbox_id: sandbox_id.to_string(),
            status: TerminalStatus::Connected,
            shell_path: shell.to_string(),
            created_at: chrono::Utc::now(),
            exit_code: None,
            buffer,
            output_tx,
            input_tx,
            resize_tx,
            child: Some(child),
        };
        sessions.insert(id.clone(), session);
        Ok(id)
    }

    /// Non-blocking send; drops and reports if the session's writer task
    /// has stalled rather than ever blocking the caller.
    pub async fn send_input(&self, terminal_id: &str, bytes: Vec<u8>) -> Result<()> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(terminal_id)
            .ok_or_else(|| Error::not_found(format!("terminal '{terminal_id}'")))?;
        match session.input_tx.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(tokio::sync::mpsc::error::TrySendError::Full(dropped)) => {
                tracing::warn!(terminal_id, dropped_bytes = dropped.len(), "terminal input dropped under backpressure");
                Ok(())
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::conflict(format!("terminal '{terminal_id}' is closed")))
            }
        }
    }

    pub async fn resize(&self, terminal_id: &str, cols: u16, rows: u16) -> Result<()> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(terminal_id)
            .ok_or_else(|| Error::not_found(format!("terminal '{terminal_id}'")))?;
        session
            .resize_tx
            .send((cols, rows))
            .await
            .map_err(|_| Error::conflict(format!("terminal '{terminal_id}' is closed")))
    }

    /// Subscribe to this terminal's live output plus whatever the ring
    /// buffer already holds, for late subscribers.
    pub async fn subscribe(&self, terminal_id: &str) -> Result<(String, broadcast::Receiver<Vec<u8>>)> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(terminal_id)
            .ok_or_else(|| Error::not_found(format!("terminal '{terminal_id}'")))?;
        let snapshot = session.buffer.lock().await.snapshot();
        Ok((snapshot, session.output_tx.subscribe()))
    }

    /// Feed externally-observed output bytes into the ring buffer.
    /// Normally done by the background reader task as PTY output arrives;
    /// exposed here so callers/tests can drive the buffer deterministically
    /// without a live PTY.
    pub async fn record_output(&self, terminal_id: &str, chunk: &str) -> Result<()> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(terminal_id)
            .ok_or_else(|| Error::not_found(format!("terminal '{terminal_id}'")))?;
        session.buffer.lock().await.push(chunk);
        Ok(())
    }

    pub async fn disconnect(&self, terminal_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let mut session = sessions
            .remove(terminal_id)
            .ok_or_else(|| Error::not_found(format!("terminal '{terminal_id}'")))?;
        if let Some(mut child) = session.child.take() {
            let _ = child.start_kill();
        }
        session.status = TerminalStatus::Disconnected;
        Ok(())
    }

    pub async fn disconnect_all(&self, sandbox_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let ids: Vec<String> = sessions
            .values()
            .filter(|s| s.sandbox_id == sandbox_id)
            .map(|s| s.id.clone())
            .collect();
        for id in ids {
            if let Some(mut session) = sessions.remove(&id) {
                if let Some(mut child) = session.child.take() {
                    let _ = child.start_kill();
                }
            }
        }
        Ok(())
    }

    pub async fn list(&self, sandbox_id: &str) -> Vec<TerminalInfo> {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .filter(|s| s.sandbox_id == sandbox_id)
            .map(|s| TerminalInfo {
                id: s.id.clone(),
                sandbox_id: s.sandbox_id.clone(),
                status: s.status,
                shell_path: s.shell_path.clone(),
                created_at: s.created_at,
                exit_code: s.exit_code,
            })
            .collect()
    }
}

#[cfg(unix)]
fn open_pty() -> Result<(std::fs::File, std::fs::File)> {
    use nix::pty::openpty;
    let pty = openpty(None, None).map_err(|e| Error::runtime(format!("openpty failed: {e}")))?;
    Ok((pty.master.into(), pty.slave.into()))
}

#[cfg(not(unix))]
fn open_pty() -> Result<(std::fs::File, std::fs::File)> {
    Err(Error::runtime("PTY allocation is only supported on unix targets"))
}

#[cfg(unix)]
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, nix::pty::Winsize);

#[cfg(unix)]
fn set_winsize(file: &std::fs::File, cols: u16, rows: u16) -> Result<()> {
    use std::os::fd::AsRawFd;
    let ws = nix::pty::Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe {
        tiocswinsz(file.as_raw_fd(), &ws).map_err(|e| Error::runtime(format!("resize failed: {e}")))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_winsize(_file: &std::fs::File, _cols: u16, _rows: u16) -> Result<()> {
    Err(Error::runtime("terminal resize is only supported on unix targets"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_halves_on_overflow() {
        let mut buffer = RingBuffer::new();
        for i in 0..(MAX_RING_LINES + 10) {
            buffer.push(&format!("line {i}\n"));
        }
        assert!(buffer.lines.len() <= MAX_RING_LINES);
    }

    #[test]
    fn ring_buffer_snapshot_preserves_order() {
        let mut buffer = RingBuffer::new();
        buffer.push("a\nb\n");
        assert_eq!(buffer.snapshot(), "a\nb\n");
    }
}
