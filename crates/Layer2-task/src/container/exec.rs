//! Command execution channel
//!
//! Runs one command inside a live container, splits the attached stream
//! into independent stdout / stderr channels, and allows cancelling just
//! that command (the container keeps running). The channels are unbounded:
//! a caller may drain one stream to the end before touching the other.

use super::client::{ControlSocket, ExecChunk, ExecSpec};
use super::manager::ContainerHandle;
use berth_foundation::{Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// ============================================================================
// ExecSession
// ============================================================================

/// A running command
pub struct ExecSession {
    pub exec_id: String,
    /// In-container PID, if inspection caught it while running
    pub pid: Option<i64>,
    pub stdout: mpsc::UnboundedReceiver<Vec<u8>>,
    pub stderr: mpsc::UnboundedReceiver<Vec<u8>>,
    pub cancel: ExecCancel,
    pub completion: ExecCompletion,
}

/// Resolves when the attached stream ends
pub struct ExecCompletion {
    handle: JoinHandle<Result<Option<i64>>>,
}

impl ExecCompletion {
    /// Exit code from exec inspection (None if the daemon did not report one)
    pub async fn wait(self) -> Result<Option<i64>> {
        self.handle
            .await
            .map_err(|e| Error::Exec(format!("exec pump task failed: {}", e)))?
    }
}

/// Cancels one exec without touching its container
#[derive(Clone)]
pub struct ExecCancel {
    socket: Arc<dyn ControlSocket>,
    container_id: String,
    exec_id: String,
    pid: Option<i64>,
}

impl ExecCancel {
    /// Send SIGTERM to the exec's process via a second exec.
    ///
    /// No-op if the exec already finished or its PID is unknown. Kill failures
    /// are swallowed: the process may exit between inspection and kill.
    pub async fn cancel(&self) {
        let status = match self.socket.inspect_exec(&self.exec_id).await {
            Ok(status) => status,
            Err(e) => {
                debug!(exec = %self.exec_id, error = %e, "Exec inspect failed, nothing to cancel");
                return;
            }
        };

        if !status.running {
            debug!(exec = %self.exec_id, "Exec already finished, cancel is a no-op");
            return;
        }

        let Some(pid) = status.pid.or(self.pid) else {
            debug!(exec = %self.exec_id, "Exec PID unknown, cancel is a no-op");
            return;
        };

        let kill = ExecSpec {
            cmd: vec!["kill".into(), "-TERM".into(), pid.to_string()],
            ..Default::default()
        };

        let result = async {
            let kill_id = self.socket.create_exec(&self.container_id, &kill).await?;
            let mut output = self.socket.start_exec(&kill_id).await?;
            while output.next().await.is_some() {}
            Ok::<_, Error>(())
        }
        .await;

        match result {
            Ok(()) => debug!(exec = %self.exec_id, pid, "Sent SIGTERM"),
            Err(e) => debug!(exec = %self.exec_id, pid, error = %e, "Kill exec failed (ignored)"),
        }
    }
}

// ============================================================================
// ExecChannel
// ============================================================================

/// Starts commands in containers owned by the lifecycle manager
#[derive(Clone)]
pub struct ExecChannel {
    socket: Arc<dyn ControlSocket>,
}

impl ExecChannel {
    pub fn new(socket: Arc<dyn ControlSocket>) -> Self {
        Self { socket }
    }

    pub async fn execute(&self, handle: &ContainerHandle, spec: ExecSpec) -> Result<ExecSession> {
        let exec_id = self.socket.create_exec(&handle.container_id, &spec).await?;
        let mut output = self.socket.start_exec(&exec_id).await?;

        let pid = match self.socket.inspect_exec(&exec_id).await {
            Ok(status) if status.running => status.pid,
            Ok(_) => None,
            Err(e) => {
                debug!(exec = %exec_id, error = %e, "PID capture failed");
                None
            }
        };

        debug!(
            session_id = %handle.session_id,
            container = %handle.name,
            exec = %exec_id,
            ?pid,
            "Exec started"
        );

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();

        let socket = Arc::clone(&self.socket);
        let pump_exec_id = exec_id.clone();
        let pump = tokio::spawn(async move {
            while let Some(chunk) = output.next().await {
                // A dropped receiver only stops that stream; keep draining the other
                match chunk? {
                    ExecChunk::Stdout(bytes) => {
                        let _ = stdout_tx.send(bytes);
                    }
                    ExecChunk::Stderr(bytes) => {
                        let _ = stderr_tx.send(bytes);
                    }
                }
            }
            drop(stdout_tx);
            drop(stderr_tx);

            match socket.inspect_exec(&pump_exec_id).await {
                Ok(status) => Ok::<_, Error>(status.exit_code),
                Err(e) => {
                    warn!(exec = %pump_exec_id, error = %e, "Exit code unavailable");
                    Ok(None)
                }
            }
        });

        Ok(ExecSession {
            exec_id: exec_id.clone(),
            pid,
            stdout: stdout_rx,
            stderr: stderr_rx,
            cancel: ExecCancel {
                socket: Arc::clone(&self.socket),
                container_id: handle.container_id.clone(),
                exec_id,
                pid,
            },
            completion: ExecCompletion { handle: pump },
        })
    }
}

// ============================================================================
// LineBuffer
// ============================================================================

/// Splits streamed bytes into newline-terminated records
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every record completed by them (without `\n`/`\r\n`)
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// The unterminated trailing record, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::testing::{ExecScript, MockControlSocket};
    use std::time::Duration;

    fn handle(socket: &MockControlSocket) -> ContainerHandle {
        ContainerHandle {
            session_id: "s1".into(),
            container_id: socket.add_container("berth-session-s1", true),
            name: "berth-session-s1".into(),
        }
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend(chunk);
        }
        out
    }

    #[test]
    fn test_line_buffer_splits_records() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"a\":").is_empty());
        assert_eq!(buf.push(b"1}\n{\"b\":2}\r\npar"), vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buf.finish().as_deref(), Some("par"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_line_buffer_no_partial() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"one\ntwo\n"), vec!["one", "two"]);
        assert_eq!(buf.finish(), None);
    }

    #[tokio::test]
    async fn test_execute_demultiplexes_streams() {
        let socket = Arc::new(MockControlSocket::new());
        socket.script_exec(
            ExecScript::new(0)
                .stdout("out-1\n")
                .stderr("err-1\n")
                .stdout("out-2\n"),
        );
        let channel = ExecChannel::new(socket.clone());

        let mut session = channel
            .execute(&handle(&socket), ExecSpec {
                cmd: vec!["echo".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        let stdout = drain(&mut session.stdout).await;
        let stderr = drain(&mut session.stderr).await;
        assert_eq!(stdout, b"out-1\nout-2\n");
        assert_eq!(stderr, b"err-1\n");
        assert_eq!(session.completion.wait().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_streams_do_not_block_each_other() {
        let socket = Arc::new(MockControlSocket::new());
        let mut script = ExecScript::new(0);
        for i in 0..1000 {
            script = script.stderr(&format!("warning {}\n", i));
        }
        socket.script_exec(script.stdout("result\n"));
        let channel = ExecChannel::new(socket.clone());

        let mut session = channel.execute(&handle(&socket), ExecSpec::default()).await.unwrap();

        let stdout = tokio::time::timeout(Duration::from_secs(2), drain(&mut session.stdout))
            .await
            .expect("stdout drains while stderr is unread");
        assert_eq!(stdout, b"result\n");

        let stderr = drain(&mut session.stderr).await;
        assert_eq!(stderr.iter().filter(|b| **b == b'\n').count(), 1000);
        assert_eq!(session.completion.wait().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_cancel_after_exit_is_noop() {
        let socket = Arc::new(MockControlSocket::new());
        socket.script_exec(ExecScript::new(0).stdout("done\n"));
        let channel = ExecChannel::new(socket.clone());

        let mut session = channel.execute(&handle(&socket), ExecSpec::default()).await.unwrap();
        drain(&mut session.stdout).await;
        session.completion.wait().await.unwrap();

        session.cancel.cancel().await;
        assert!(!socket.calls().iter().any(|c| c.starts_with("create_exec kill")));
    }

    #[tokio::test]
    async fn test_cancel_running_exec_sends_sigterm() {
        let socket = Arc::new(MockControlSocket::new());
        socket.script_exec(ExecScript::new(0).stdout("working\n").hold_open());
        let channel = ExecChannel::new(socket.clone());

        let mut session = channel.execute(&handle(&socket), ExecSpec::default()).await.unwrap();
        let pid = session.pid.expect("pid captured while running");

        session.cancel.cancel().await;

        assert!(socket
            .calls()
            .contains(&format!("create_exec kill -TERM {}", pid)));
        // Killed process ends the stream; container untouched
        drain(&mut session.stdout).await;
        assert_eq!(session.completion.wait().await.unwrap(), Some(143));
        assert!(!socket.calls().iter().any(|c| c.starts_with("stop_container")));
    }
}
