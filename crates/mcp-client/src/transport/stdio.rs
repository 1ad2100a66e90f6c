//! Process-pipe transport
//!
//! Spawns the server as a child process and exchanges newline-delimited
//! JSON over its stdin/stdout. Tasks own the pipes: one writes queued lines
//! to stdin, one reads stdout, one drains stderr into the log. Both `send`
//! and `receive` only touch channels, so either can be cancelled without
//! leaving a partial frame on the wire.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use agent_core::{AgentError, Result};

use super::{Inbound, Transport, TransportKind, next_inbound};
use crate::protocol::JsonRpcMessage;

/// How long `close()` waits for the child to exit after stdin is closed
const EXIT_GRACE: Duration = Duration::from_secs(2);

const INBOUND_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 64;

/// Transport over a child process's standard streams
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    child: Option<Child>,
    outbound: Option<mpsc::Sender<String>>,
    inbound: Option<Inbound>,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioTransport {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            cwd: None,
            child: None,
            outbound: None,
            inbound: None,
            tasks: Vec::new(),
        }
    }

    pub fn with_envs(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    /// OS process id of the running server
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    fn spawn_writer(&mut self, mut stdin: ChildStdin) {
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
        let name = self.command.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let written = match stdin.write_all(line.as_bytes()).await {
                    Ok(()) => stdin.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    warn!(server = %name, "Failed to write to server stdin: {}", e);
                    break;
                }
            }
        }));
        self.outbound = Some(tx);
    }

    fn spawn_readers(&mut self, child: &mut Child) -> Result<()> {
        let stdout = child.stdout.take()
            .ok_or_else(|| AgentError::Transport("Failed to capture server stdout".to_string()))?;
        let stderr = child.stderr.take()
            .ok_or_else(|| AgentError::Transport("Failed to capture server stderr".to_string()))?;

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let name = self.command.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match JsonRpcMessage::parse(line) {
                            Ok(message) => {
                                if tx.send(Ok(message)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(server = %name, "Skipping non-protocol output: {}", e),
                        }
                    }
                    Ok(None) => {
                        debug!(server = %name, "Server stdout closed");
                        break;
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(AgentError::TransportClosed(format!("read from {} failed: {}", name, e))))
                            .await;
                        break;
                    }
                }
            }
        }));

        let name = self.command.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %name, "stderr: {}", line);
            }
        }));

        self.inbound = Some(rx);
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    async fn connect(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(AgentError::InvalidState(format!("{} is already running", self.command)));
        }
        debug!("Spawning tool server: {} {:?}", self.command, self.args);

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn()
            .map_err(|e| AgentError::Transport(format!("Failed to spawn '{}': {}", self.command, e)))?;

        let stdin = child.stdin.take()
            .ok_or_else(|| AgentError::Transport("Failed to capture server stdin".to_string()))?;
        self.spawn_writer(stdin);
        self.spawn_readers(&mut child)?;
        self.child = Some(child);
        Ok(())
    }

    async fn send(&mut self, message: &JsonRpcMessage) -> Result<()> {
        let outbound = self.outbound.as_ref()
            .ok_or_else(|| AgentError::Transport(format!("{} transport is closed", self.command)))?;

        let mut json = message.to_json()?;
        json.push('\n');
        debug!(server = %self.command, "-> {}", json.trim_end());

        outbound.send(json).await
            .map_err(|_| AgentError::Transport(format!("{} stopped accepting input", self.command)))
    }

    async fn receive(&mut self, timeout: Option<Duration>) -> Result<JsonRpcMessage> {
        next_inbound(self.inbound.as_mut(), timeout, &self.command).await
    }

    async fn close(&mut self) -> Result<()> {
        // the writer task drops stdin once its queue drains, which asks a
        // well-behaved server to exit
        self.outbound = None;
        self.inbound = None;

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(server = %self.command, %status, "Tool server exited"),
                Ok(Err(e)) => warn!(server = %self.command, "Failed to reap tool server: {}", e),
                Err(_) => {
                    warn!(server = %self.command, "Tool server did not exit, killing it");
                    if let Err(e) = child.kill().await {
                        warn!(server = %self.command, "Failed to kill tool server: {}", e);
                    }
                }
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // kill_on_drop takes care of the child
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcRequest;

    #[tokio::test]
    async fn test_spawn_failure_is_transport_error() {
        let mut transport = StdioTransport::new("definitely-not-a-real-binary-4f2a", vec![]);
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
    }

    #[tokio::test]
    async fn test_echo_roundtrip_and_exit() {
        // `cat` echoes every line back, which is enough to exercise framing
        let mut transport = StdioTransport::new("cat", vec![]);
        transport.connect().await.unwrap();
        assert!(transport.pid().is_some());

        let request: JsonRpcMessage = JsonRpcRequest::ping(1).into();
        transport.send(&request).await.unwrap();
        let echoed = transport.receive(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(echoed, request);

        let err = transport.receive(Some(Duration::from_millis(20))).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.send(&request).await.is_err());
        assert!(matches!(
            transport.receive(None).await,
            Err(AgentError::TransportClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_process_exit_surfaces_as_closed() {
        let mut transport = StdioTransport::new("true", vec![]);
        transport.connect().await.unwrap();

        let err = transport.receive(Some(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, AgentError::TransportClosed(_)));
    }
}
