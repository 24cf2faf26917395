// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contract with the in-guest agent.
//!
//! The agent connects out of the guest over a vsock channel which the
//! hypervisor backs with a host-local socket under the VM directory.
//! The migration core uses exactly two synchronous calls, both bounded
//! by a caller-provided timeout: `before_suspend` right before the guest
//! is paused, and `after_resume` once it is running again on the new
//! host.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use slog::{info, Logger};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error on agent channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent RPC timed out")]
    Timeout,

    #[error("agent channel is closed")]
    Closed,

    #[error("agent reported failure (status {0})")]
    Remote(u8),
}

const OP_BEFORE_SUSPEND: u8 = 0;
const OP_AFTER_RESUME: u8 = 1;

/// Guest agent RPC surface consumed by the migration core.
#[async_trait::async_trait]
pub trait GuestAgent: Send + Sync + 'static {
    async fn before_suspend(&self, limit: Duration) -> Result<(), AgentError>;
    async fn after_resume(&self, limit: Duration) -> Result<(), AgentError>;

    /// Tears the channel down so the guest cannot observe a half-dead
    /// host side across the handoff.
    async fn close(&self);
}

/// Accept side of the agent channel: the host listens, the guest
/// connects once it has booted (or resumed).
pub struct AgentServer {
    listener: UnixListener,
    path: PathBuf,
}

impl AgentServer {
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let p = path.as_ref();
        // A stale socket from a previous run would make bind fail.
        match std::fs::remove_file(p) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(p)?;
        Ok(Self { listener, path: p.to_path_buf() })
    }

    pub async fn accept(
        &self,
        limit: Duration,
        log: Logger,
    ) -> Result<UdsAgent, AgentError> {
        let (stream, _) = tokio::time::timeout(limit, self.listener.accept())
            .await
            .map_err(|_| AgentError::Timeout)??;
        info!(log, "guest agent connected"; "path" => %self.path.display());
        Ok(UdsAgent { stream: Mutex::new(Some(stream)), log })
    }
}

impl Drop for AgentServer {
    fn drop(&mut self) {
        // Remove the socket first so the guest cannot reconnect to a
        // listener that is going away.
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A connected guest agent.  Requests are one opcode byte; responses are
/// one status byte (zero for success).
pub struct UdsAgent {
    stream: Mutex<Option<UnixStream>>,
    log: Logger,
}

impl UdsAgent {
    async fn call(&self, op: u8, limit: Duration) -> Result<(), AgentError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(AgentError::Closed)?;

        let res = tokio::time::timeout(limit, async {
            stream.write_all(&[op]).await?;
            let mut status = [0u8; 1];
            stream.read_exact(&mut status).await?;
            Ok::<u8, std::io::Error>(status[0])
        })
        .await;

        match res {
            Err(_) => Err(AgentError::Timeout),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(0)) => Ok(()),
            Ok(Ok(status)) => Err(AgentError::Remote(status)),
        }
    }
}

#[async_trait::async_trait]
impl GuestAgent for UdsAgent {
    async fn before_suspend(&self, limit: Duration) -> Result<(), AgentError> {
        info!(self.log, "calling agent BeforeSuspend");
        self.call(OP_BEFORE_SUSPEND, limit).await
    }

    async fn after_resume(&self, limit: Duration) -> Result<(), AgentError> {
        info!(self.log, "calling agent AfterResume");
        self.call(OP_AFTER_RESUME, limit).await
    }

    async fn close(&self) {
        self.stream.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::o;

    fn test_log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[tokio::test]
    async fn rpc_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let server = AgentServer::bind(&path).unwrap();

        // Fake guest: answer one BeforeSuspend with success.
        let guest = tokio::spawn({
            let path = path.clone();
            async move {
                let mut conn = UnixStream::connect(&path).await.unwrap();
                let mut op = [0u8; 1];
                conn.read_exact(&mut op).await.unwrap();
                assert_eq!(op[0], OP_BEFORE_SUSPEND);
                conn.write_all(&[0]).await.unwrap();
            }
        });

        let agent =
            server.accept(Duration::from_secs(1), test_log()).await.unwrap();
        agent.before_suspend(Duration::from_secs(1)).await.unwrap();
        guest.await.unwrap();

        agent.close().await;
        assert!(matches!(
            agent.after_resume(Duration::from_secs(1)).await,
            Err(AgentError::Closed)
        ));
    }

    #[tokio::test]
    async fn unresponsive_agent_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let server = AgentServer::bind(&path).unwrap();

        let _guest = UnixStream::connect(&path).await.unwrap();
        let agent =
            server.accept(Duration::from_secs(1), test_log()).await.unwrap();
        assert!(matches!(
            agent.before_suspend(Duration::from_millis(50)).await,
            Err(AgentError::Timeout)
        ));
    }
}
