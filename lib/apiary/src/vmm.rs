// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contract with the out-of-process hypervisor.
//!
//! The migration core never manages the hypervisor process itself; it
//! drives snapshots and memory syncs through this small RPC surface,
//! reached over the hypervisor's per-VM control socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slog::{debug, Logger};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Debug, Error)]
pub enum VmmError {
    #[error("I/O error on control socket: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    BadResponse(#[from] serde_json::Error),

    #[error("hypervisor rejected request: {0}")]
    Remote(String),

    #[error("hypervisor RPC timed out")]
    Timeout,
}

/// Snapshot flavors the hypervisor distinguishes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Full state + memory snapshot; the VM can be resumed from it.
    Full,
    /// Memory msync plus a state file refresh.
    MsyncAndState,
    /// Memory msync only: flush guest pages to the memory backing store.
    Msync,
}

/// Hypervisor RPC surface consumed by the migration core.
#[async_trait::async_trait]
pub trait VmmApi: Send + Sync + 'static {
    async fn resume_snapshot(
        &self,
        state: &Path,
        memory: &Path,
    ) -> Result<(), VmmError>;

    async fn create_snapshot(
        &self,
        state: &Path,
        memory: &Path,
        kind: SnapshotKind,
    ) -> Result<(), VmmError>;

    /// Flush guest memory pages into the memory backing store so the
    /// dirty tracker under it sees them.
    async fn msync(&self) -> Result<(), VmmError>;
}

/// Runs `op` under `timeout`, retrying exactly once on timeout.  Used
/// for hypervisor calls made before the suspend sequence, where a single
/// retry is cheap and a hung hypervisor must still surface promptly.
pub async fn timeout_retry_once<F, Fut>(
    limit: Duration,
    mut op: F,
) -> Result<(), VmmError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), VmmError>>,
{
    for attempt in 0..2 {
        match tokio::time::timeout(limit, op()).await {
            Ok(res) => return res,
            Err(_) if attempt == 0 => continue,
            Err(_) => break,
        }
    }
    Err(VmmError::Timeout)
}

#[derive(Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Request<'a> {
    ResumeSnapshot { state: &'a Path, memory: &'a Path },
    CreateSnapshot { state: &'a Path, memory: &'a Path, kind: SnapshotKind },
    Msync,
}

#[derive(Deserialize)]
struct Response {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Line-JSON client for the hypervisor control socket under the VM
/// directory.  One connection per call; the hypervisor serialises
/// requests on its end.
pub struct UdsVmm {
    path: PathBuf,
    log: Logger,
}

impl UdsVmm {
    pub fn new(path: impl Into<PathBuf>, log: Logger) -> Self {
        Self { path: path.into(), log }
    }

    async fn call(&self, req: Request<'_>) -> Result<(), VmmError> {
        let mut line = serde_json::to_vec(&req)?;
        line.push(b'\n');

        let stream = UnixStream::connect(&self.path).await?;
        let (r, mut w) = stream.into_split();
        w.write_all(&line).await?;

        let mut resp_line = String::new();
        BufReader::new(r).read_line(&mut resp_line).await?;
        let resp: Response = serde_json::from_str(&resp_line)?;
        if resp.ok {
            debug!(self.log, "vmm rpc ok");
            Ok(())
        } else {
            Err(VmmError::Remote(
                resp.error.unwrap_or_else(|| "unspecified".to_string()),
            ))
        }
    }
}

#[async_trait::async_trait]
impl VmmApi for UdsVmm {
    async fn resume_snapshot(
        &self,
        state: &Path,
        memory: &Path,
    ) -> Result<(), VmmError> {
        self.call(Request::ResumeSnapshot { state, memory }).await
    }

    async fn create_snapshot(
        &self,
        state: &Path,
        memory: &Path,
        kind: SnapshotKind,
    ) -> Result<(), VmmError> {
        self.call(Request::CreateSnapshot { state, memory, kind }).await
    }

    async fn msync(&self) -> Result<(), VmmError> {
        self.call(Request::Msync).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retry_once_then_give_up() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let res = timeout_retry_once(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        })
        .await;
        assert!(matches!(res, Err(VmmError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn first_success_wins() {
        let res = timeout_retry_once(Duration::from_secs(1), || async {
            Ok(())
        })
        .await;
        assert!(res.is_ok());
    }
}
