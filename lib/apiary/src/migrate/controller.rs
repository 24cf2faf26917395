// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use slog::{error, info, Logger};
use tokio::sync::watch;

use crate::agent::GuestAgent;
use crate::migrate::{MigrateError, MigrateHooks, RescueConfig};
use crate::vmm::{SnapshotKind, VmmApi};

/// Cross-device convergence controller.
///
/// Tracks how many devices have announced themselves and how many have
/// converged, fires `AllDevicesSent` bookkeeping, and runs the suspend
/// sequence exactly once when every device is ready for authority
/// transfer.  Migrators observe suspension through a watch channel
/// signalled a single time.
pub struct SyncController {
    total: usize,
    sent: AtomicUsize,
    ready: AtomicUsize,
    suspend_started: AtomicBool,

    suspended_tx: watch::Sender<bool>,
    suspended_rx: watch::Receiver<bool>,

    vmm: Arc<dyn VmmApi>,
    agent: Arc<dyn GuestAgent>,
    suspend_timeout: Duration,
    rpc_timeout: Duration,
    rescue: Option<RescueConfig>,
    hooks: Arc<MigrateHooks>,
    log: Logger,
}

impl SyncController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        total: usize,
        vmm: Arc<dyn VmmApi>,
        agent: Arc<dyn GuestAgent>,
        suspend_timeout: Duration,
        rpc_timeout: Duration,
        rescue: Option<RescueConfig>,
        hooks: Arc<MigrateHooks>,
        log: Logger,
    ) -> Arc<Self> {
        let (suspended_tx, suspended_rx) = watch::channel(false);
        Arc::new(Self {
            total,
            sent: AtomicUsize::new(0),
            ready: AtomicUsize::new(0),
            suspend_started: AtomicBool::new(false),
            suspended_tx,
            suspended_rx,
            vmm,
            agent,
            suspend_timeout,
            rpc_timeout,
            rescue,
            hooks,
            log,
        })
    }

    /// Records a `DevInfo` sent; returns true for the caller that
    /// completed the set, which then emits `AllDevicesSent`.
    pub fn device_sent(&self) -> bool {
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        n == self.total
    }

    /// Records a device having converged.  The caller that completes the
    /// set runs the suspend sequence inline; everyone else keeps cycling
    /// until the broadcast.
    pub async fn device_ready(&self) -> Result<(), MigrateError> {
        let n = self.ready.fetch_add(1, Ordering::SeqCst) + 1;
        info!(self.log, "device ready for authority transfer";
            "ready" => n, "total" => self.total);
        if n >= self.total {
            self.suspend().await?;
        }
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        *self.suspended_rx.borrow()
    }

    /// Resolves once the suspend broadcast has fired.
    pub async fn suspended(&self) {
        let mut rx = self.suspended_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The suspend sequence.  Runs at most once regardless of how many
    /// devices report ready in parallel; cancellation is not honored
    /// between here and the broadcast (the sequence completes or the VM
    /// is lost to the rescue path).
    async fn suspend(&self) -> Result<(), MigrateError> {
        if self.suspend_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(self.log, "all devices ready; suspending guest");
        self.hooks.fire_before_suspend();

        if let Err(e) = self.agent.before_suspend(self.suspend_timeout).await {
            return Err(self.rescue(MigrateError::Agent(e)).await);
        }
        self.agent.close().await;

        // Final msync: every page the guest dirtied before suspension is
        // now visible to the dirty trackers.
        let res = tokio::time::timeout(self.rpc_timeout, self.vmm.msync())
            .await
            .map_err(|_| crate::vmm::VmmError::Timeout)
            .and_then(|r| r);
        if let Err(e) = res {
            return Err(self.rescue(MigrateError::Vmm(e)).await);
        }

        self.suspended_tx.send_replace(true);
        self.hooks.fire_after_suspend();
        Ok(())
    }

    /// Failure after the guest stopped answering is unrecoverable for
    /// the migration; take a local recovery snapshot so the VM can be
    /// re-resumed on this host, then surface the original error.
    async fn rescue(&self, cause: MigrateError) -> MigrateError {
        error!(self.log, "suspend sequence failed: {cause}");
        let Some(rescue) = self.rescue.as_ref() else {
            return MigrateError::Suspend {
                cause: Box::new(cause),
                rescued: false,
            };
        };

        let rescued = self
            .vmm
            .create_snapshot(
                &rescue.state_path,
                &rescue.memory_path,
                SnapshotKind::Full,
            )
            .await
            .map_err(|e| {
                error!(self.log, "recovery snapshot failed: {e}");
            })
            .is_ok();
        if rescued {
            info!(self.log, "recovery snapshot written";
                "state" => %rescue.state_path.display());
        }
        MigrateError::Suspend { cause: Box::new(cause), rescued }
    }
}
