// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use slog::{debug, info, Logger};

use crate::block::{self, Volume};
use crate::migrate::codec::{
    DeviceEvent, CUSTOM_ALL_DEVICES_SENT, CUSTOM_TRANSFER_AUTHORITY,
};
use crate::migrate::controller::SyncController;
use crate::migrate::order::BlockOrder;
use crate::migrate::source::ToDevice;
use crate::migrate::{CancelSignal, MigrateError, MigrateHooks};
use crate::vmm::VmmApi;
use crate::block::DirtySampler;

/// Convergence policy knobs for one device.
#[derive(Copy, Clone, Debug)]
pub struct MigrateParams {
    /// A dirty cycle below this count is "quiet".
    pub max_dirty_blocks: usize,
    /// Quiet cycles needed before the device reports converged.
    pub min_cycles: u32,
    /// Hard bound: the device is forced to converged after this many
    /// cycles no matter how dirty it still runs.
    pub max_cycles: u32,
    /// Minimum spacing between two dirty cycles.
    pub cycle_throttle: Duration,
    /// Whether a dirty cycle must first ask the hypervisor to msync so
    /// guest page writes reach the backing store (the memory device).
    pub requires_msync: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Precopy,
    DirtyLoop,
    Quiescing,
    FinalDirty,
    Completed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Precopy => "precopy",
            Phase::DirtyLoop => "dirty-loop",
            Phase::Quiescing => "quiescing",
            Phase::FinalDirty => "final-dirty",
            Phase::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Per-device migration driver.
///
/// Walks one device from untransferred to completed:
/// precopy -> dirty loop -> quiesce -> final dirty -> handoff.  Any I/O
/// error fails the device and, through the caller, the migration.
pub(crate) struct Migrator {
    pub to: ToDevice,
    pub storage: Arc<dyn Volume>,
    pub sampler: DirtySampler,
    pub orderer: Arc<BlockOrder>,
    pub schema: String,
    pub params: MigrateParams,
    pub concurrency: usize,
    pub rpc_timeout: Duration,
    pub controller: Arc<SyncController>,
    pub vmm: Arc<dyn VmmApi>,
    pub hooks: Arc<MigrateHooks>,
    pub cancel: CancelSignal,
    pub log: Logger,
}

async fn move_block(
    storage: Arc<dyn Volume>,
    to: ToDevice,
    block: u64,
) -> Result<u64, MigrateError> {
    let (off, len) = block::block_range(block, to.block_size, to.size);
    let data = storage.read_at(off, len).await.map_err(|err| {
        MigrateError::BlockIo { name: to.name.clone(), err }
    })?;
    to.write_at(off, data).await?;
    Ok(block)
}

impl Migrator {
    fn io_err(&self, err: std::io::Error) -> MigrateError {
        MigrateError::BlockIo { name: self.to.name.clone(), err }
    }

    fn enter(&self, phase: Phase) {
        debug!(self.log, "entering phase"; "device" => %self.to.name,
            "phase" => %phase);
    }

    pub async fn run(&self) -> Result<(), MigrateError> {
        info!(self.log, "migrating device"; "device" => %self.to.name,
            "size" => self.to.size, "block_size" => self.to.block_size);

        self.to.send_dev_info(&self.schema).await?;
        self.hooks.fire_device_sent(self.to.device, &self.to.name);
        if self.controller.device_sent() {
            self.to
                .send_event(DeviceEvent::Custom(CUSTOM_ALL_DEVICES_SENT))
                .await?;
            self.hooks.fire_all_devices_sent();
        }

        self.precopy().await?;
        let saw_dirty = self.dirty_loop().await?;
        self.quiesce().await?;
        self.final_dirty(saw_dirty).await?;
        self.handoff().await?;

        self.enter(Phase::Completed);
        Ok(())
    }

    /// Streams every block once, coolest blocks first, with peer hints
    /// reordering the remainder on the fly.
    async fn precopy(&self) -> Result<(), MigrateError> {
        self.enter(Phase::Precopy);

        let total = self.orderer.total() as usize;
        let mut ready = total - self.orderer.remaining();
        let mut inflight = FuturesUnordered::new();

        loop {
            if self.cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }

            while inflight.len() < self.concurrency {
                match self.orderer.next() {
                    Some(b) => inflight.push(move_block(
                        Arc::clone(&self.storage),
                        self.to.clone(),
                        b,
                    )),
                    None => break,
                }
            }
            match inflight.next().await {
                Some(res) => {
                    res?;
                    ready += 1;
                    self.hooks.fire_progress(self.to.device, ready, total);
                }
                None => break,
            }
        }

        info!(self.log, "precopy complete"; "device" => %self.to.name,
            "blocks" => total);
        Ok(())
    }

    /// Re-sends blocks while deciding, together with the controller, when
    /// the guest should be suspended.  Returns whether any dirty blocks
    /// were ever observed (a device that never dirtied skips its final
    /// dirty list).
    async fn dirty_loop(&self) -> Result<bool, MigrateError> {
        self.enter(Phase::DirtyLoop);

        let mut total_cycles = 0u32;
        let mut cycles_below = 0u32;
        let mut ready_signaled = false;
        let mut saw_dirty = false;

        loop {
            if self.cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            if self.controller.is_suspended() {
                return Ok(saw_dirty);
            }

            if self.params.requires_msync {
                crate::vmm::timeout_retry_once(self.rpc_timeout, || {
                    self.vmm.msync()
                })
                .await
                .map_err(MigrateError::Vmm)?;
            }

            let blocks = self.sampler.take_dirty().map_err(|e| {
                self.io_err(e)
            })?;
            if !blocks.is_empty() {
                saw_dirty = true;
                self.to.dirty_list(&blocks).await?;
                self.move_dirty(&blocks).await?;
                self.hooks.fire_dirty_progress(self.to.device, blocks.len());
            }

            total_cycles += 1;
            if blocks.len() < self.params.max_dirty_blocks {
                cycles_below += 1;
                if cycles_below > self.params.min_cycles && !ready_signaled {
                    ready_signaled = true;
                    self.controller.device_ready().await?;
                }
            } else if total_cycles > self.params.max_cycles {
                if !ready_signaled {
                    info!(self.log, "forcing convergence";
                        "device" => %self.to.name,
                        "cycles" => total_cycles);
                    ready_signaled = true;
                    self.controller.device_ready().await?;
                }
            } else {
                cycles_below = 0;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.params.cycle_throttle) => {}
                _ = self.controller.suspended() => {}
                _ = self.cancel.cancelled() => {
                    return Err(MigrateError::Cancelled);
                }
            }
        }
    }

    /// With the guest suspended, close the gate so the next dirty sample
    /// is provably the final one.
    async fn quiesce(&self) -> Result<(), MigrateError> {
        self.enter(Phase::Quiescing);
        self.to.send_event(DeviceEvent::PreLock).await?;
        self.storage.lock().await;
        self.to.send_event(DeviceEvent::PostLock).await?;
        Ok(())
    }

    async fn final_dirty(&self, saw_dirty: bool) -> Result<(), MigrateError> {
        self.enter(Phase::FinalDirty);
        let blocks = self.sampler.take_dirty().map_err(|e| self.io_err(e))?;
        if blocks.is_empty() && !saw_dirty {
            return Ok(());
        }
        self.to.dirty_list(&blocks).await?;
        self.move_dirty(&blocks).await?;
        self.hooks.fire_final_progress(self.to.device, blocks.len());
        Ok(())
    }

    /// Authority handoff: after the last `WriteAt`, the destination's
    /// copy is the canonical one.
    async fn handoff(&self) -> Result<(), MigrateError> {
        self.to.send_event(DeviceEvent::PreUnlock).await?;
        self.storage.unlock();
        self.to.send_event(DeviceEvent::PostUnlock).await?;

        self.to
            .send_event(DeviceEvent::Custom(CUSTOM_TRANSFER_AUTHORITY))
            .await?;
        self.hooks.fire_authority_sent(self.to.device);

        self.to.send_event(DeviceEvent::Completed).await?;
        self.hooks.fire_device_completed(self.to.device);
        Ok(())
    }

    /// Moves a dirty set with the same concurrency quota as precopy.
    /// Duplicate entries collapse; each block is re-read after the
    /// sample, so the bytes on the wire are at least as new as the dirt.
    async fn move_dirty(&self, blocks: &[u64]) -> Result<(), MigrateError> {
        let unique = blocks.iter().copied().collect::<BTreeSet<_>>();
        let mut iter = unique.into_iter();
        let mut inflight = FuturesUnordered::new();

        loop {
            while inflight.len() < self.concurrency {
                match iter.next() {
                    Some(b) => inflight.push(move_block(
                        Arc::clone(&self.storage),
                        self.to.clone(),
                        b,
                    )),
                    None => break,
                }
            }
            match inflight.next().await {
                Some(res) => {
                    res?;
                }
                None => return Ok(()),
            }
        }
    }
}
