// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The live migration engine.
//!
//! A migration moves a device group from a source peer to a destination
//! peer over one duplex byte stream while the guest keeps running.  The
//! source streams every block (precopy), then chases the guest's writes
//! in throttled dirty cycles until every device converges; the guest is
//! suspended exactly once, the final dirty set is flushed, and write
//! authority is handed to the destination device by device.
//!
//! The destination materialises devices lazily as descriptors arrive and
//! serves guest reads out of a waiting cache that pulls not-yet-received
//! blocks ahead of their turn.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use slog::{info, warn, Logger};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinSet;

pub mod codec;
mod controller;
mod destination;
pub mod migrator;
mod order;
mod proto;
mod source;

pub use codec::{
    DeviceEvent, ProtocolError, CUSTOM_ALL_DEVICES_SENT,
    CUSTOM_TRANSFER_AUTHORITY,
};
pub use source::ToDevice;

use crate::agent::{AgentError, GuestAgent};
use crate::device::{DeviceGroup, DeviceSpec, ExposeMode};
use crate::migrate::controller::SyncController;
use crate::migrate::migrator::Migrator;
use crate::migrate::order::BlockOrder;
use crate::migrate::proto::FrameSender;
use crate::migrate::source::SourceDevice;
use crate::vmm::{VmmApi, VmmError};

/// Errors which may occur during the course of a migration.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Encountered an error encoding/decoding or transporting frames
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer announced a device this side has no configuration for
    #[error("unknown device name ({0})")]
    UnknownDevice(String),

    /// Two different devices claimed the same protocol index
    #[error("conflicting descriptor for device index {0}")]
    DuplicateDevice(u32),

    /// A frame referenced a device index with no prior `DevInfo`
    #[error("frame for device index {0} before its descriptor")]
    NotAdmitted(u32),

    /// A device was asked to migrate without the migratable layers
    #[error("device {0} was not made migratable")]
    NotMigratable(String),

    /// Storage I/O failed underneath a device
    #[error("device {name}: {err}")]
    BlockIo {
        name: String,
        #[source]
        err: std::io::Error,
    },

    /// Exposing a device as a host block node failed
    #[error("could not expose device: {0}")]
    Expose(String),

    /// A hypervisor RPC failed or timed out beyond its retry
    #[error("hypervisor RPC failed: {0}")]
    Vmm(#[from] VmmError),

    /// A guest agent RPC failed or timed out
    #[error("guest agent RPC failed: {0}")]
    Agent(#[from] AgentError),

    /// The suspend sequence failed; the guest may only be recoverable
    /// from the rescue snapshot
    #[error(
        "suspend sequence failed (recovery snapshot taken: {rescued}): {cause}"
    )]
    Suspend { cause: Box<MigrateError>, rescued: bool },

    /// The migration's cancellation scope fired
    #[error("migration cancelled")]
    Cancelled,

    /// The stream closed while devices were still in flight
    #[error("transport closed with {0} devices unfinished")]
    Incomplete(usize),

    /// A migration task died without reporting
    #[error("migration task failed: {0}")]
    TaskFailed(String),
}

/// Cancellation scope for one migration.  Cancelling breaks the stream
/// readers (treated as EOF), stops block movers at the next frame
/// boundary, and surfaces as [`MigrateError::Cancelled`] from drivers.
#[derive(Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        Self { tx: Arc::new(watch::channel(false).0) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves when (and only when) the scope is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Where to write the recovery snapshot if the suspend sequence fails
/// past the point of no return.
#[derive(Clone, Debug)]
pub struct RescueConfig {
    pub state_path: PathBuf,
    pub memory_path: PathBuf,
}

type Hook0 = Box<dyn Fn() + Send + Sync>;
type HookDev = Box<dyn Fn(u32, &str) + Send + Sync>;
type HookIdx = Box<dyn Fn(u32) + Send + Sync>;

/// Source-side observation points, all optional.
#[derive(Default)]
pub struct MigrateHooks {
    pub on_before_suspend: Option<Hook0>,
    pub on_after_suspend: Option<Hook0>,
    pub on_device_sent: Option<HookDev>,
    /// Precopy progress: `(device, ready_blocks, total_blocks)`.
    pub on_progress: Option<Box<dyn Fn(u32, usize, usize) + Send + Sync>>,
    /// One dirty cycle re-sent this many blocks.
    pub on_dirty_progress: Option<Box<dyn Fn(u32, usize) + Send + Sync>>,
    /// The final dirty set held this many blocks.
    pub on_final_progress: Option<Box<dyn Fn(u32, usize) + Send + Sync>>,
    pub on_authority_sent: Option<HookIdx>,
    pub on_device_completed: Option<HookIdx>,
    pub on_all_devices_sent: Option<Hook0>,
    pub on_all_completed: Option<Hook0>,
}

impl MigrateHooks {
    pub(crate) fn fire_before_suspend(&self) {
        if let Some(h) = &self.on_before_suspend {
            h();
        }
    }
    pub(crate) fn fire_after_suspend(&self) {
        if let Some(h) = &self.on_after_suspend {
            h();
        }
    }
    pub(crate) fn fire_device_sent(&self, dev: u32, name: &str) {
        if let Some(h) = &self.on_device_sent {
            h(dev, name);
        }
    }
    pub(crate) fn fire_progress(&self, dev: u32, ready: usize, total: usize) {
        if let Some(h) = &self.on_progress {
            h(dev, ready, total);
        }
    }
    pub(crate) fn fire_dirty_progress(&self, dev: u32, delta: usize) {
        if let Some(h) = &self.on_dirty_progress {
            h(dev, delta);
        }
    }
    pub(crate) fn fire_final_progress(&self, dev: u32, delta: usize) {
        if let Some(h) = &self.on_final_progress {
            h(dev, delta);
        }
    }
    pub(crate) fn fire_authority_sent(&self, dev: u32) {
        if let Some(h) = &self.on_authority_sent {
            h(dev);
        }
    }
    pub(crate) fn fire_device_completed(&self, dev: u32) {
        if let Some(h) = &self.on_device_completed {
            h(dev);
        }
    }
    pub(crate) fn fire_all_devices_sent(&self) {
        if let Some(h) = &self.on_all_devices_sent {
            h();
        }
    }
    pub(crate) fn fire_all_completed(&self) {
        if let Some(h) = &self.on_all_completed {
            h();
        }
    }
}

/// Destination-side observation points, all optional.
#[derive(Default)]
pub struct FromHooks {
    pub on_device_received: Option<HookDev>,
    pub on_device_exposed: Option<Box<dyn Fn(u32, &Path) + Send + Sync>>,
    pub on_authority_received: Option<HookIdx>,
    pub on_device_completed: Option<HookIdx>,
    pub on_all_devices_sent: Option<Hook0>,
}

impl FromHooks {
    pub(crate) fn fire_device_received(&self, dev: u32, name: &str) {
        if let Some(h) = &self.on_device_received {
            h(dev, name);
        }
    }
    pub(crate) fn fire_device_exposed(&self, dev: u32, node: &Path) {
        if let Some(h) = &self.on_device_exposed {
            h(dev, node);
        }
    }
    pub(crate) fn fire_authority_received(&self, dev: u32) {
        if let Some(h) = &self.on_authority_received {
            h(dev);
        }
    }
    pub(crate) fn fire_device_completed(&self, dev: u32) {
        if let Some(h) = &self.on_device_completed {
            h(dev);
        }
    }
    pub(crate) fn fire_all_devices_sent(&self) {
        if let Some(h) = &self.on_all_devices_sent {
            h();
        }
    }
}

/// Pure rewrite applied to each incoming schema hint before admission:
/// `(device_name, schema) -> schema`.  May redirect paths; cannot alter
/// device geometry, which rides in dedicated descriptor fields.
pub type SchemaRewriteFn = Box<dyn Fn(&str, &str) -> String + Send + Sync>;

pub struct MigrateToOptions {
    /// Parallel block movers per device.
    pub concurrency: usize,
    /// Bound on the guest agent's `before_suspend`.
    pub suspend_timeout: Duration,
    /// Bound on a single hypervisor RPC.
    pub rpc_timeout: Duration,
    pub rescue: Option<RescueConfig>,
    pub cancel: CancelSignal,
    pub hooks: MigrateHooks,
}

impl Default for MigrateToOptions {
    fn default() -> Self {
        Self {
            concurrency: 16,
            suspend_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            rescue: None,
            cancel: CancelSignal::new(),
            hooks: MigrateHooks::default(),
        }
    }
}

#[derive(Default)]
pub struct MigrateFromOptions {
    pub hooks: FromHooks,
    pub schema_rewrite: Option<SchemaRewriteFn>,
    pub cancel: CancelSignal,
}

/// Migrates every migratable device in `group` to the peer on the other
/// end of `stream`.  Returns once each device has been handed over and
/// acknowledged, with the guest left suspended; on failure before the
/// suspend sequence the guest is untouched and keeps running here.
pub async fn migrate_to<S>(
    group: &Arc<DeviceGroup>,
    vmm: Arc<dyn VmmApi>,
    agent: Arc<dyn GuestAgent>,
    stream: S,
    opts: MigrateToOptions,
    log: &Logger,
) -> Result<(), MigrateError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    group.make_migratable()?;
    let entries = group
        .entries()
        .into_iter()
        .filter(|e| e.spec.make_migratable && !e.spec.shared)
        .collect::<Vec<_>>();
    if entries.is_empty() {
        warn!(log, "migrate_to called with no migratable devices");
        return Ok(());
    }

    let (r, w) = tokio::io::split(stream);
    let sender = FrameSender::new(w);
    let hooks = Arc::new(opts.hooks);
    let controller = SyncController::new(
        entries.len(),
        Arc::clone(&vmm),
        agent,
        opts.suspend_timeout,
        opts.rpc_timeout,
        opts.rescue.clone(),
        Arc::clone(&hooks),
        log.clone(),
    );

    let mut source_devices = std::collections::HashMap::new();
    let mut migrators = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        let index = i as u32;
        let sampler = entry
            .dirty_sampler()
            .ok_or_else(|| MigrateError::NotMigratable(entry.name.clone()))?;
        let volatility = entry
            .volatility()
            .ok_or_else(|| MigrateError::NotMigratable(entry.name.clone()))?;

        let total =
            crate::block::block_count(entry.size(), entry.block_size());
        let orderer = Arc::new(BlockOrder::new(total));
        orderer.add_all(&volatility);

        source_devices.insert(
            index,
            SourceDevice {
                name: entry.name.clone(),
                storage: entry.storage(),
                orderer: Arc::clone(&orderer),
                block_size: entry.block_size(),
            },
        );

        let schema = serde_json::json!({
            "base": entry.spec.base,
            "overlay": entry.spec.overlay,
            "state": entry.spec.state,
        })
        .to_string();

        migrators.push(Migrator {
            to: ToDevice::new(
                index,
                entry.name.clone(),
                entry.size(),
                entry.block_size(),
                Arc::clone(&sender),
            ),
            storage: entry.storage(),
            sampler,
            orderer,
            schema,
            params: entry.spec.params(),
            concurrency: opts.concurrency,
            rpc_timeout: opts.rpc_timeout,
            controller: Arc::clone(&controller),
            vmm: Arc::clone(&vmm),
            hooks: Arc::clone(&hooks),
            cancel: opts.cancel.clone(),
            log: log.clone(),
        });
    }

    let dispatch = tokio::spawn(source::run_source_dispatch(
        r,
        Arc::clone(&sender),
        source_devices,
        opts.cancel.clone(),
        log.clone(),
    ));

    let mut tasks = JoinSet::new();
    for m in migrators {
        tasks.spawn(async move { m.run().await });
    }

    let mut first_err: Option<MigrateError> = None;
    while let Some(joined) = tasks.join_next().await {
        let res = match joined {
            Ok(res) => res,
            Err(e) => Err(MigrateError::TaskFailed(e.to_string())),
        };
        if let Err(e) = res {
            if first_err.is_none() {
                // First fatal cancels the scope; the remaining migrators
                // unwind at their next checkpoint.
                opts.cancel.cancel();
                first_err = Some(e);
            }
        }
    }

    opts.cancel.cancel();
    match dispatch.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(log, "source dispatch failed: {e}"),
        Err(e) => warn!(log, "source dispatch task died: {e}"),
    }

    match first_err {
        Some(e) => Err(e),
        None => {
            let _ = sender.shutdown().await;
            group.audit_digests().await;
            hooks.fire_all_completed();
            info!(log, "all device migrations completed");
            Ok(())
        }
    }
}

/// An in-flight incoming migration.  The device group is usable as soon
/// as devices are admitted (reads park in the waiting caches); `wait`
/// resolves once the source has finished and closed the stream.
pub struct IncomingMigration {
    group: Arc<DeviceGroup>,
    task: tokio::task::JoinHandle<Result<(), MigrateError>>,
}

impl IncomingMigration {
    pub fn group(&self) -> Arc<DeviceGroup> {
        Arc::clone(&self.group)
    }

    /// Waits for the protocol to finish.  Devices configured locally but
    /// never announced by the source are synthesised from their base
    /// once the stream closes.
    pub async fn wait(self) -> Result<Arc<DeviceGroup>, MigrateError> {
        self.task
            .await
            .map_err(|e| MigrateError::TaskFailed(e.to_string()))??;

        let unfinished = self.group.unfinished_remote();
        if unfinished > 0 {
            return Err(MigrateError::Incomplete(unfinished));
        }
        self.group.materialize_local()?;
        Ok(self.group)
    }
}

/// Starts receiving a migration on `stream` into a fresh device group
/// configured by `specs`.
pub fn migrate_from<S>(
    specs: Vec<DeviceSpec>,
    expose: ExposeMode,
    stream: S,
    opts: MigrateFromOptions,
    log: &Logger,
) -> IncomingMigration
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let group = DeviceGroup::new(specs, expose, log.clone());
    let (r, w) = tokio::io::split(stream);
    let sender = FrameSender::new(w);

    let task = tokio::spawn(destination::run_destination(
        r,
        sender,
        Arc::clone(&group),
        Arc::new(opts.hooks),
        opts.schema_rewrite,
        opts.cancel.clone(),
        log.clone(),
    ));

    IncomingMigration { group, task }
}

/// Local-only startup: no peer, every device comes from its spec.
pub fn migrate_from_local(
    specs: Vec<DeviceSpec>,
    expose: ExposeMode,
    log: &Logger,
) -> Result<Arc<DeviceGroup>, MigrateError> {
    let group = DeviceGroup::new(specs, expose, log.clone());
    group.materialize_local()?;
    Ok(group)
}
