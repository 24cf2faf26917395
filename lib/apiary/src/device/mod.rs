// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device groups: the set of named backing devices behind one microVM.
//!
//! A group binds device specs to provider stacks and, during a
//! migration, to migrator inputs.  Devices enter a group one of two
//! ways: materialised locally from their spec, or admitted lazily as
//! `DevInfo` frames arrive from a migration source.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slog::{debug, info, warn, Logger};
use tokio::sync::Notify;

use crate::block::{
    self, DirtySampler, DirtyVolume, FileVolume, GateVolume, HintFn,
    MetricsHandle, MetricsVolume, OverlayVolume, VolatilityHandle,
    VolatilityVolume, Volume, WaitingHandle, WaitingVolume,
};
use crate::expose::{expose_device_as_node, NbdExport};
use crate::migrate::migrator::MigrateParams;
use crate::migrate::MigrateError;

fn default_block_size() -> u32 {
    block::DEFAULT_BLOCK_SIZE
}
fn default_max_dirty_blocks() -> usize {
    200
}
fn default_min_cycles() -> u32 {
    5
}
fn default_max_cycles() -> u32 {
    20
}
fn default_cycle_throttle_ns() -> u64 {
    Duration::from_millis(500).as_nanos() as u64
}
fn default_expiry_ns() -> u64 {
    Duration::from_secs(1).as_nanos() as u64
}

/// One device record in a peer's configuration.
///
/// `shared = true` skips stack construction and exposes `base` directly.
/// An empty `overlay` or `state` means read-only local use: the stack is
/// built without a copy-on-write layer and writes go to `base` itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    pub name: String,

    pub base: PathBuf,
    #[serde(default)]
    pub overlay: PathBuf,
    #[serde(default)]
    pub state: PathBuf,

    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default)]
    pub shared: bool,

    #[serde(default = "default_max_dirty_blocks")]
    pub max_dirty_blocks: usize,
    #[serde(default = "default_min_cycles")]
    pub min_cycles: u32,
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    #[serde(default = "default_cycle_throttle_ns")]
    pub cycle_throttle_ns: u64,
    #[serde(default = "default_expiry_ns")]
    pub expiry_ns: u64,

    #[serde(default)]
    pub make_migratable: bool,
    #[serde(default)]
    pub requires_msync: bool,
}

impl DeviceSpec {
    pub fn cycle_throttle(&self) -> Duration {
        Duration::from_nanos(self.cycle_throttle_ns)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_nanos(self.expiry_ns)
    }

    /// Whether the stack gets a copy-on-write layer.
    pub fn has_overlay(&self) -> bool {
        !self.overlay.as_os_str().is_empty()
            && !self.state.as_os_str().is_empty()
    }

    pub fn params(&self) -> MigrateParams {
        MigrateParams {
            max_dirty_blocks: self.max_dirty_blocks,
            min_cycles: self.min_cycles,
            max_cycles: self.max_cycles,
            cycle_throttle: self.cycle_throttle(),
            requires_msync: self.requires_msync,
        }
    }
}

/// How a group presents stack tops to the hypervisor.
#[derive(Clone, Debug, Default)]
pub enum ExposeMode {
    /// Library use and tests: no host block nodes.
    #[default]
    None,
    /// Attach each stack to `/dev/nbd<first_index + i>` and mknod an
    /// alias into the VM directory.
    Kernel { vm_dir: PathBuf, first_index: u32 },
}

/// Swappable indirection between an exposed device and the current top
/// of its stack, so `make_migratable` can interpose layers while the
/// device stays exposed.
pub struct ProviderCell {
    cur: Mutex<Arc<dyn Volume>>,
}

impl ProviderCell {
    fn new(v: Arc<dyn Volume>) -> Arc<Self> {
        Arc::new(Self { cur: Mutex::new(v) })
    }

    fn get(&self) -> Arc<dyn Volume> {
        Arc::clone(&self.cur.lock().unwrap())
    }

    fn set(&self, v: Arc<dyn Volume>) {
        *self.cur.lock().unwrap() = v;
    }
}

#[async_trait::async_trait]
impl Volume for ProviderCell {
    fn size(&self) -> u64 {
        self.get().size()
    }

    async fn read_at(&self, off: u64, len: usize) -> io::Result<bytes::Bytes> {
        self.get().read_at(off, len).await
    }

    async fn write_at(&self, off: u64, data: bytes::Bytes) -> io::Result<()> {
        self.get().write_at(off, data).await
    }

    async fn discard(&self, off: u64, len: u64) -> io::Result<()> {
        self.get().discard(off, len).await
    }

    async fn lock(&self) {
        self.get().lock().await;
    }

    fn unlock(&self) {
        self.get().unlock();
    }

    async fn close(&self) -> io::Result<()> {
        self.get().close().await
    }
}

struct Migratable {
    sampler: DirtySampler,
    volatility: VolatilityHandle,
    metrics: MetricsHandle,
}

/// One device bound into a group.
pub struct DeviceEntry {
    pub name: String,
    pub index: u32,
    pub spec: DeviceSpec,
    /// Whether the device arrived over the migration protocol.
    pub remote: bool,

    schema: Mutex<String>,
    cell: Arc<ProviderCell>,
    waiting: Option<WaitingHandle>,
    migratable: Mutex<Option<Migratable>>,
    export: Mutex<Option<NbdExport>>,
    node: Mutex<Option<PathBuf>>,

    authority_received: AtomicBool,
    completed: AtomicBool,
}

impl DeviceEntry {
    /// Current top of the stack.  The handle stays valid across
    /// `make_migratable` swaps.
    pub fn storage(&self) -> Arc<dyn Volume> {
        Arc::clone(&self.cell) as Arc<dyn Volume>
    }

    pub fn size(&self) -> u64 {
        self.cell.size()
    }

    pub fn block_size(&self) -> u32 {
        self.spec.block_size
    }

    pub fn schema(&self) -> String {
        self.schema.lock().unwrap().clone()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn authority_received(&self) -> bool {
        self.authority_received.load(Ordering::SeqCst)
    }

    /// Path of the block-special node this device is exposed at, if any.
    pub fn exposed_node(&self) -> Option<PathBuf> {
        self.node.lock().unwrap().clone()
    }

    pub(crate) fn waiting(&self) -> Option<WaitingHandle> {
        self.waiting.clone()
    }

    pub fn dirty_sampler(&self) -> Option<DirtySampler> {
        self.migratable.lock().unwrap().as_ref().map(|m| m.sampler.clone())
    }

    pub fn volatility(&self) -> Option<VolatilityHandle> {
        self.migratable.lock().unwrap().as_ref().map(|m| m.volatility.clone())
    }

    pub fn metrics(&self) -> Option<MetricsHandle> {
        self.migratable.lock().unwrap().as_ref().map(|m| m.metrics.clone())
    }
}

/// Named devices backing one microVM.
pub struct DeviceGroup {
    log: Logger,
    expose: ExposeMode,
    specs: Vec<DeviceSpec>,

    entries: Mutex<Vec<Arc<DeviceEntry>>>,
    changed: Notify,
    all_sent: AtomicBool,
    custom_cb: Mutex<Option<Box<dyn Fn(u32, u8) + Send + Sync>>>,
}

impl DeviceGroup {
    pub fn new(
        specs: Vec<DeviceSpec>,
        expose: ExposeMode,
        log: Logger,
    ) -> Arc<Self> {
        Arc::new(Self {
            log,
            expose,
            specs,
            entries: Mutex::new(Vec::new()),
            changed: Notify::new(),
            all_sent: AtomicBool::new(false),
            custom_cb: Mutex::new(None),
        })
    }

    pub fn specs(&self) -> &[DeviceSpec] {
        &self.specs
    }

    pub fn all_names(&self) -> Vec<String> {
        self.entries.lock().unwrap().iter().map(|e| e.name.clone()).collect()
    }

    pub fn entries(&self) -> Vec<Arc<DeviceEntry>> {
        self.entries.lock().unwrap().clone()
    }

    pub fn entry_by_name(&self, name: &str) -> Option<Arc<DeviceEntry>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.name == name)
            .cloned()
    }

    /// The exposed storage for `name`: what the hypervisor reads and
    /// writes through the device node.
    pub fn exposed_by_name(&self, name: &str) -> Option<Arc<dyn Volume>> {
        self.entry_by_name(name).map(|e| e.storage())
    }

    /// Subscribes to custom protocol events observed on the destination,
    /// `TransferAuthority` being the interesting one: it marks the moment
    /// a device becomes locally authoritative.
    pub fn on_custom_event(&self, cb: impl Fn(u32, u8) + Send + Sync + 'static) {
        *self.custom_cb.lock().unwrap() = Some(Box::new(cb));
    }

    fn base_stack(
        &self,
        spec: &DeviceSpec,
        create_size: Option<u64>,
    ) -> io::Result<Arc<dyn Volume>> {
        let base: Arc<dyn Volume> = match create_size {
            Some(size) => FileVolume::create(&spec.base, size)?,
            None => FileVolume::open(&spec.base, false)?,
        };
        if spec.has_overlay() {
            Ok(OverlayVolume::open(
                base,
                &spec.overlay,
                &spec.state,
                spec.block_size,
            )?)
        } else {
            Ok(base)
        }
    }

    fn insert_entry(
        &self,
        index: u32,
        spec: DeviceSpec,
        top: Arc<dyn Volume>,
        schema: String,
        remote: bool,
        waiting: Option<WaitingHandle>,
    ) -> Result<Arc<DeviceEntry>, MigrateError> {
        let cell = ProviderCell::new(top);

        let mut export = None;
        let mut node = None;
        if let ExposeMode::Kernel { vm_dir, first_index } = &self.expose {
            let exp = NbdExport::attach(
                first_index + index,
                Arc::clone(&cell) as Arc<dyn Volume>,
                spec.block_size,
                self.log.clone(),
            )
            .map_err(|e| MigrateError::Expose(e.to_string()))?;
            let n = expose_device_as_node(vm_dir, &spec.name, exp.device_path())
                .map_err(|e| MigrateError::Expose(e.to_string()))?;
            info!(self.log, "device exposed"; "name" => %spec.name,
                "node" => %n.display());
            export = Some(exp);
            node = Some(n);
        }

        let entry = Arc::new(DeviceEntry {
            name: spec.name.clone(),
            index,
            spec,
            remote,
            schema: Mutex::new(schema),
            cell,
            waiting,
            migratable: Mutex::new(None),
            export: Mutex::new(export),
            node: Mutex::new(node),
            authority_received: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        });
        self.entries.lock().unwrap().push(Arc::clone(&entry));
        self.changed.notify_waiters();
        Ok(entry)
    }

    /// Admits a device announced by the migration source: builds the
    /// local stack sized to the descriptor, inserts the waiting cache on
    /// top and exposes the result.  A repeated `DevInfo` for an already
    /// admitted device is a no-op; an unknown name is fatal.
    pub(crate) fn admit(
        &self,
        index: u32,
        name: &str,
        size: u64,
        block_size: u32,
        schema: String,
        need_at: HintFn,
        dont_need_at: HintFn,
    ) -> Result<(Arc<DeviceEntry>, bool), MigrateError> {
        if let Some(existing) = self.entry_by_name(name) {
            if existing.index == index {
                return Ok((existing, false));
            }
            return Err(MigrateError::DuplicateDevice(index));
        }

        let mut spec = self
            .specs
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| MigrateError::UnknownDevice(name.to_string()))?;
        // The descriptor governs geometry; the local spec only supplies
        // paths and policy.
        spec.block_size = block_size;

        let below = self
            .base_stack(&spec, Some(size))
            .map_err(|err| MigrateError::BlockIo { name: name.into(), err })?;
        let (top, handle) =
            WaitingVolume::new(below, block_size, need_at, dont_need_at);

        let entry = self.insert_entry(
            index,
            spec,
            top as Arc<dyn Volume>,
            schema,
            true,
            Some(handle),
        )?;
        Ok((entry, true))
    }

    /// Materialises every spec that has not been admitted yet: the local
    /// startup path, and the fallback for devices configured here which
    /// the source never announced.
    pub fn materialize_local(&self) -> Result<Vec<Arc<DeviceEntry>>, MigrateError>
    {
        let mut created = Vec::new();
        for spec in &self.specs {
            if self.entry_by_name(&spec.name).is_some() {
                continue;
            }
            if spec.shared {
                self.expose_shared(spec)?;
                continue;
            }
            let next_index =
                self.entries.lock().unwrap().len() as u32;
            let top = self.base_stack(spec, None).map_err(|err| {
                MigrateError::BlockIo { name: spec.name.clone(), err }
            })?;
            debug!(self.log, "materialised local device";
                "name" => %spec.name);
            created.push(self.insert_entry(
                next_index,
                spec.clone(),
                top,
                String::new(),
                false,
                None,
            )?);
        }
        Ok(created)
    }

    /// A shared device bypasses the stack entirely; the hypervisor uses
    /// the base file itself.
    fn expose_shared(&self, spec: &DeviceSpec) -> Result<(), MigrateError> {
        if let ExposeMode::Kernel { vm_dir, .. } = &self.expose {
            let node = vm_dir.join(&spec.name);
            std::os::unix::fs::symlink(&spec.base, &node).map_err(|err| {
                MigrateError::BlockIo { name: spec.name.clone(), err }
            })?;
            info!(self.log, "shared device linked"; "name" => %spec.name,
                "node" => %node.display());
        }
        Ok(())
    }

    /// Interposes metrics -> dirty tracker -> volatility monitor -> gate
    /// above each entry's current top, making the group a valid
    /// migration source.  Idempotent; shared and non-migratable devices
    /// are left alone.
    pub fn make_migratable(&self) -> Result<(), MigrateError> {
        let entries = self.entries();
        for entry in entries {
            if entry.spec.shared || !entry.spec.make_migratable {
                continue;
            }
            let mut slot = entry.migratable.lock().unwrap();
            if slot.is_some() {
                continue;
            }

            let below = entry.cell.get();
            let (counted, metrics) = MetricsVolume::new(below);
            let (dirty, sampler) =
                DirtyVolume::new(counted, entry.spec.block_size);
            let (vol, volatility) = VolatilityVolume::new(
                dirty,
                entry.spec.block_size,
                entry.spec.expiry(),
            );
            let gate = GateVolume::new(vol);

            entry.cell.set(gate);
            *slot = Some(Migratable { sampler, volatility, metrics });
            debug!(self.log, "device made migratable";
                "name" => %entry.name);
        }
        Ok(())
    }

    pub(crate) fn note_completed(&self, index: u32) {
        if let Some(e) =
            self.entries.lock().unwrap().iter().find(|e| e.index == index)
        {
            e.completed.store(true, Ordering::SeqCst);
        }
        self.changed.notify_waiters();
    }

    pub(crate) fn note_custom(&self, index: u32, sub: u8) {
        use crate::migrate::codec::CUSTOM_TRANSFER_AUTHORITY;
        if sub == CUSTOM_TRANSFER_AUTHORITY {
            if let Some(e) =
                self.entries.lock().unwrap().iter().find(|e| e.index == index)
            {
                e.authority_received.store(true, Ordering::SeqCst);
            }
        }
        if let Some(cb) = self.custom_cb.lock().unwrap().as_ref() {
            cb(index, sub);
        }
        self.changed.notify_waiters();
    }

    pub(crate) fn note_all_sent(&self) {
        self.all_sent.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn all_devices_seen(&self) -> bool {
        self.all_sent.load(Ordering::SeqCst)
    }

    /// Remote entries which have not reached `Completed`.
    pub fn unfinished_remote(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.remote && !e.is_completed())
            .count()
    }

    /// Waits until at least one remote device exists and every remote
    /// device has reached `Completed`.
    pub async fn wait_for_completion(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let entries = self.entries.lock().unwrap();
                let remote =
                    entries.iter().filter(|e| e.remote).count();
                if remote > 0
                    && entries
                        .iter()
                        .filter(|e| e.remote)
                        .all(|e| e.is_completed())
                {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Logs a content digest per device, cheap corroboration that both
    /// peers hold the same bytes after a migration.
    pub async fn audit_digests(&self) {
        for entry in self.entries() {
            let stats = entry
                .metrics()
                .map(|m| m.snapshot())
                .unwrap_or_default();
            match digest_volume(&entry.storage()).await {
                Ok(d) => info!(self.log, "device digest";
                    "name" => %entry.name, "size" => entry.size(),
                    "fnv64" => format!("{d:016x}"),
                    "writes" => stats.writes,
                    "bytes_written" => stats.bytes_written),
                Err(e) => warn!(self.log, "digest failed: {e}";
                    "name" => %entry.name),
            }
        }
    }

    /// Closes every stack in reverse construction order and removes any
    /// exposed nodes.
    pub async fn close(&self) {
        let entries = {
            let mut entries = self.entries.lock().unwrap();
            let drained = entries.drain(..).collect::<Vec<_>>();
            drained
        };
        for entry in entries.into_iter().rev() {
            if let Some(export) = entry.export.lock().unwrap().take() {
                export.shutdown();
            }
            if let Some(node) = entry.node.lock().unwrap().take() {
                let _ = std::fs::remove_file(node);
            }
            entry.storage().unlock();
            if let Err(e) = entry.storage().close().await {
                warn!(self.log, "closing device failed: {e}";
                    "name" => %entry.name);
            }
        }
        self.changed.notify_waiters();
    }
}

async fn digest_volume(vol: &Arc<dyn Volume>) -> io::Result<u64> {
    const CHUNK: usize = 1 << 20;
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    let size = vol.size();
    let mut off = 0u64;
    while off < size {
        let len = CHUNK.min((size - off) as usize);
        let data = vol.read_at(off, len).await?;
        for &b in data.iter() {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x100_0000_01b3);
        }
        off += len as u64;
    }
    Ok(h)
}
