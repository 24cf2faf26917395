// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end migration scenarios over an in-memory duplex transport.
//!
//! Both peers run in-process; a byte tap between them lets the tests
//! assert on the actual frames exchanged, not just the outcome.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use slog::{o, Logger};
use tokio::io::{
    duplex, split, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf,
    WriteHalf,
};
use tokio::time::sleep;

use apiary::agent::{AgentError, GuestAgent};
use apiary::block::Volume;
use apiary::device::{DeviceSpec, ExposeMode};
use apiary::migrate::codec::{self, DeviceEvent, Frame, Message};
use apiary::migrate::{
    migrate_from, migrate_from_local, migrate_to, FromHooks,
    MigrateError, MigrateFromOptions, MigrateHooks, MigrateToOptions,
    CUSTOM_ALL_DEVICES_SENT, CUSTOM_TRANSFER_AUTHORITY,
};
use apiary::vmm::{SnapshotKind, VmmApi, VmmError};

fn test_log() -> Logger {
    Logger::root(slog::Discard, o!())
}

#[derive(Default)]
struct TestVmm {
    msyncs: AtomicUsize,
    snapshots: AtomicUsize,
}

#[async_trait::async_trait]
impl VmmApi for TestVmm {
    async fn resume_snapshot(
        &self,
        _state: &Path,
        _memory: &Path,
    ) -> Result<(), VmmError> {
        Ok(())
    }
    async fn create_snapshot(
        &self,
        _state: &Path,
        _memory: &Path,
        _kind: SnapshotKind,
    ) -> Result<(), VmmError> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn msync(&self) -> Result<(), VmmError> {
        self.msyncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct TestAgent {
    before: AtomicUsize,
    hold: Duration,
}

impl TestAgent {
    fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self { before: AtomicUsize::new(0), hold })
    }
}

#[async_trait::async_trait]
impl GuestAgent for TestAgent {
    async fn before_suspend(&self, _limit: Duration) -> Result<(), AgentError> {
        self.before.fetch_add(1, Ordering::SeqCst);
        sleep(self.hold).await;
        Ok(())
    }
    async fn after_resume(&self, _limit: Duration) -> Result<(), AgentError> {
        Ok(())
    }
    async fn close(&self) {}
}

type Capture = Arc<Mutex<Vec<u8>>>;

async fn pump(
    mut r: ReadHalf<DuplexStream>,
    mut w: WriteHalf<DuplexStream>,
    cap: Capture,
    delay: Option<Duration>,
) {
    let mut buf = [0u8; 1024];
    loop {
        match r.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = w.shutdown().await;
                return;
            }
            Ok(n) => {
                cap.lock().unwrap().extend_from_slice(&buf[..n]);
                if w.write_all(&buf[..n]).await.is_err() {
                    return;
                }
                if let Some(d) = delay {
                    sleep(d).await;
                }
            }
        }
    }
}

/// A source<->destination link with both directions captured.  `delay`
/// throttles the source-to-destination direction.
fn tapped_link(
    delay: Option<Duration>,
) -> (DuplexStream, DuplexStream, Capture, Capture) {
    // Small pipes: the sender sees backpressure instead of buffering an
    // entire device, which is what makes the throttled tests meaningful.
    let (s_io, a) = duplex(1 << 14);
    let (b, d_io) = duplex(1 << 14);
    let (ar, aw) = split(a);
    let (br, bw) = split(b);

    let sd: Capture = Arc::default();
    let ds: Capture = Arc::default();
    tokio::spawn(pump(ar, bw, Arc::clone(&sd), delay));
    tokio::spawn(pump(br, aw, Arc::clone(&ds), None));
    (s_io, d_io, sd, ds)
}

async fn frames_of(cap: &Capture) -> Vec<Frame> {
    let bytes = cap.lock().unwrap().clone();
    let mut cursor = &bytes[..];
    let mut out = Vec::new();
    while let Ok(Some(f)) = codec::read_frame(&mut cursor).await {
        out.push(f);
    }
    out
}

fn spec(dir: &Path, name: &str, block_size: u32) -> DeviceSpec {
    DeviceSpec {
        name: name.to_string(),
        base: dir.join(format!("{name}.base")),
        overlay: Default::default(),
        state: Default::default(),
        block_size,
        shared: false,
        max_dirty_blocks: 200,
        min_cycles: 1,
        max_cycles: 20,
        cycle_throttle_ns: 10_000_000,
        expiry_ns: 1_000_000_000,
        make_migratable: true,
        requires_msync: false,
    }
}

async fn read_all(vol: &Arc<dyn Volume>) -> Vec<u8> {
    let size = vol.size();
    let mut out = Vec::with_capacity(size as usize);
    let mut off = 0u64;
    while off < size {
        let len = (1usize << 20).min((size - off) as usize);
        out.extend_from_slice(&vol.read_at(off, len).await.unwrap());
        off += len as u64;
    }
    out
}

fn spawn_writer(
    storage: Arc<dyn Volume>,
    stop: Arc<AtomicBool>,
    burst: u64,
    nblocks: u64,
    block_size: u32,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut i = 0u64;
        while !stop.load(Ordering::SeqCst) {
            for _ in 0..burst {
                let b = i % nblocks;
                i += 1;
                let data =
                    Bytes::from(vec![(i & 0xff) as u8; block_size as usize]);
                if storage
                    .write_at(b * u64::from(block_size), data)
                    .await
                    .is_err()
                {
                    return;
                }
            }
            sleep(period).await;
        }
    })
}

fn suspend_counter(
    hooks: &mut MigrateHooks,
) -> (Arc<AtomicUsize>, Arc<AtomicBool>) {
    let count = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let (c, s) = (Arc::clone(&count), Arc::clone(&stop));
    hooks.on_before_suspend = Some(Box::new(move || {
        c.fetch_add(1, Ordering::SeqCst);
        s.store(true, Ordering::SeqCst);
    }));
    (count, stop)
}

// S1: a single static device moves whole, in exactly one WriteAt per
// block, with no dirty traffic, and the destination ends bit-identical.
#[tokio::test]
async fn single_static_device() {
    const BS: u32 = 65536;
    let log = test_log();
    let sdir = tempfile::tempdir().unwrap();
    let ddir = tempfile::tempdir().unwrap();

    let mut content = Vec::new();
    for k in 0u8..4 {
        content.extend(std::iter::repeat(k + 1).take(BS as usize));
    }
    let s_spec = spec(sdir.path(), "disk", BS);
    std::fs::write(&s_spec.base, &content).unwrap();

    // The destination also carries a device the source never announces;
    // it must be synthesised from its local base after the protocol
    // closes.
    let d_spec = spec(ddir.path(), "disk", BS);
    let spare_spec = spec(ddir.path(), "spare", BS);
    std::fs::write(&spare_spec.base, vec![0x77u8; 1024]).unwrap();

    let group =
        migrate_from_local(vec![s_spec], ExposeMode::None, &log).unwrap();

    let (s_io, d_io, sd, _ds) = tapped_link(None);
    let incoming = migrate_from(
        vec![d_spec, spare_spec],
        ExposeMode::None,
        d_io,
        MigrateFromOptions::default(),
        &log,
    );

    let mut hooks = MigrateHooks::default();
    let (suspends, _stop) = suspend_counter(&mut hooks);
    let opts = MigrateToOptions {
        concurrency: 8,
        hooks,
        ..Default::default()
    };
    migrate_to(
        &group,
        Arc::new(TestVmm::default()),
        TestAgent::new(Duration::ZERO),
        s_io,
        opts,
        &log,
    )
    .await
    .unwrap();

    let dest = incoming.wait().await.unwrap();
    assert_eq!(suspends.load(Ordering::SeqCst), 1);

    let dvol = dest.exposed_by_name("disk").unwrap();
    assert_eq!(read_all(&dvol).await, content);
    assert_eq!(std::fs::read(ddir.path().join("disk.base")).unwrap(), content);

    // The spare device exists untouched.
    let spare = dest.exposed_by_name("spare").unwrap();
    assert_eq!(read_all(&spare).await, vec![0x77u8; 1024]);

    let frames = frames_of(&sd).await;
    let dev_infos = frames
        .iter()
        .filter_map(|f| match &f.msg {
            Message::DevInfo { size, block_size, .. } => {
                Some((*size, *block_size))
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(dev_infos, vec![(262144, BS)]);

    let writes = frames
        .iter()
        .filter_map(|f| match &f.msg {
            Message::WriteAt { data, .. } => Some(data.len()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(writes.len(), 4);
    assert_eq!(writes.iter().sum::<usize>(), 262144);

    assert!(!frames
        .iter()
        .any(|f| matches!(f.msg, Message::DirtyList { .. })));

    let events = frames
        .iter()
        .filter_map(|f| match &f.msg {
            Message::Event(ev) => Some(*ev),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert!(events
        .contains(&DeviceEvent::Custom(CUSTOM_ALL_DEVICES_SENT)));
    assert!(events
        .contains(&DeviceEvent::Custom(CUSTOM_TRANSFER_AUTHORITY)));
    assert_eq!(events.last(), Some(&DeviceEvent::Completed));

    // Authority transfer follows the last WriteAt.
    let last_write = frames
        .iter()
        .rposition(|f| matches!(f.msg, Message::WriteAt { .. }))
        .unwrap();
    let authority = frames
        .iter()
        .position(|f| {
            matches!(
                f.msg,
                Message::Event(DeviceEvent::Custom(
                    CUSTOM_TRANSFER_AUTHORITY
                ))
            )
        })
        .unwrap();
    assert!(authority > last_write);
}

// S2: a slowly-dirtying device converges below the threshold, suspend
// fires once, and the destination is bit-identical afterwards.
#[tokio::test]
async fn dirty_convergence() {
    const BS: u32 = 4096;
    const NBLOCKS: u64 = 16;
    let log = test_log();
    let sdir = tempfile::tempdir().unwrap();
    let ddir = tempfile::tempdir().unwrap();

    let mut s_spec = spec(sdir.path(), "disk", BS);
    s_spec.max_dirty_blocks = 2;
    s_spec.min_cycles = 2;
    s_spec.max_cycles = 5;
    s_spec.cycle_throttle_ns = 50_000_000;
    std::fs::write(&s_spec.base, vec![0u8; (BS as u64 * NBLOCKS) as usize])
        .unwrap();
    let d_spec = spec(ddir.path(), "disk", BS);

    let group =
        migrate_from_local(vec![s_spec], ExposeMode::None, &log).unwrap();
    let entry = group.entry_by_name("disk").unwrap();

    let (s_io, d_io, sd, _ds) = tapped_link(None);
    let incoming = migrate_from(
        vec![d_spec],
        ExposeMode::None,
        d_io,
        MigrateFromOptions::default(),
        &log,
    );

    let mut hooks = MigrateHooks::default();
    let (suspends, stop) = suspend_counter(&mut hooks);
    let dirty_cycles = Arc::new(AtomicUsize::new(0));
    let dc = Arc::clone(&dirty_cycles);
    hooks.on_dirty_progress = Some(Box::new(move |_, _| {
        dc.fetch_add(1, Ordering::SeqCst);
    }));

    let writer = spawn_writer(
        entry.storage(),
        Arc::clone(&stop),
        1,
        NBLOCKS,
        BS,
        Duration::from_millis(100),
    );

    migrate_to(
        &group,
        Arc::new(TestVmm::default()),
        TestAgent::new(Duration::from_millis(150)),
        s_io,
        MigrateToOptions {
            concurrency: 4,
            hooks,
            ..Default::default()
        },
        &log,
    )
    .await
    .unwrap();
    writer.await.unwrap();

    let dest = incoming.wait().await.unwrap();
    assert_eq!(suspends.load(Ordering::SeqCst), 1);

    // The guest dirtied at least one cycle, and a final dirty list went
    // out on the wire.
    let frames = frames_of(&sd).await;
    let dirty_lists = frames
        .iter()
        .filter(|f| matches!(f.msg, Message::DirtyList { .. }))
        .count();
    assert!(dirty_lists >= 1, "expected dirty traffic, saw none");

    let svol = entry.storage();
    let dvol = dest.exposed_by_name("disk").unwrap();
    assert_eq!(read_all(&svol).await, read_all(&dvol).await);
}

// S3: a device that never quiets down is forced to converge at
// max_cycles; non-convergence is not fatal.
#[tokio::test]
async fn forced_convergence() {
    const BS: u32 = 4096;
    const NBLOCKS: u64 = 32;
    let log = test_log();
    let sdir = tempfile::tempdir().unwrap();
    let ddir = tempfile::tempdir().unwrap();

    let mut s_spec = spec(sdir.path(), "disk", BS);
    s_spec.max_dirty_blocks = 2;
    s_spec.min_cycles = 2;
    s_spec.max_cycles = 3;
    s_spec.cycle_throttle_ns = 30_000_000;
    std::fs::write(&s_spec.base, vec![0u8; (BS as u64 * NBLOCKS) as usize])
        .unwrap();
    let d_spec = spec(ddir.path(), "disk", BS);

    let group =
        migrate_from_local(vec![s_spec], ExposeMode::None, &log).unwrap();
    let entry = group.entry_by_name("disk").unwrap();

    let (s_io, d_io, _sd, _ds) = tapped_link(None);
    let incoming = migrate_from(
        vec![d_spec],
        ExposeMode::None,
        d_io,
        MigrateFromOptions::default(),
        &log,
    );

    let mut hooks = MigrateHooks::default();
    let (suspends, stop) = suspend_counter(&mut hooks);
    let max_delta = Arc::new(AtomicUsize::new(0));
    let md = Arc::clone(&max_delta);
    hooks.on_dirty_progress = Some(Box::new(move |_, delta| {
        md.fetch_max(delta, Ordering::SeqCst);
    }));

    let writer = spawn_writer(
        entry.storage(),
        Arc::clone(&stop),
        10,
        NBLOCKS,
        BS,
        Duration::from_millis(30),
    );

    migrate_to(
        &group,
        Arc::new(TestVmm::default()),
        TestAgent::new(Duration::from_millis(100)),
        s_io,
        MigrateToOptions {
            concurrency: 4,
            hooks,
            ..Default::default()
        },
        &log,
    )
    .await
    .unwrap();
    writer.await.unwrap();

    let dest = incoming.wait().await.unwrap();
    assert_eq!(suspends.load(Ordering::SeqCst), 1);
    assert!(
        max_delta.load(Ordering::SeqCst) >= 2,
        "expected at least one non-quiet cycle"
    );

    let svol = entry.storage();
    let dvol = dest.exposed_by_name("disk").unwrap();
    assert_eq!(read_all(&svol).await, read_all(&dvol).await);
}

// S4: a destination read ahead of precopy promotes the block and is
// served long before the bulk transfer completes.
#[tokio::test]
async fn need_at_acceleration() {
    const BS: u32 = 4096;
    const NBLOCKS: u64 = 256;
    const HOT_BLOCK: u64 = 200;
    let log = test_log();
    let sdir = tempfile::tempdir().unwrap();
    let ddir = tempfile::tempdir().unwrap();

    let mut content = Vec::new();
    for k in 0..NBLOCKS {
        content.extend(std::iter::repeat((k & 0xff) as u8).take(BS as usize));
    }
    let s_spec = spec(sdir.path(), "disk", BS);
    std::fs::write(&s_spec.base, &content).unwrap();
    let d_spec = spec(ddir.path(), "disk", BS);

    let group =
        migrate_from_local(vec![s_spec], ExposeMode::None, &log).unwrap();

    // Throttle the transfer so the hinted read demonstrably overtakes it.
    let (s_io, d_io, sd, ds) =
        tapped_link(Some(Duration::from_micros(500)));
    let incoming = migrate_from(
        vec![d_spec],
        ExposeMode::None,
        d_io,
        MigrateFromOptions::default(),
        &log,
    );

    let source = tokio::spawn({
        let group = Arc::clone(&group);
        let log = log.clone();
        async move {
            migrate_to(
                &group,
                Arc::new(TestVmm::default()),
                TestAgent::new(Duration::ZERO),
                s_io,
                MigrateToOptions {
                    concurrency: 1,
                    hooks: MigrateHooks::default(),
                    ..Default::default()
                },
                &log,
            )
            .await
        }
    });

    // Wait for admission, then read the hot block ahead of its turn.
    let dest_group = incoming.group();
    let dvol = loop {
        if let Some(v) = dest_group.exposed_by_name("disk") {
            break v;
        }
        sleep(Duration::from_millis(2)).await;
    };
    let got = tokio::time::timeout(
        Duration::from_secs(30),
        dvol.read_at(HOT_BLOCK * u64::from(BS), BS as usize),
    )
    .await
    .expect("hinted read should not wait for the bulk transfer")
    .unwrap();
    assert!(got.iter().all(|&b| b == (HOT_BLOCK & 0xff) as u8));

    source.await.unwrap().unwrap();
    incoming.wait().await.unwrap();

    // The hint went upstream...
    let hint_seen = frames_of(&ds).await.iter().any(|f| {
        matches!(f.msg, Message::NeedAt { offset, .. }
            if offset == HOT_BLOCK * u64::from(BS))
    });
    assert!(hint_seen, "no NeedAt observed for the hot block");

    // ...and the hot block jumped the queue.
    let write_offsets = frames_of(&sd)
        .await
        .iter()
        .filter_map(|f| match &f.msg {
            Message::WriteAt { offset, .. } => Some(*offset),
            _ => None,
        })
        .collect::<Vec<_>>();
    let position = write_offsets
        .iter()
        .position(|&off| off == HOT_BLOCK * u64::from(BS))
        .unwrap();
    assert!(
        position < 150,
        "hot block arrived at position {position}, expected promotion"
    );
}

// S5: two devices converge independently; suspend fires only once both
// are ready, and every authority transfer follows it.
#[tokio::test]
async fn two_devices_independent_completion() {
    const BS: u32 = 4096;
    let log = test_log();
    let sdir = tempfile::tempdir().unwrap();
    let ddir = tempfile::tempdir().unwrap();

    let mut mem_spec = spec(sdir.path(), "memory", BS);
    mem_spec.requires_msync = true;
    mem_spec.max_dirty_blocks = 2;
    mem_spec.max_cycles = 5;
    mem_spec.cycle_throttle_ns = 20_000_000;
    std::fs::write(&mem_spec.base, vec![0u8; BS as usize * 8]).unwrap();

    let mut disk_spec = spec(sdir.path(), "disk", BS);
    disk_spec.max_dirty_blocks = 2;
    disk_spec.max_cycles = 6;
    disk_spec.cycle_throttle_ns = 20_000_000;
    std::fs::write(&disk_spec.base, vec![0u8; BS as usize * 16]).unwrap();

    let d_mem = spec(ddir.path(), "memory", BS);
    let d_disk = spec(ddir.path(), "disk", BS);

    let group = migrate_from_local(
        vec![mem_spec, disk_spec],
        ExposeMode::None,
        &log,
    )
    .unwrap();
    let disk_entry = group.entry_by_name("disk").unwrap();

    let (s_io, d_io, _sd, _ds) = tapped_link(None);

    let authority_received = Arc::new(AtomicUsize::new(0));
    let ar = Arc::clone(&authority_received);
    let incoming = migrate_from(
        vec![d_mem, d_disk],
        ExposeMode::None,
        d_io,
        MigrateFromOptions {
            hooks: FromHooks {
                on_authority_received: Some(Box::new(move |_| {
                    ar.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
            ..Default::default()
        },
        &log,
    );

    let events: Arc<Mutex<Vec<String>>> = Arc::default();
    let stop = Arc::new(AtomicBool::new(false));
    let mut hooks = MigrateHooks::default();
    {
        let (ev, stop) = (Arc::clone(&events), Arc::clone(&stop));
        hooks.on_before_suspend = Some(Box::new(move || {
            ev.lock().unwrap().push("suspend".into());
            stop.store(true, Ordering::SeqCst);
        }));
    }
    {
        let ev = Arc::clone(&events);
        hooks.on_all_devices_sent = Some(Box::new(move || {
            ev.lock().unwrap().push("all-sent".into());
        }));
    }
    {
        let ev = Arc::clone(&events);
        hooks.on_authority_sent = Some(Box::new(move |dev| {
            ev.lock().unwrap().push(format!("auth:{dev}"));
        }));
    }

    // Keep the disk busy enough that only forced convergence frees it.
    let writer = spawn_writer(
        disk_entry.storage(),
        Arc::clone(&stop),
        3,
        16,
        BS,
        Duration::from_millis(20),
    );

    let vmm = Arc::new(TestVmm::default());
    migrate_to(
        &group,
        Arc::clone(&vmm) as Arc<dyn VmmApi>,
        TestAgent::new(Duration::from_millis(60)),
        s_io,
        MigrateToOptions {
            concurrency: 4,
            hooks,
            ..Default::default()
        },
        &log,
    )
    .await
    .unwrap();
    writer.await.unwrap();

    let dest = incoming.wait().await.unwrap();
    assert!(dest.all_devices_seen());
    assert_eq!(authority_received.load(Ordering::SeqCst), 2);

    let events = events.lock().unwrap().clone();
    let all_sent = events.iter().filter(|e| *e == "all-sent").count();
    assert_eq!(all_sent, 1);
    let suspend_at = events.iter().position(|e| e == "suspend").unwrap();
    let all_sent_at = events.iter().position(|e| e == "all-sent").unwrap();
    assert!(all_sent_at < suspend_at);
    for dev in 0..2 {
        let auth_at = events
            .iter()
            .position(|e| *e == format!("auth:{dev}"))
            .expect("authority event missing");
        assert!(auth_at > suspend_at, "authority preceded suspension");
    }

    // The memory device asked for msyncs along the way, plus the final
    // one in the suspend sequence.
    assert!(vmm.msyncs.load(Ordering::SeqCst) >= 2);

    for name in ["memory", "disk"] {
        let svol = group.exposed_by_name(name).unwrap();
        let dvol = dest.exposed_by_name(name).unwrap();
        assert_eq!(read_all(&svol).await, read_all(&dvol).await, "{name}");
    }
}

// S6: transport failure mid-precopy is fatal to the migration but the
// source never suspends.
#[tokio::test]
async fn transport_failure_mid_precopy() {
    const BS: u32 = 4096;
    const NBLOCKS: u64 = 512;
    let log = test_log();
    let sdir = tempfile::tempdir().unwrap();

    let s_spec = spec(sdir.path(), "disk", BS);
    std::fs::write(&s_spec.base, vec![9u8; (BS as u64 * NBLOCKS) as usize])
        .unwrap();

    let group =
        migrate_from_local(vec![s_spec], ExposeMode::None, &log).unwrap();

    let (s_io, mut d_io) = duplex(8192);

    // A destination that dies halfway through precopy.
    let half = (BS as u64 * NBLOCKS / 2) as usize;
    let dest = tokio::spawn(async move {
        let mut seen = 0usize;
        let mut buf = [0u8; 4096];
        while seen < half {
            match d_io.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => seen += n,
            }
        }
        drop(d_io);
    });

    let agent = TestAgent::new(Duration::ZERO);
    let mut hooks = MigrateHooks::default();
    let (suspends, _stop) = suspend_counter(&mut hooks);

    let err = migrate_to(
        &group,
        Arc::new(TestVmm::default()),
        Arc::clone(&agent) as Arc<dyn GuestAgent>,
        s_io,
        MigrateToOptions {
            concurrency: 4,
            hooks,
            ..Default::default()
        },
        &log,
    )
    .await
    .unwrap_err();
    dest.await.unwrap();

    assert!(
        matches!(err, MigrateError::Protocol(_) | MigrateError::Cancelled),
        "unexpected error: {err}"
    );
    assert_eq!(suspends.load(Ordering::SeqCst), 0);
    assert_eq!(agent.before.load(Ordering::SeqCst), 0);

    // The source device is still fully readable.
    let svol = group.exposed_by_name("disk").unwrap();
    assert_eq!(svol.read_at(0, 16).await.unwrap(), vec![9u8; 16]);
}

// Property 7: migrating A -> B -> C preserves contents bit-identically.
#[tokio::test]
async fn round_trip_preserves_contents() {
    const BS: u32 = 4096;
    const NBLOCKS: u64 = 64;
    let log = test_log();
    let adir = tempfile::tempdir().unwrap();
    let bdir = tempfile::tempdir().unwrap();
    let cdir = tempfile::tempdir().unwrap();

    let mut content = Vec::new();
    for k in 0..NBLOCKS {
        content
            .extend(std::iter::repeat((k * 7 & 0xff) as u8).take(BS as usize));
    }
    let a_spec = spec(adir.path(), "disk", BS);
    std::fs::write(&a_spec.base, &content).unwrap();

    let a_group =
        migrate_from_local(vec![a_spec], ExposeMode::None, &log).unwrap();

    // A -> B.
    let (s_io, d_io, _sd, _ds) = tapped_link(None);
    let incoming_b = migrate_from(
        vec![spec(bdir.path(), "disk", BS)],
        ExposeMode::None,
        d_io,
        MigrateFromOptions::default(),
        &log,
    );
    migrate_to(
        &a_group,
        Arc::new(TestVmm::default()),
        TestAgent::new(Duration::ZERO),
        s_io,
        MigrateToOptions::default(),
        &log,
    )
    .await
    .unwrap();
    let b_group = incoming_b.wait().await.unwrap();

    // B -> C.
    let (s_io, d_io, _sd, _ds) = tapped_link(None);
    let incoming_c = migrate_from(
        vec![spec(cdir.path(), "disk", BS)],
        ExposeMode::None,
        d_io,
        MigrateFromOptions::default(),
        &log,
    );
    migrate_to(
        &b_group,
        Arc::new(TestVmm::default()),
        TestAgent::new(Duration::ZERO),
        s_io,
        MigrateToOptions::default(),
        &log,
    )
    .await
    .unwrap();
    let c_group = incoming_c.wait().await.unwrap();

    let c_entry = c_group.entry_by_name("disk").unwrap();
    assert!(c_entry.authority_received());
    assert!(c_entry.is_completed());

    let cvol = c_group.exposed_by_name("disk").unwrap();
    assert_eq!(read_all(&cvol).await, content);
}
