// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::sync::Arc;

use slog::{debug, info, warn, Logger};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::block::HintFn;
use crate::device::{DeviceEntry, DeviceGroup};
use crate::migrate::codec::{
    self, DeviceEvent, Message, CUSTOM_ALL_DEVICES_SENT,
};
use crate::migrate::proto::FrameSender;
use crate::migrate::{CancelSignal, FromHooks, MigrateError, SchemaRewriteFn};

/// Per-device frame handler capacity.  Small on purpose: a slow install
/// path pushes back on the stream reader rather than buffering without
/// bound.
const WORKER_QUEUE: usize = 32;

/// Builds the `NeedAt`/`DontNeedAt` callbacks a waiting cache is wired
/// with.  The cache calls them from synchronous contexts, so the hint is
/// queued and a forwarding task owns the actual frame send.
fn hint_channel(
    device: u32,
    sender: &Arc<FrameSender>,
    log: &Logger,
) -> (HintFn, HintFn) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let fwd_sender = Arc::clone(sender);
    let fwd_log = log.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = fwd_sender.send(device, msg).await {
                debug!(fwd_log, "hint channel closed: {e}");
                break;
            }
        }
    });

    let need_tx = tx.clone();
    let need: HintFn = Arc::new(move |offset, length| {
        let _ = need_tx.send(Message::NeedAt { offset, length });
    });
    let dont: HintFn = Arc::new(move |offset, length| {
        let _ = tx.send(Message::DontNeedAt { offset, length });
    });
    (need, dont)
}

struct Worker {
    entry: Arc<DeviceEntry>,
    group: Arc<DeviceGroup>,
    sender: Arc<FrameSender>,
    hooks: Arc<FromHooks>,
    log: Logger,
}

impl Worker {
    async fn run(
        &self,
        mut rx: mpsc::Receiver<Message>,
    ) -> Result<(), MigrateError> {
        while let Some(msg) = rx.recv().await {
            self.handle(msg).await?;
        }
        Ok(())
    }

    async fn handle(&self, msg: Message) -> Result<(), MigrateError> {
        let entry = &self.entry;
        match msg {
            Message::WriteAt { offset, data } => {
                let waiting = entry.waiting().ok_or_else(|| {
                    MigrateError::NotAdmitted(entry.index)
                })?;
                waiting.install(offset, data).await.map_err(|err| {
                    MigrateError::BlockIo { name: entry.name.clone(), err }
                })?;
            }
            Message::DirtyList { blocks, block_size } => {
                if block_size != entry.block_size() {
                    warn!(self.log, "dirty list with foreign block size";
                        "device" => %entry.name, "block_size" => block_size);
                }
                if let Some(waiting) = entry.waiting() {
                    waiting.mark_dirty(&blocks);
                }
            }
            Message::ReadAt { offset, length } => {
                // Serving a peer read may park in the waiting cache until
                // the data exists; do it off the worker so installs keep
                // flowing.
                let storage = entry.storage();
                let sender = Arc::clone(&self.sender);
                let device = entry.index;
                let name = entry.name.clone();
                let log = self.log.clone();
                tokio::spawn(async move {
                    let size = storage.size();
                    if offset >= size {
                        warn!(log, "peer read past end of device";
                            "device" => %name, "offset" => offset);
                        return;
                    }
                    let len = u64::from(length).min(size - offset) as usize;
                    match storage.read_at(offset, len).await {
                        Ok(data) => {
                            let _ = sender
                                .send(
                                    device,
                                    Message::WriteAt { offset, data },
                                )
                                .await;
                        }
                        Err(e) => {
                            warn!(log, "serving peer read failed: {e}";
                                "device" => %name);
                        }
                    }
                });
            }
            Message::Event(ev) => self.handle_event(ev),
            Message::DevInfo { .. } => {
                // Admission already checked the descriptor; a repeat is
                // harmless.
                debug!(self.log, "duplicate DevInfo";
                    "device" => %entry.name);
            }
            other => {
                warn!(self.log, "unexpected destination-bound message";
                    "device" => %entry.name, "msg" => ?other);
            }
        }
        Ok(())
    }

    fn handle_event(&self, ev: DeviceEvent) {
        let entry = &self.entry;
        match ev {
            DeviceEvent::PreLock
            | DeviceEvent::PostLock
            | DeviceEvent::PreUnlock
            | DeviceEvent::PostUnlock => {
                debug!(self.log, "peer lock event"; "device" => %entry.name,
                    "event" => ?ev);
            }
            DeviceEvent::Completed => {
                info!(self.log, "device migration completed";
                    "device" => %entry.name);
                self.group.note_completed(entry.index);
                self.hooks.fire_device_completed(entry.index);
            }
            DeviceEvent::Custom(sub) => {
                if sub == CUSTOM_ALL_DEVICES_SENT {
                    info!(self.log, "all devices announced by source");
                    self.group.note_all_sent();
                    self.hooks.fire_all_devices_sent();
                } else {
                    self.group.note_custom(entry.index, sub);
                    if sub == codec::CUSTOM_TRANSFER_AUTHORITY {
                        info!(self.log, "write authority received";
                            "device" => %entry.name);
                        self.hooks.fire_authority_received(entry.index);
                    }
                }
            }
        }
    }
}

/// Runs the destination side of the protocol: admits devices as their
/// descriptors arrive and fans frames out to per-device handlers.
/// Returns on clean EOF once every handler has drained.
pub(crate) async fn run_destination<R: AsyncRead + Unpin>(
    mut r: R,
    sender: Arc<FrameSender>,
    group: Arc<DeviceGroup>,
    hooks: Arc<FromHooks>,
    schema_rewrite: Option<SchemaRewriteFn>,
    cancel: CancelSignal,
    log: Logger,
) -> Result<(), MigrateError> {
    let mut workers: HashMap<u32, mpsc::Sender<Message>> = HashMap::new();
    let mut worker_tasks = Vec::new();

    let run = async {
        loop {
            let frame = tokio::select! {
                res = codec::read_frame(&mut r) => res?,
                _ = cancel.cancelled() => {
                    info!(log, "destination reader cancelled");
                    return Ok(());
                }
            };
            let Some(frame) = frame else {
                info!(log, "source closed the stream");
                return Ok(());
            };

            if let Message::DevInfo { name, size, block_size, schema } =
                &frame.msg
            {
                if !workers.contains_key(&frame.device) {
                    let schema = match schema_rewrite.as_ref() {
                        Some(rw) => rw(name, schema),
                        None => schema.clone(),
                    };
                    let (need, dont) =
                        hint_channel(frame.device, &sender, &log);
                    let (entry, fresh) = group.admit(
                        frame.device,
                        name,
                        *size,
                        *block_size,
                        schema,
                        need,
                        dont,
                    )?;
                    if fresh {
                        info!(log, "device admitted"; "device" => %name,
                            "index" => frame.device, "size" => size,
                            "block_size" => block_size);
                        hooks.fire_device_received(frame.device, name);
                        if let Some(node) = entry.exposed_node() {
                            hooks.fire_device_exposed(frame.device, &node);
                        }

                        let (tx, rx) = mpsc::channel(WORKER_QUEUE);
                        let worker = Worker {
                            entry,
                            group: Arc::clone(&group),
                            sender: Arc::clone(&sender),
                            hooks: Arc::clone(&hooks),
                            log: log.clone(),
                        };
                        worker_tasks.push(tokio::spawn(async move {
                            worker.run(rx).await
                        }));
                        workers.insert(frame.device, tx);
                    }
                    continue;
                }
            }

            match workers.get(&frame.device) {
                Some(tx) => {
                    if tx.send(frame.msg).await.is_err() {
                        // The handler died; its join below carries the
                        // actual error.
                        return Ok(());
                    }
                }
                None => return Err(MigrateError::NotAdmitted(frame.device)),
            }
        }
    };
    let mut res: Result<(), MigrateError> = run.await;

    // Let the per-device handlers drain before reporting.
    drop(workers);
    for task in worker_tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(log, "device handler failed: {e}");
                if res.is_ok() {
                    res = Err(e);
                }
            }
            Err(e) => {
                warn!(log, "device handler panicked: {e}");
            }
        }
    }
    res
}
