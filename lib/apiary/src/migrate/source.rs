// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::sync::Arc;

use slog::{debug, info, warn, Logger};
use tokio::io::AsyncRead;

use crate::block::{self, Volume};
use crate::migrate::codec::{self, DeviceEvent, Message};
use crate::migrate::order::BlockOrder;
use crate::migrate::proto::FrameSender;
use crate::migrate::{CancelSignal, MigrateError};

/// Per-device send surface on the source: device descriptor, block
/// pushes, dirty lists and lifecycle events, all multiplexed through the
/// shared [`FrameSender`].
#[derive(Clone)]
pub struct ToDevice {
    pub device: u32,
    pub name: String,
    pub size: u64,
    pub block_size: u32,
    sender: Arc<FrameSender>,
}

impl ToDevice {
    pub fn new(
        device: u32,
        name: String,
        size: u64,
        block_size: u32,
        sender: Arc<FrameSender>,
    ) -> Self {
        Self { device, name, size, block_size, sender }
    }

    pub async fn send_dev_info(
        &self,
        schema: &str,
    ) -> Result<(), codec::ProtocolError> {
        self.sender
            .send(
                self.device,
                Message::DevInfo {
                    name: self.name.clone(),
                    size: self.size,
                    block_size: self.block_size,
                    schema: schema.to_string(),
                },
            )
            .await
    }

    pub async fn write_at(
        &self,
        offset: u64,
        data: bytes::Bytes,
    ) -> Result<(), codec::ProtocolError> {
        self.sender.send(self.device, Message::WriteAt { offset, data }).await
    }

    pub async fn dirty_list(
        &self,
        blocks: &[u64],
    ) -> Result<(), codec::ProtocolError> {
        self.sender
            .send(
                self.device,
                Message::DirtyList {
                    block_size: self.block_size,
                    blocks: blocks.to_vec(),
                },
            )
            .await
    }

    pub async fn send_event(
        &self,
        ev: DeviceEvent,
    ) -> Result<(), codec::ProtocolError> {
        self.sender.send(self.device, Message::Event(ev)).await
    }
}

/// Source-side view of one device for incoming frames.
pub(crate) struct SourceDevice {
    pub name: String,
    pub storage: Arc<dyn Volume>,
    pub orderer: Arc<BlockOrder>,
    pub block_size: u32,
}

impl SourceDevice {
    /// Blocks spanned by a peer hint, clamped to the device and computed
    /// with `block_size` as the denominator for both hint kinds.
    fn hint_span(&self, offset: u64, length: u32) -> std::ops::Range<u64> {
        let size = self.storage.size();
        let end = (offset + u64::from(length)).min(size);
        if offset >= end {
            return 0..0;
        }
        block::blocks_spanned(offset, end - offset, self.block_size)
    }
}

/// Reads destination-originated frames for the lifetime of a migration:
/// priority hints feed the per-device block orderers, and explicit
/// `ReadAt` requests are served straight off the device's stack top.
///
/// A clean EOF ends the loop without error; cancellation is treated the
/// same way.
pub(crate) async fn run_source_dispatch<R: AsyncRead + Unpin>(
    mut r: R,
    sender: Arc<FrameSender>,
    devices: HashMap<u32, SourceDevice>,
    cancel: CancelSignal,
    log: Logger,
) -> Result<(), MigrateError> {
    loop {
        let frame = tokio::select! {
            res = codec::read_frame(&mut r) => res?,
            _ = cancel.cancelled() => {
                info!(log, "source dispatch cancelled");
                return Ok(());
            }
        };
        let Some(frame) = frame else {
            info!(log, "peer closed the return channel");
            return Ok(());
        };

        let Some(dev) = devices.get(&frame.device) else {
            warn!(log, "frame for unknown device index";
                "device" => frame.device);
            continue;
        };

        match frame.msg {
            Message::NeedAt { offset, length } => {
                debug!(log, "need-at hint";
                    "device" => %dev.name, "offset" => offset,
                    "length" => length);
                for b in dev.hint_span(offset, length) {
                    dev.orderer.promote(b);
                }
            }
            Message::DontNeedAt { offset, length } => {
                for b in dev.hint_span(offset, length) {
                    dev.orderer.remove(b);
                }
            }
            Message::ReadAt { offset, length } => {
                let size = dev.storage.size();
                if offset >= size {
                    warn!(log, "read-at past end of device";
                        "device" => %dev.name, "offset" => offset);
                    continue;
                }
                let len = u64::from(length).min(size - offset) as usize;
                let data = dev
                    .storage
                    .read_at(offset, len)
                    .await
                    .map_err(|err| MigrateError::BlockIo {
                        name: dev.name.clone(),
                        err,
                    })?;
                sender
                    .send(frame.device, Message::WriteAt { offset, data })
                    .await?;
            }
            other => {
                warn!(log, "unexpected source-bound message";
                    "device" => %dev.name, "msg" => ?other);
            }
        }
    }
}
