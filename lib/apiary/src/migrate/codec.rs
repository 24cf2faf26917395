// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Framing for the live migration protocol.
//!
//! A single reliable, ordered duplex byte stream carries frames of the
//! form `{device_index: u32, kind: u8, length: u32}` (little-endian)
//! followed by `length` payload bytes.  Messages for different device
//! indices are independent; a reader dispatches each frame to a
//! per-device handler.
//!
//! The kind codes and the custom-event subtype codes are the only
//! compatibility-critical values; everything else is an implementation
//! detail of this codec.  `WriteAt` payload bytes are raw, uncompressed
//! device data.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a frame payload, bounding decoder allocation.
pub const MAX_FRAME_LEN: u32 = 32 * 1024 * 1024;

const HEADER_LEN: usize = 9;

/// Custom event subtype: write authority for the device now rests with
/// the receiving peer.
pub const CUSTOM_TRANSFER_AUTHORITY: u8 = 0;
/// Custom event subtype: every device's `DevInfo` has been sent.
pub const CUSTOM_ALL_DEVICES_SENT: u8 = 1;

/// Migration protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// We received an unexpected message type
    #[error("couldn't decode message type ({0})")]
    InvalidMessageType(u8),

    /// We received an unexpected event type
    #[error("couldn't decode event type ({0})")]
    InvalidEventType(u8),

    /// The payload received on the wire wasn't the expected length
    #[error("unexpected payload length {1} for type {0:?}")]
    UnexpectedMessageLen(u8, usize),

    /// A frame header declared a payload larger than we will buffer
    #[error("frame length {0} exceeds maximum")]
    FrameTooLarge(u32),

    /// Encountered an I/O error on the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Received a non-UTF8 string field
    #[error("non-UTF8 string: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Lifecycle events carried on the `Event` kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    PreLock,
    PostLock,
    PreUnlock,
    PostUnlock,
    Completed,
    Custom(u8),
}

/// Message represents the different frame bodies exchanged in the live
/// migration protocol.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Device descriptor; sent once per device, never mutated.
    DevInfo { name: String, size: u64, block_size: u32, schema: String },
    /// The peer wants these bytes and expects a `WriteAt` in response.
    ReadAt { offset: u64, length: u32 },
    /// Device data, either a response to `ReadAt` or an unsolicited push.
    WriteAt { offset: u64, data: Bytes },
    /// Priority hint: promote the blocks under this range.
    NeedAt { offset: u64, length: u32 },
    /// Priority hint: stop caring about the blocks under this range.
    DontNeedAt { offset: u64, length: u32 },
    /// Blocks dirtied since the last sample; about to be re-sent.
    DirtyList { block_size: u32, blocks: Vec<u64> },
    Event(DeviceEvent),
}

/// MessageType holds the tags identifying frame kinds on the wire.  They
/// must be kept in bijection with [`Message`]; the values are
/// compatibility-critical and never reassigned.
#[derive(Copy, Clone, Debug, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum MessageType {
    DevInfo = 0,
    ReadAt = 1,
    WriteAt = 2,
    NeedAt = 3,
    DontNeedAt = 4,
    DirtyList = 5,
    Event = 6,
}

/// Wire values for [`DeviceEvent`]; also compatibility-critical.
#[derive(Copy, Clone, Debug, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum EventType {
    PreLock = 0,
    PostLock = 1,
    PreUnlock = 2,
    PostUnlock = 3,
    Completed = 4,
    Custom = 5,
}

impl From<&Message> for MessageType {
    fn from(m: &Message) -> MessageType {
        match m {
            Message::DevInfo { .. } => MessageType::DevInfo,
            Message::ReadAt { .. } => MessageType::ReadAt,
            Message::WriteAt { .. } => MessageType::WriteAt,
            Message::NeedAt { .. } => MessageType::NeedAt,
            Message::DontNeedAt { .. } => MessageType::DontNeedAt,
            Message::DirtyList { .. } => MessageType::DirtyList,
            Message::Event(_) => MessageType::Event,
        }
    }
}

impl From<&DeviceEvent> for EventType {
    fn from(e: &DeviceEvent) -> EventType {
        match e {
            DeviceEvent::PreLock => EventType::PreLock,
            DeviceEvent::PostLock => EventType::PostLock,
            DeviceEvent::PreUnlock => EventType::PreUnlock,
            DeviceEvent::PostUnlock => EventType::PostUnlock,
            DeviceEvent::Completed => EventType::Completed,
            DeviceEvent::Custom(_) => EventType::Custom,
        }
    }
}

/// One frame: a device index plus a message.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub device: u32,
    pub msg: Message,
}

fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_u32_le(s.len() as u32);
    dst.put_slice(s.as_bytes());
}

fn get_string(
    tag: MessageType,
    src: &mut Bytes,
) -> Result<String, ProtocolError> {
    if src.len() < 4 {
        return Err(ProtocolError::UnexpectedMessageLen(tag as u8, src.len()));
    }
    let len = src.get_u32_le() as usize;
    if src.len() < len {
        return Err(ProtocolError::UnexpectedMessageLen(tag as u8, src.len()));
    }
    Ok(String::from_utf8(src.split_to(len).to_vec())?)
}

fn get_offset_length(
    tag: MessageType,
    src: &mut Bytes,
) -> Result<(u64, u32), ProtocolError> {
    if src.len() != 12 {
        return Err(ProtocolError::UnexpectedMessageLen(tag as u8, src.len()));
    }
    Ok((src.get_u64_le(), src.get_u32_le()))
}

impl Message {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Message::DevInfo { name, size, block_size, schema } => {
                put_string(dst, name);
                dst.put_u64_le(*size);
                dst.put_u32_le(*block_size);
                put_string(dst, schema);
            }
            Message::ReadAt { offset, length }
            | Message::NeedAt { offset, length }
            | Message::DontNeedAt { offset, length } => {
                dst.put_u64_le(*offset);
                dst.put_u32_le(*length);
            }
            Message::WriteAt { offset, data } => {
                dst.put_u64_le(*offset);
                dst.put_slice(data);
            }
            Message::DirtyList { block_size, blocks } => {
                dst.put_u32_le(*block_size);
                dst.put_u32_le(blocks.len() as u32);
                for b in blocks {
                    dst.put_u64_le(*b);
                }
            }
            Message::Event(ev) => {
                dst.put_u8(EventType::from(ev) as u8);
                if let DeviceEvent::Custom(sub) = ev {
                    dst.put_u8(*sub);
                }
            }
        }
    }

    fn decode(tag: MessageType, mut src: Bytes) -> Result<Self, ProtocolError> {
        let m = match tag {
            MessageType::DevInfo => {
                let name = get_string(tag, &mut src)?;
                if src.len() < 12 {
                    return Err(ProtocolError::UnexpectedMessageLen(
                        tag as u8,
                        src.len(),
                    ));
                }
                let size = src.get_u64_le();
                let block_size = src.get_u32_le();
                let schema = get_string(tag, &mut src)?;
                Message::DevInfo { name, size, block_size, schema }
            }
            MessageType::ReadAt => {
                let (offset, length) = get_offset_length(tag, &mut src)?;
                Message::ReadAt { offset, length }
            }
            MessageType::NeedAt => {
                let (offset, length) = get_offset_length(tag, &mut src)?;
                Message::NeedAt { offset, length }
            }
            MessageType::DontNeedAt => {
                let (offset, length) = get_offset_length(tag, &mut src)?;
                Message::DontNeedAt { offset, length }
            }
            MessageType::WriteAt => {
                if src.len() < 8 {
                    return Err(ProtocolError::UnexpectedMessageLen(
                        tag as u8,
                        src.len(),
                    ));
                }
                let offset = src.get_u64_le();
                Message::WriteAt { offset, data: src }
            }
            MessageType::DirtyList => {
                if src.len() < 8 {
                    return Err(ProtocolError::UnexpectedMessageLen(
                        tag as u8,
                        src.len(),
                    ));
                }
                let block_size = src.get_u32_le();
                let count = src.get_u32_le() as usize;
                if src.len() != count * 8 {
                    return Err(ProtocolError::UnexpectedMessageLen(
                        tag as u8,
                        src.len(),
                    ));
                }
                let blocks =
                    (0..count).map(|_| src.get_u64_le()).collect::<Vec<_>>();
                Message::DirtyList { block_size, blocks }
            }
            MessageType::Event => {
                if src.is_empty() {
                    return Err(ProtocolError::UnexpectedMessageLen(
                        tag as u8,
                        0,
                    ));
                }
                let ev_byte = src.get_u8();
                let ev = EventType::try_from(ev_byte).map_err(|_| {
                    ProtocolError::InvalidEventType(ev_byte)
                })?;
                let ev = match ev {
                    EventType::PreLock => DeviceEvent::PreLock,
                    EventType::PostLock => DeviceEvent::PostLock,
                    EventType::PreUnlock => DeviceEvent::PreUnlock,
                    EventType::PostUnlock => DeviceEvent::PostUnlock,
                    EventType::Completed => DeviceEvent::Completed,
                    EventType::Custom => {
                        if src.is_empty() {
                            return Err(ProtocolError::UnexpectedMessageLen(
                                tag as u8,
                                1,
                            ));
                        }
                        DeviceEvent::Custom(src.get_u8())
                    }
                };
                if !src.is_empty() {
                    return Err(ProtocolError::UnexpectedMessageLen(
                        tag as u8,
                        src.len(),
                    ));
                }
                Message::Event(ev)
            }
        };
        Ok(m)
    }
}

/// Writes one frame.  The caller serialises concurrent writers; frames
/// from interleaved tasks must not interleave on the wire.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &Frame,
) -> Result<(), ProtocolError> {
    let mut payload = BytesMut::new();
    frame.msg.encode(&mut payload);
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(ProtocolError::FrameTooLarge(payload.len() as u32));
    }

    let mut hdr = BytesMut::with_capacity(HEADER_LEN);
    hdr.put_u32_le(frame.device);
    hdr.put_u8(MessageType::from(&frame.msg) as u8);
    hdr.put_u32_le(payload.len() as u32);

    w.write_all(&hdr).await?;
    w.write_all(&payload).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one frame.  Returns `None` on a clean EOF at a frame boundary;
/// an EOF mid-frame is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<Frame>, ProtocolError> {
    let mut hdr = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = r.read(&mut hdr[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }
        filled += n;
    }

    let mut hdr = &hdr[..];
    let device = hdr.get_u32_le();
    let tag_byte = hdr.get_u8();
    let len = hdr.get_u32_le();

    let tag = MessageType::try_from(tag_byte)
        .map_err(|_| ProtocolError::InvalidMessageType(tag_byte))?;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    let msg = Message::decode(tag, Bytes::from(payload))?;
    Ok(Some(Frame { device, msg }))
}
