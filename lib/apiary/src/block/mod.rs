// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Layered block-addressable storage volumes.
//!
//! Each device exposed to the hypervisor is the top of a stack of small
//! single-responsibility layers over an immutable base:
//!
//! base -> overlay -> metrics -> dirty tracker -> volatility monitor -> gate
//!
//! The stack is built bottom-up in that order and is never reordered once
//! exposed.  Layers hold the layer below by `Arc<dyn Volume>`; the dirty
//! tracker and the volatility monitor additionally hand out sidecar
//! handles (weak references) used only for sampling and priority, never
//! for ownership.
//!
//! On the destination side of a migration a [`WaitingVolume`] sits on top
//! of the stack instead, parking reads of blocks which have not arrived
//! yet.

use std::io::{Error, ErrorKind, Result};
use std::ops::Range;

use bytes::Bytes;

mod dirty;
pub use dirty::{DirtySampler, DirtyVolume};

mod file;
pub use file::FileVolume;

mod gate;
pub use gate::GateVolume;

mod mem;
pub use mem::MemVolume;

mod metrics;
pub use metrics::{MetricsHandle, MetricsVolume, StatsSnapshot, VolumeStats};

mod overlay;
pub use overlay::OverlayVolume;

mod volatility;
pub use volatility::{VolatilityHandle, VolatilityVolume};

mod waiting;
pub use waiting::{HintFn, WaitingHandle, WaitingVolume};

pub type ByteOffset = u64;
pub type ByteLen = usize;

/// Block size used when a device spec does not choose one.
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

/// A block-addressable storage provider.
///
/// Offsets are byte offsets; callers performing block-aligned I/O operate
/// on `[k * B, (k + 1) * B)` with the last block possibly short.
#[async_trait::async_trait]
pub trait Volume: Send + Sync + 'static {
    /// Total size of the volume in bytes.
    fn size(&self) -> u64;

    /// Read `len` bytes starting at byte offset `off`.
    async fn read_at(&self, off: u64, len: usize) -> Result<Bytes>;

    /// Write `data` starting at byte offset `off`.
    async fn write_at(&self, off: u64, data: Bytes) -> Result<()>;

    /// Hint that the caller no longer cares about `[off, off + len)`.
    /// Layers with nothing to contribute ignore it.
    async fn discard(&self, _off: u64, _len: u64) -> Result<()> {
        Ok(())
    }

    /// Quiesce writes until [`Volume::unlock`] is called.  A no-op in
    /// every layer but the gate, which is why lock requests are issued
    /// against the top of a stack.
    async fn lock(&self) {}

    /// Release a previous [`Volume::lock`].
    fn unlock(&self) {}

    /// Flush and release resources.  Stacks close top-down, so a layer
    /// finishes its own teardown before closing the layer below.
    async fn close(&self) -> Result<()>;
}

/// Number of blocks covering `size` bytes (last block may be short).
pub fn block_count(size: u64, block_size: u32) -> u64 {
    size.div_ceil(u64::from(block_size))
}

/// Byte range of block `block`, clamped to the end of the volume.
pub fn block_range(block: u64, block_size: u32, size: u64) -> (u64, usize) {
    let off = block * u64::from(block_size);
    let len = u64::from(block_size).min(size.saturating_sub(off));
    (off, len as usize)
}

/// Blocks spanned by the byte range `[off, off + len)`.
pub fn blocks_spanned(off: u64, len: u64, block_size: u32) -> Range<u64> {
    if len == 0 {
        let b = off / u64::from(block_size);
        return b..b;
    }
    let start = off / u64::from(block_size);
    let end = (off + len - 1) / u64::from(block_size) + 1;
    start..end
}

pub(crate) fn check_bounds(size: u64, off: u64, len: usize) -> Result<()> {
    if off.checked_add(len as u64).map(|end| end <= size) != Some(true) {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("invalid offset {off} and len {len} for size {size}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_math() {
        assert_eq!(block_count(262144, 65536), 4);
        assert_eq!(block_count(262145, 65536), 5);
        assert_eq!(block_count(0, 65536), 0);

        // Short last block is clamped.
        assert_eq!(block_range(4, 65536, 262145), (262144, 1));
        assert_eq!(block_range(1, 65536, 262144), (65536, 65536));

        assert_eq!(blocks_spanned(0, 65536, 65536), 0..1);
        assert_eq!(blocks_spanned(65535, 2, 65536), 0..2);
        assert_eq!(blocks_spanned(65536, 0, 65536), 1..1);
    }

    #[test]
    fn bounds_check() {
        assert!(check_bounds(100, 0, 100).is_ok());
        assert!(check_bounds(100, 100, 0).is_ok());
        assert!(check_bounds(100, 100, 1).is_err());
        assert!(check_bounds(100, u64::MAX, 1).is_err());
    }
}
