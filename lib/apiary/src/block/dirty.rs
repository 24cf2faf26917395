// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{Error, ErrorKind, Result};
use std::sync::{Arc, Mutex, Weak};

use bitvec::prelude::{BitVec, Lsb0};
use bytes::Bytes;

use crate::block::{self, Volume};

struct DirtyState {
    block_size: u32,
    bits: Mutex<BitVec<u8, Lsb0>>,
}

/// Passthrough layer recording which blocks were written since the last
/// sample.
pub struct DirtyVolume {
    inner: Arc<dyn Volume>,
    state: Arc<DirtyState>,
}

/// Sampling sidecar for a [`DirtyVolume`].
///
/// Holds only a weak reference; sampling a closed stack reports an error
/// rather than keeping the stack alive.
#[derive(Clone)]
pub struct DirtySampler {
    state: Weak<DirtyState>,
}

impl DirtyVolume {
    pub fn new(
        inner: Arc<dyn Volume>,
        block_size: u32,
    ) -> (Arc<Self>, DirtySampler) {
        let nblocks = block::block_count(inner.size(), block_size) as usize;
        let state = Arc::new(DirtyState {
            block_size,
            bits: Mutex::new(BitVec::repeat(false, nblocks)),
        });
        let sampler = DirtySampler { state: Arc::downgrade(&state) };
        (Arc::new(Self { inner, state }), sampler)
    }
}

impl DirtySampler {
    fn state(&self) -> Result<Arc<DirtyState>> {
        self.state.upgrade().ok_or_else(|| {
            Error::new(ErrorKind::BrokenPipe, "dirty tracker closed")
        })
    }

    /// Number of blocks currently dirty.
    pub fn measure_dirty(&self) -> Result<usize> {
        let state = self.state()?;
        let bits = state.bits.lock().unwrap();
        Ok(bits.count_ones())
    }

    /// Atomically takes and clears the dirty set.
    pub fn take_dirty(&self) -> Result<Vec<u64>> {
        let state = self.state()?;
        let mut bits = state.bits.lock().unwrap();
        let blocks =
            bits.iter_ones().map(|b| b as u64).collect::<Vec<_>>();
        bits.fill(false);
        Ok(blocks)
    }
}

#[async_trait::async_trait]
impl Volume for DirtyVolume {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    async fn read_at(&self, off: u64, len: usize) -> Result<Bytes> {
        self.inner.read_at(off, len).await
    }

    async fn write_at(&self, off: u64, data: Bytes) -> Result<()> {
        let span = block::blocks_spanned(
            off,
            data.len() as u64,
            self.state.block_size,
        );
        self.inner.write_at(off, data).await?;
        let mut bits = self.state.bits.lock().unwrap();
        for b in span {
            bits.set(b as usize, true);
        }
        Ok(())
    }

    async fn discard(&self, off: u64, len: u64) -> Result<()> {
        self.inner.discard(off, len).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemVolume;

    #[tokio::test]
    async fn sample_is_get_and_clear() {
        let (vol, sampler) = DirtyVolume::new(MemVolume::zeroed(64), 16);

        vol.write_at(0, Bytes::from(vec![1u8; 4])).await.unwrap();
        vol.write_at(30, Bytes::from(vec![1u8; 4])).await.unwrap();

        assert_eq!(sampler.measure_dirty().unwrap(), 3);
        assert_eq!(sampler.take_dirty().unwrap(), vec![0, 1, 2]);

        // Monotonicity: no writes in between, second sample is empty.
        assert!(sampler.take_dirty().unwrap().is_empty());

        vol.write_at(48, Bytes::from(vec![1u8; 1])).await.unwrap();
        assert_eq!(sampler.take_dirty().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn sampler_outliving_stack_reports_error() {
        let (vol, sampler) = DirtyVolume::new(MemVolume::zeroed(64), 16);
        drop(vol);
        assert!(sampler.take_dirty().is_err());
    }
}
