// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Result;
use std::sync::{Arc, Mutex};

use bitvec::prelude::{BitVec, Lsb0};
use bytes::Bytes;
use tokio::sync::Notify;

use crate::block::{self, Volume};

/// Priority hint callback: `(offset, length)`.
pub type HintFn = Arc<dyn Fn(u64, u32) + Send + Sync>;

struct WaitingCore {
    inner: Arc<dyn Volume>,
    block_size: u32,
    size: u64,
    present: Mutex<BitVec<u8, Lsb0>>,
    arrived: Notify,
    need_at: HintFn,
    dont_need_at: HintFn,
}

impl WaitingCore {
    fn all_present(&self, off: u64, len: u64) -> bool {
        let present = self.present.lock().unwrap();
        block::blocks_spanned(off, len, self.block_size)
            .all(|b| present[b as usize])
    }

    /// Parks until every block under `[off, off + len)` has arrived,
    /// hinting the upstream peer on first miss.
    async fn wait_present(&self, off: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut hinted = false;
        loop {
            // Register interest before checking so an install between the
            // check and the await cannot be missed.
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.all_present(off, len) {
                return;
            }
            if !hinted {
                (self.need_at)(off, len as u32);
                hinted = true;
            }
            notified.await;
        }
    }
}

/// Local face of the destination waiting cache: the volume the
/// hypervisor reads and writes.  Reads of blocks that have not been
/// received yet block until the matching install arrives.
pub struct WaitingVolume {
    core: Arc<WaitingCore>,
}

/// Remote face: the handle the from-protocol uses to install received
/// blocks and to invalidate blocks named by a dirty list.
#[derive(Clone)]
pub struct WaitingHandle {
    core: Arc<WaitingCore>,
}

impl WaitingVolume {
    pub fn new(
        inner: Arc<dyn Volume>,
        block_size: u32,
        need_at: HintFn,
        dont_need_at: HintFn,
    ) -> (Arc<Self>, WaitingHandle) {
        let size = inner.size();
        let nblocks = block::block_count(size, block_size) as usize;
        let core = Arc::new(WaitingCore {
            inner,
            block_size,
            size,
            present: Mutex::new(BitVec::repeat(false, nblocks)),
            arrived: Notify::new(),
            need_at,
            dont_need_at,
        });
        (Arc::new(Self { core: Arc::clone(&core) }), WaitingHandle { core })
    }
}

impl WaitingHandle {
    pub fn size(&self) -> u64 {
        self.core.size
    }

    /// Installs bytes received from the peer.  Blocks the guest has
    /// already written locally keep the local data; everything else is
    /// written through and marked present, waking parked readers.
    pub async fn install(&self, off: u64, data: Bytes) -> Result<()> {
        let core = &self.core;
        block::check_bounds(core.size, off, data.len())?;

        let end = off + data.len() as u64;
        for b in block::blocks_spanned(off, data.len() as u64, core.block_size)
        {
            let (boff, blen) =
                block::block_range(b, core.block_size, core.size);
            if core.present.lock().unwrap()[b as usize] {
                continue;
            }
            let s = off.max(boff);
            let e = end.min(boff + blen as u64);
            core.inner
                .write_at(s, data.slice((s - off) as usize..(e - off) as usize))
                .await?;
            // Only a fully covered block counts as arrived.
            if s == boff && e == boff + blen as u64 {
                core.present.lock().unwrap().set(b as usize, true);
            }
        }
        core.arrived.notify_waiters();
        Ok(())
    }

    /// Invalidates blocks named by an incoming dirty list; subsequent
    /// reads will park until the blocks are re-sent.  Duplicate entries
    /// are harmless.
    pub fn mark_dirty(&self, blocks: &[u64]) {
        let mut present = self.core.present.lock().unwrap();
        for &b in blocks {
            if (b as usize) < present.len() {
                present.set(b as usize, false);
            }
        }
    }

    /// Count of blocks which have arrived.
    pub fn present_blocks(&self) -> usize {
        self.core.present.lock().unwrap().count_ones()
    }
}

#[async_trait::async_trait]
impl Volume for WaitingVolume {
    fn size(&self) -> u64 {
        self.core.size
    }

    async fn read_at(&self, off: u64, len: usize) -> Result<Bytes> {
        block::check_bounds(self.core.size, off, len)?;
        self.core.wait_present(off, len as u64).await;
        self.core.inner.read_at(off, len).await
    }

    async fn write_at(&self, off: u64, data: Bytes) -> Result<()> {
        let core = &self.core;
        block::check_bounds(core.size, off, data.len())?;
        let end = off + data.len() as u64;

        // A partial write into a block that has not arrived must wait for
        // it first, or a late install would clobber the newer bytes.
        for b in block::blocks_spanned(off, data.len() as u64, core.block_size)
        {
            let (boff, blen) =
                block::block_range(b, core.block_size, core.size);
            let covers_fully =
                off <= boff && end >= boff + blen as u64;
            if !covers_fully {
                core.wait_present(boff, blen as u64).await;
            }
        }

        core.inner.write_at(off, data.clone()).await?;

        let mut present = core.present.lock().unwrap();
        for b in block::blocks_spanned(off, data.len() as u64, core.block_size)
        {
            let (boff, blen) =
                block::block_range(b, core.block_size, core.size);
            if off <= boff && end >= boff + blen as u64 {
                present.set(b as usize, true);
            }
        }
        drop(present);
        core.arrived.notify_waiters();
        Ok(())
    }

    async fn discard(&self, off: u64, len: u64) -> Result<()> {
        (self.core.dont_need_at)(off, len as u32);
        self.core.inner.discard(off, len).await
    }

    async fn close(&self) -> Result<()> {
        // Release anything still parked; the stack is going away.
        self.core.arrived.notify_waiters();
        self.core.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemVolume;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn hints() -> (HintFn, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (Arc::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        }) as HintFn, count)
    }

    #[tokio::test]
    async fn read_parks_until_install() {
        let (need, need_count) = hints();
        let (dont, _) = hints();
        let (local, remote) =
            WaitingVolume::new(MemVolume::zeroed(64), 16, need, dont);

        let l = Arc::clone(&local);
        let reader = tokio::spawn(async move { l.read_at(16, 16).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!reader.is_finished());
        assert_eq!(need_count.load(Ordering::SeqCst), 1);

        remote.install(16, Bytes::from(vec![0x5a; 16])).await.unwrap();
        let got = reader.await.unwrap().unwrap();
        assert!(got.iter().all(|&b| b == 0x5a));
    }

    #[tokio::test]
    async fn dirty_blocks_park_again() {
        let (need, _) = hints();
        let (dont, _) = hints();
        let (local, remote) =
            WaitingVolume::new(MemVolume::zeroed(64), 16, need, dont);

        remote.install(0, Bytes::from(vec![1u8; 64])).await.unwrap();
        assert_eq!(remote.present_blocks(), 4);

        remote.mark_dirty(&[1, 1, 2]);
        assert_eq!(remote.present_blocks(), 2);

        let l = Arc::clone(&local);
        let reader = tokio::spawn(async move { l.read_at(16, 16).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!reader.is_finished());

        remote.install(16, Bytes::from(vec![2u8; 32])).await.unwrap();
        let got = reader.await.unwrap().unwrap();
        assert!(got.iter().all(|&b| b == 2));
    }

    #[tokio::test]
    async fn local_write_wins_over_late_install() {
        let (need, _) = hints();
        let (dont, _) = hints();
        let (local, remote) =
            WaitingVolume::new(MemVolume::zeroed(64), 16, need, dont);

        local.write_at(0, Bytes::from(vec![9u8; 16])).await.unwrap();
        remote.install(0, Bytes::from(vec![1u8; 16])).await.unwrap();

        let got = local.read_at(0, 16).await.unwrap();
        assert!(got.iter().all(|&b| b == 9));
    }
}
