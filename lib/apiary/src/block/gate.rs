// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Result;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::block::Volume;

/// Lockable write gate.
///
/// While locked, writes block until [`Volume::unlock`]; reads pass
/// through.  This is the instantaneous quiesce used at final handoff:
/// with the gate held, the dirty tracker below can be sampled knowing no
/// further writes will land.
pub struct GateVolume {
    inner: Arc<dyn Volume>,
    excl: Arc<RwLock<()>>,
    held: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
}

impl GateVolume {
    pub fn new(inner: Arc<dyn Volume>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            excl: Arc::new(RwLock::new(())),
            held: Mutex::new(None),
        })
    }
}

#[async_trait::async_trait]
impl Volume for GateVolume {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    async fn read_at(&self, off: u64, len: usize) -> Result<Bytes> {
        self.inner.read_at(off, len).await
    }

    async fn write_at(&self, off: u64, data: Bytes) -> Result<()> {
        let _permit = self.excl.read().await;
        self.inner.write_at(off, data).await
    }

    async fn discard(&self, off: u64, len: u64) -> Result<()> {
        self.inner.discard(off, len).await
    }

    async fn lock(&self) {
        // Single-controller discipline: lock() is never raced against
        // itself, so the early return only guards against double-locking.
        if self.held.lock().unwrap().is_some() {
            return;
        }
        let guard = Arc::clone(&self.excl).write_owned().await;
        *self.held.lock().unwrap() = Some(guard);
    }

    fn unlock(&self) {
        self.held.lock().unwrap().take();
    }

    async fn close(&self) -> Result<()> {
        self.unlock();
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemVolume;
    use std::time::Duration;

    #[tokio::test]
    async fn writes_block_while_locked() {
        let gate = GateVolume::new(MemVolume::zeroed(64));

        gate.lock().await;

        let g = Arc::clone(&gate);
        let writer = tokio::spawn(async move {
            g.write_at(0, Bytes::from(vec![7u8; 8])).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        gate.unlock();
        writer.await.unwrap().unwrap();
        assert_eq!(&gate.read_at(0, 8).await.unwrap()[..], &[7u8; 8]);
    }

    #[tokio::test]
    async fn reads_pass_while_locked() {
        let gate = GateVolume::new(MemVolume::zeroed(64));
        gate.lock().await;
        assert_eq!(gate.read_at(0, 4).await.unwrap().len(), 4);
        gate.unlock();
    }
}
