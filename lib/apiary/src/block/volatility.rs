// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::io::Result;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::block::{self, Volume};

struct VolState {
    block_size: u32,
    window: Duration,
    inner: Mutex<VolInner>,
}

struct VolInner {
    counts: Vec<u32>,
    log: VecDeque<(Instant, u64)>,
}

impl VolState {
    fn expire(&self, inner: &mut VolInner, now: Instant) {
        while let Some(&(t, b)) = inner.log.front() {
            if now.duration_since(t) < self.window {
                break;
            }
            inner.log.pop_front();
            inner.counts[b as usize] -= 1;
        }
    }

    fn note_write(&self, blocks: std::ops::Range<u64>) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        self.expire(&mut inner, now);
        for b in blocks {
            inner.log.push_back((now, b));
            inner.counts[b as usize] += 1;
        }
    }

    fn heat(&self, block: u64) -> u32 {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        self.expire(&mut inner, now);
        inner.counts.get(block as usize).copied().unwrap_or(0)
    }
}

/// Passthrough layer counting writes per block within a rolling expiry
/// window.  Hot blocks are deprioritised during precopy since they would
/// only be re-sent by a later dirty cycle anyway.
pub struct VolatilityVolume {
    inner: Arc<dyn Volume>,
    state: Arc<VolState>,
}

/// Priority sidecar for a [`VolatilityVolume`].
#[derive(Clone)]
pub struct VolatilityHandle {
    state: Weak<VolState>,
}

impl VolatilityVolume {
    pub fn new(
        inner: Arc<dyn Volume>,
        block_size: u32,
        window: Duration,
    ) -> (Arc<Self>, VolatilityHandle) {
        let nblocks = block::block_count(inner.size(), block_size) as usize;
        let state = Arc::new(VolState {
            block_size,
            window,
            inner: Mutex::new(VolInner {
                counts: vec![0; nblocks],
                log: VecDeque::new(),
            }),
        });
        let handle = VolatilityHandle { state: Arc::downgrade(&state) };
        (Arc::new(Self { inner, state }), handle)
    }
}

impl VolatilityHandle {
    /// Write count for `block` within the expiry window; 0 once the stack
    /// is gone.
    pub fn heat(&self, block: u64) -> u32 {
        self.state.upgrade().map(|s| s.heat(block)).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Volume for VolatilityVolume {
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
        self.state.note_write(span);
        Ok(())
    }

    async fn discard(&self, off: u64, len: u64) -> Result<()> {
        self.inner.discard(off, len).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
