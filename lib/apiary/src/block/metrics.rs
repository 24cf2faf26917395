// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;

use crate::block::Volume;

/// Per-volume operation counters.
#[derive(Default)]
pub struct VolumeStats {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Sampling sidecar for a [`MetricsVolume`].
#[derive(Clone)]
pub struct MetricsHandle {
    stats: Weak<VolumeStats>,
}

impl MetricsHandle {
    pub fn snapshot(&self) -> StatsSnapshot {
        match self.stats.upgrade() {
            Some(s) => StatsSnapshot {
                reads: s.reads.load(Ordering::Relaxed),
                writes: s.writes.load(Ordering::Relaxed),
                bytes_read: s.bytes_read.load(Ordering::Relaxed),
                bytes_written: s.bytes_written.load(Ordering::Relaxed),
            },
            None => StatsSnapshot::default(),
        }
    }
}

/// Transparent counting passthrough.
pub struct MetricsVolume {
    inner: Arc<dyn Volume>,
    stats: Arc<VolumeStats>,
}

impl MetricsVolume {
    pub fn new(inner: Arc<dyn Volume>) -> (Arc<Self>, MetricsHandle) {
        let stats = Arc::new(VolumeStats::default());
        let handle = MetricsHandle { stats: Arc::downgrade(&stats) };
        (Arc::new(Self { inner, stats }), handle)
    }
}

#[async_trait::async_trait]
impl Volume for MetricsVolume {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    async fn read_at(&self, off: u64, len: usize) -> Result<Bytes> {
        let data = self.inner.read_at(off, len).await?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_read.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data)
    }

    async fn write_at(&self, off: u64, data: Bytes) -> Result<()> {
        let len = data.len() as u64;
        self.inner.write_at(off, data).await?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    async fn discard(&self, off: u64, len: u64) -> Result<()> {
        self.inner.discard(off, len).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
