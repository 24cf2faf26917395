// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Result;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::block::{self, Volume};

/// In-memory volume, mainly useful for tests and tiny devices (e.g. a
/// VM config blob).
pub struct MemVolume {
    bytes: Mutex<Vec<u8>>,
    size: u64,
}

impl MemVolume {
    pub fn new(bytes: Vec<u8>) -> Arc<Self> {
        let size = bytes.len() as u64;
        Arc::new(Self { bytes: Mutex::new(bytes), size })
    }

    pub fn zeroed(size: u64) -> Arc<Self> {
        Self::new(vec![0u8; size as usize])
    }

    /// Snapshot of the full contents.
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Volume for MemVolume {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, off: u64, len: usize) -> Result<Bytes> {
        block::check_bounds(self.size, off, len)?;
        let bytes = self.bytes.lock().unwrap();
        let start = off as usize;
        Ok(Bytes::copy_from_slice(&bytes[start..start + len]))
    }

    async fn write_at(&self, off: u64, data: Bytes) -> Result<()> {
        block::check_bounds(self.size, off, data.len())?;
        let mut bytes = self.bytes.lock().unwrap();
        let start = off as usize;
        bytes[start..start + data.len()].copy_from_slice(&data);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
