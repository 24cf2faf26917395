// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::OpenOptions;
use std::io::{Error, ErrorKind, Result};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bitvec::prelude::{BitVec, Lsb0};
use bytes::Bytes;
use tokio::task;

use crate::block::{self, Volume};

/// Sparse copy-on-write layer over an immutable base.
///
/// Writes land in a sparse overlay file of the same size as the base;
/// presence is tracked per block and persisted to a state sidecar so an
/// overlay survives process restarts.  Reads are served from the overlay
/// for present blocks and from the base otherwise.
///
/// Presence is block-granular: a write that covers only part of an absent
/// block first pulls the whole block up from the base.
pub struct OverlayVolume {
    base: Arc<dyn Volume>,
    overlay: Arc<std::fs::File>,
    state_path: PathBuf,
    block_size: u32,
    size: u64,
    present: Mutex<BitVec<u8, Lsb0>>,
}

impl OverlayVolume {
    pub fn open(
        base: Arc<dyn Volume>,
        overlay_path: impl AsRef<Path>,
        state_path: impl AsRef<Path>,
        block_size: u32,
    ) -> Result<Arc<Self>> {
        let size = base.size();
        let nblocks = block::block_count(size, block_size) as usize;

        let op: &Path = overlay_path.as_ref();
        if let Some(dir) = op.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let overlay =
            OpenOptions::new().read(true).write(true).create(true).open(op)?;
        overlay.set_len(size)?;

        let sp: &Path = state_path.as_ref();
        if let Some(dir) = sp.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let present = match std::fs::read(sp) {
            Ok(raw) => {
                let mut bits = BitVec::<u8, Lsb0>::from_vec(raw);
                if bits.len() < nblocks {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "overlay state sidecar too short",
                    ));
                }
                bits.truncate(nblocks);
                bits
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                BitVec::repeat(false, nblocks)
            }
            Err(e) => return Err(e),
        };

        Ok(Arc::new(Self {
            base,
            overlay: Arc::new(overlay),
            state_path: sp.to_path_buf(),
            block_size,
            size,
            present: Mutex::new(present),
        }))
    }

    fn is_present(&self, block: u64) -> bool {
        self.present.lock().unwrap()[block as usize]
    }

    async fn overlay_read(&self, off: u64, len: usize) -> Result<Bytes> {
        let fp = Arc::clone(&self.overlay);
        let buf = task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            fp.read_exact_at(&mut buf, off)?;
            Ok::<_, Error>(buf)
        })
        .await
        .map_err(|e| Error::new(ErrorKind::Other, e))??;
        Ok(buf.into())
    }

    async fn overlay_write(&self, off: u64, data: Bytes) -> Result<()> {
        let fp = Arc::clone(&self.overlay);
        task::spawn_blocking(move || fp.write_all_at(&data, off))
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e))?
    }

    /// Write the portion of `data` that belongs to `block`, pulling the
    /// rest of the block from the base if it is not yet present.
    async fn write_block(
        &self,
        block: u64,
        off: u64,
        data: &Bytes,
    ) -> Result<()> {
        let (boff, blen) = block::block_range(block, self.block_size, self.size);
        let dstart = off.max(boff);
        let dend = (off + data.len() as u64).min(boff + blen as u64);
        let slice = data
            .slice((dstart - off) as usize..(dend - off) as usize);

        if !self.is_present(block) && (dstart != boff || dend != boff + blen as u64)
        {
            let mut full = self.base.read_at(boff, blen).await?.to_vec();
            let s = (dstart - boff) as usize;
            full[s..s + slice.len()].copy_from_slice(&slice);
            self.overlay_write(boff, full.into()).await?;
        } else {
            self.overlay_write(dstart, slice).await?;
        }
        self.present.lock().unwrap().set(block as usize, true);
        Ok(())
    }

    fn persist_state(&self) -> Result<()> {
        let raw = self.present.lock().unwrap().clone().into_vec();
        std::fs::write(&self.state_path, raw)
    }
}

#[async_trait::async_trait]
impl Volume for OverlayVolume {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, off: u64, len: usize) -> Result<Bytes> {
        block::check_bounds(self.size, off, len)?;
        if len == 0 {
            return Ok(Bytes::new());
        }

        let mut out = Vec::with_capacity(len);
        for b in block::blocks_spanned(off, len as u64, self.block_size) {
            let (boff, blen) = block::block_range(b, self.block_size, self.size);
            let rstart = off.max(boff);
            let rend = (off + len as u64).min(boff + blen as u64);
            let rlen = (rend - rstart) as usize;
            let part = if self.is_present(b) {
                self.overlay_read(rstart, rlen).await?
            } else {
                self.base.read_at(rstart, rlen).await?
            };
            out.extend_from_slice(&part);
        }
        Ok(out.into())
    }

    async fn write_at(&self, off: u64, data: Bytes) -> Result<()> {
        block::check_bounds(self.size, off, data.len())?;
        for b in
            block::blocks_spanned(off, data.len() as u64, self.block_size)
        {
            self.write_block(b, off, &data).await?;
        }
        Ok(())
    }

    async fn discard(&self, off: u64, len: u64) -> Result<()> {
        self.base.discard(off, len).await
    }

    async fn close(&self) -> Result<()> {
        let fp = Arc::clone(&self.overlay);
        task::spawn_blocking(move || fp.sync_data())
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e))??;
        self.persist_state()?;
        self.base.close().await
    }
}
