// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::{metadata, File, OpenOptions};
use std::io::{Error, ErrorKind, Result};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::task;

use crate::block::{self, Volume};

/// File-backed volume.  This is the immutable base of every stack; it is
/// created out of band and outlives any single migration.
pub struct FileVolume {
    fp: Arc<File>,
    path: PathBuf,
    size: u64,
    read_only: bool,
}

impl FileVolume {
    /// Opens an existing file at `path`.
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Arc<Self>> {
        let p: &Path = path.as_ref();

        let meta = metadata(p)?;
        if !read_only && meta.permissions().readonly() {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                "writable volume over read-only file not allowed",
            ));
        }

        let fp = OpenOptions::new().read(true).write(!read_only).open(p)?;
        let size = fp.metadata()?.len();

        Ok(Arc::new(Self {
            fp: Arc::new(fp),
            path: p.to_path_buf(),
            size,
            read_only,
        }))
    }

    /// Creates (or truncates) a file of `size` bytes at `path`.  Used by
    /// the destination to materialise a base sized to an incoming device
    /// descriptor.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Arc<Self>> {
        let p: &Path = path.as_ref();
        if let Some(dir) = p.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let fp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(p)?;
        fp.set_len(size)?;

        Ok(Arc::new(Self {
            fp: Arc::new(fp),
            path: p.to_path_buf(),
            size,
            read_only: false,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl Volume for FileVolume {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, off: u64, len: usize) -> Result<Bytes> {
        block::check_bounds(self.size, off, len)?;
        let fp = Arc::clone(&self.fp);
        let buf = task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            fp.read_exact_at(&mut buf, off)?;
            Ok::<_, Error>(buf)
        })
        .await
        .map_err(|e| Error::new(ErrorKind::Other, e))??;
        Ok(buf.into())
    }

    async fn write_at(&self, off: u64, data: Bytes) -> Result<()> {
        if self.read_only {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                "volume is read-only",
            ));
        }
        block::check_bounds(self.size, off, data.len())?;
        let fp = Arc::clone(&self.fp);
        task::spawn_blocking(move || fp.write_all_at(&data, off))
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e))?
    }

    async fn close(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let fp = Arc::clone(&self.fp);
        task::spawn_blocking(move || fp.sync_data())
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let vol = FileVolume::create(dir.path().join("base"), 1024).unwrap();

        vol.write_at(512, Bytes::from_static(b"hello")).await.unwrap();
        let got = vol.read_at(512, 5).await.unwrap();
        assert_eq!(&got[..], b"hello");

        // Freshly created regions read as zero.
        let zeros = vol.read_at(0, 16).await.unwrap();
        assert!(zeros.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn bounds_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let vol = FileVolume::create(dir.path().join("base"), 100).unwrap();
        assert!(vol.read_at(90, 20).await.is_err());
        assert!(vol.write_at(100, Bytes::from_static(b"x")).await.is_err());
    }
}
