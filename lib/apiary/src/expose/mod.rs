// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Presenting a volume stack to the hypervisor as a host block device.
//!
//! The top of each stack is served over the kernel NBD client and then
//! mirrored into the VM directory as a block-special node named after
//! the device, which is the path the hypervisor's config points at.

use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

mod nbd;
pub use nbd::{serve, NbdExport};

#[derive(Debug, Error)]
pub enum ExposeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not stat exported device {0}")]
    DeviceStat(PathBuf),

    #[error("mknod({0}) failed: {1}")]
    Mknod(PathBuf, std::io::Error),

    #[error("NBD ioctl {0} failed: {1}")]
    Ioctl(&'static str, std::io::Error),
}

/// Creates a block-special node at `vm_dir/name` aliasing the block
/// device at `device_path`, so the hypervisor can open the device by a
/// stable path inside the VM directory.
pub fn expose_device_as_node(
    vm_dir: &Path,
    name: &str,
    device_path: &Path,
) -> Result<PathBuf, ExposeError> {
    let meta = std::fs::metadata(device_path)
        .map_err(|_| ExposeError::DeviceStat(device_path.to_path_buf()))?;
    let rdev = meta.rdev();

    let node = vm_dir.join(name);
    let cpath = std::ffi::CString::new(node.as_os_str().as_bytes())
        .map_err(|e| {
            ExposeError::Mknod(
                node.clone(),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            )
        })?;

    let res = unsafe {
        libc::mknod(cpath.as_ptr(), libc::S_IFBLK | 0o666, rdev as libc::dev_t)
    };
    if res != 0 {
        return Err(ExposeError::Mknod(
            node,
            std::io::Error::last_os_error(),
        ));
    }
    Ok(node)
}
