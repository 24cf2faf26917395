// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal NBD server for volume stacks.
//!
//! Only the transmission phase is implemented: the kernel attach path
//! skips negotiation entirely, configuring `/dev/nbdN` through ioctls
//! and handing the kernel one end of a socketpair.  [`serve`] runs on
//! the other end and is equally usable over any stream for tests.

use std::io::{Error, ErrorKind, Result};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use slog::{info, warn, Logger};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::block::Volume;
use crate::expose::ExposeError;

const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

const NBD_CMD_READ: u16 = 0;
const NBD_CMD_WRITE: u16 = 1;
const NBD_CMD_DISC: u16 = 2;
const NBD_CMD_FLUSH: u16 = 3;
const NBD_CMD_TRIM: u16 = 4;

const NBD_SET_SOCK: libc::c_ulong = 0xab00;
const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
const NBD_DO_IT: libc::c_ulong = 0xab03;
const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;
const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xab07;
const NBD_DISCONNECT: libc::c_ulong = 0xab08;
const NBD_SET_FLAGS: libc::c_ulong = 0xab0a;

const NBD_FLAG_HAS_FLAGS: libc::c_ulong = 1 << 0;
const NBD_FLAG_SEND_FLUSH: libc::c_ulong = 1 << 2;
const NBD_FLAG_SEND_TRIM: libc::c_ulong = 1 << 5;

const EIO: u32 = 5;

struct Request {
    cmd: u16,
    handle: u64,
    offset: u64,
    length: u32,
}

async fn read_request<S: AsyncRead + Unpin>(
    conn: &mut S,
) -> Result<Option<Request>> {
    let mut hdr = [0u8; 28];
    match conn.read_exact(&mut hdr).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    // NBD is big-endian on the wire.
    let mut src = &hdr[..];
    let magic = src.get_u32();
    let _flags = src.get_u16();
    let cmd = src.get_u16();
    let handle = src.get_u64();
    let offset = src.get_u64();
    let length = src.get_u32();

    if magic != NBD_REQUEST_MAGIC {
        return Err(Error::new(ErrorKind::InvalidData, "bad NBD magic"));
    }
    Ok(Some(Request { cmd, handle, offset, length }))
}

async fn send_reply<S: AsyncWrite + Unpin>(
    conn: &mut S,
    handle: u64,
    error: u32,
    data: Option<&[u8]>,
) -> Result<()> {
    let mut out = BytesMut::with_capacity(16 + data.map_or(0, <[u8]>::len));
    out.put_u32(NBD_REPLY_MAGIC);
    out.put_u32(error);
    out.put_u64(handle);
    if let Some(data) = data {
        out.put_slice(data);
    }
    conn.write_all(&out).await?;
    conn.flush().await
}

/// Serves NBD transmission-phase requests from `conn` against `vol`
/// until the client disconnects.
pub async fn serve<S: AsyncRead + AsyncWrite + Unpin>(
    mut conn: S,
    vol: Arc<dyn Volume>,
    log: Logger,
) -> Result<()> {
    while let Some(req) = read_request(&mut conn).await? {
        match req.cmd {
            NBD_CMD_READ => {
                match vol.read_at(req.offset, req.length as usize).await {
                    Ok(data) => {
                        send_reply(&mut conn, req.handle, 0, Some(&data))
                            .await?;
                    }
                    Err(e) => {
                        warn!(log, "NBD read failed: {e}";
                            "offset" => req.offset);
                        send_reply(&mut conn, req.handle, EIO, None).await?;
                    }
                }
            }
            NBD_CMD_WRITE => {
                let mut data = vec![0u8; req.length as usize];
                conn.read_exact(&mut data).await?;
                let res = vol.write_at(req.offset, data.into()).await;
                let err = match res {
                    Ok(()) => 0,
                    Err(e) => {
                        warn!(log, "NBD write failed: {e}";
                            "offset" => req.offset);
                        EIO
                    }
                };
                send_reply(&mut conn, req.handle, err, None).await?;
            }
            NBD_CMD_FLUSH => {
                send_reply(&mut conn, req.handle, 0, None).await?;
            }
            NBD_CMD_TRIM => {
                let res =
                    vol.discard(req.offset, u64::from(req.length)).await;
                let err = if res.is_ok() { 0 } else { EIO };
                send_reply(&mut conn, req.handle, err, None).await?;
            }
            NBD_CMD_DISC => break,
            other => {
                warn!(log, "unsupported NBD command {other}");
                send_reply(&mut conn, req.handle, EIO, None).await?;
            }
        }
    }
    Ok(())
}

fn ioctl(
    fd: libc::c_int,
    req: libc::c_ulong,
    arg: libc::c_ulong,
    name: &'static str,
) -> std::result::Result<(), ExposeError> {
    let res = unsafe { libc::ioctl(fd, req, arg) };
    if res < 0 {
        return Err(ExposeError::Ioctl(name, Error::last_os_error()));
    }
    Ok(())
}

/// A volume attached to the kernel NBD client at `/dev/nbd<index>`.
pub struct NbdExport {
    device_path: PathBuf,
    nbd_file: std::fs::File,
    serve_task: JoinHandle<()>,
    kernel_task: std::thread::JoinHandle<()>,
}

impl NbdExport {
    /// Attaches `vol` to `/dev/nbd<index>`.  Requires the `nbd` module
    /// and enough privilege to drive it.
    pub fn attach(
        index: u32,
        vol: Arc<dyn Volume>,
        block_size: u32,
        log: Logger,
    ) -> std::result::Result<Self, ExposeError> {
        let device_path = PathBuf::from(format!("/dev/nbd{index}"));
        let nbd_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device_path)?;
        let fd = nbd_file.as_raw_fd();

        let (kernel_sock, serve_sock) = std::os::unix::net::UnixStream::pair()?;

        ioctl(fd, NBD_SET_BLKSIZE, block_size as libc::c_ulong, "SET_BLKSIZE")?;
        ioctl(
            fd,
            NBD_SET_SIZE_BLOCKS,
            (vol.size() / u64::from(block_size)) as libc::c_ulong,
            "SET_SIZE_BLOCKS",
        )?;
        ioctl(
            fd,
            NBD_SET_FLAGS,
            NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_TRIM,
            "SET_FLAGS",
        )?;
        ioctl(
            fd,
            NBD_SET_SOCK,
            kernel_sock.as_raw_fd() as libc::c_ulong,
            "SET_SOCK",
        )?;

        // NBD_DO_IT parks the calling thread until disconnect, so it gets
        // a plain thread of its own rather than a runtime worker.
        let do_it_file = nbd_file.try_clone()?;
        let kernel_task = std::thread::Builder::new()
            .name(format!("nbd{index} kernel"))
            .spawn(move || {
                let fd = do_it_file.as_raw_fd();
                let _keepalive = kernel_sock;
                unsafe {
                    libc::ioctl(fd, NBD_DO_IT, 0);
                    libc::ioctl(fd, NBD_CLEAR_SOCK, 0);
                }
            })?;

        serve_sock.set_nonblocking(true)?;
        let serve_conn = tokio::net::UnixStream::from_std(serve_sock)?;
        let serve_log = log.clone();
        let serve_task = tokio::spawn(async move {
            if let Err(e) = serve(serve_conn, vol, serve_log.clone()).await {
                warn!(serve_log, "NBD server exited: {e}");
            }
        });

        info!(log, "volume exported"; "device" => %device_path.display());
        Ok(Self { device_path, nbd_file, serve_task, kernel_task })
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    /// Detaches from the kernel and stops the server.
    pub fn shutdown(self) {
        let fd = self.nbd_file.as_raw_fd();
        unsafe {
            libc::ioctl(fd, NBD_DISCONNECT, 0);
        }
        let _ = self.kernel_task.join();
        self.serve_task.abort();
    }
}
