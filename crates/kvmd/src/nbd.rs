//! Userspace NBD server: binds a backend to `/dev/nbd0` so the host PC sees
//! it as a block device through the USB mass-storage gadget. The kernel
//! drives the block device's read/write traffic over one end of a
//! `socketpair`; we hold the other end and answer requests from whichever
//! `DiskBackend` is currently mounted.

use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::io::FromRawFd;

use anyhow::{Context, Result};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::disk_backend::DiskBackend;

const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
const NBD_REPLY_MAGIC: u32 = 0x6744_6698;
const NBD_CMD_READ: u32 = 0;
const NBD_CMD_WRITE: u32 = 1;
const NBD_CMD_DISC: u32 = 2;

nix::ioctl_none!(nbd_clear_sock, 0xab, 4);
nix::ioctl_write_int!(nbd_set_sock, 0xab, 0);
nix::ioctl_write_int!(nbd_set_blksize, 0xab, 1);
nix::ioctl_write_int!(nbd_set_size, 0xab, 2);
nix::ioctl_none!(nbd_do_it, 0xab, 3);
nix::ioctl_none!(nbd_clear_que, 0xab, 5);
nix::ioctl_write_int!(nbd_disconnect, 0xab, 8);
nix::ioctl_write_int!(nbd_set_timeout, 0xab, 9);

const BLOCK_SIZE: i32 = 512;

struct NbdRequestHeader {
    magic: u32,
    request_type: u32,
    handle: [u8; 8],
    from: u64,
    len: u32,
}

impl NbdRequestHeader {
    const WIRE_SIZE: usize = 28;

    fn parse(buf: &[u8]) -> Result<Self> {
        anyhow::ensure!(buf.len() == Self::WIRE_SIZE, "short NBD request header");
        Ok(Self {
            magic: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            request_type: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            handle: buf[8..16].try_into().unwrap(),
            from: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            len: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
        })
    }
}

fn encode_reply(handle: [u8; 8], error: u32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..4].copy_from_slice(&NBD_REPLY_MAGIC.to_be_bytes());
    buf[4..8].copy_from_slice(&error.to_be_bytes());
    buf[8..16].copy_from_slice(&handle);
    buf
}

/// Owns the kernel-facing half of the NBD device for as long as media is
/// mounted. Dropping/calling `disconnect` tears the binding down.
pub struct NbdDevice {
    device_path: String,
    device_fd: RawFd,
    serve_task: Option<tokio::task::JoinHandle<()>>,
    ioctl_task: Option<tokio::task::JoinHandle<()>>,
}

impl NbdDevice {
    /// Bind `backend` to `device_path` (e.g. `/dev/nbd0`) and start serving
    /// requests. Blocks until the kernel has accepted the socket and size.
    pub async fn mount(device_path: &str, backend: std::sync::Arc<dyn DiskBackend>) -> Result<Self> {
        let (kernel_fd, our_fd) =
            socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
                .context("failed to create socketpair for NBD device")?;

        let device_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .with_context(|| format!("failed to open {device_path}"))?;
        let device_fd = device_file.as_raw_fd();
        std::mem::forget(device_file); // kept alive for the ioctl thread's lifetime

        unsafe {
            nbd_set_blksize(device_fd, BLOCK_SIZE as i32).context("NBD_SET_BLKSIZE failed")?;
            let blocks = (backend.size() / BLOCK_SIZE as u64) as i32;
            nbd_set_size(device_fd, blocks * BLOCK_SIZE)
                .or_else(|_| nbd_set_size(device_fd, backend.size() as i32))
                .context("NBD_SET_SIZE failed")?;
            nbd_set_timeout(device_fd, 30).context("NBD_SET_TIMEOUT failed")?;
            nbd_set_sock(device_fd, kernel_fd.as_raw_fd()).context("NBD_SET_SOCK failed")?;
        }

        // NBD_DO_IT blocks the calling thread until the device disconnects,
        // so it runs on a dedicated blocking thread rather than the async
        // runtime.
        let ioctl_task = tokio::task::spawn_blocking(move || {
            let _ = unsafe { nbd_do_it(device_fd) };
            let _ = unsafe { nbd_clear_que(device_fd) };
            let _ = unsafe { nbd_clear_sock(device_fd) };
        });

        let our_stream = UnixStream::from_std(unsafe {
            std::os::unix::net::UnixStream::from_raw_fd(our_fd.as_raw_fd())
        })
        .context("failed to adopt NBD socket half")?;
        std::mem::forget(our_fd);

        let serve_task = tokio::spawn(serve_requests(our_stream, backend));

        Ok(Self {
            device_path: device_path.to_string(),
            device_fd,
            serve_task: Some(serve_task),
            ioctl_task: Some(ioctl_task),
        })
    }

    pub async fn disconnect(mut self) -> Result<()> {
        unsafe {
            let _ = nbd_disconnect(self.device_fd, 0);
        }
        if let Some(task) = self.serve_task.take() {
            task.abort();
        }
        if let Some(task) = self.ioctl_task.take() {
            let _ = task.await;
        }
        tracing::info!(device = %self.device_path, "NBD device disconnected");
        Ok(())
    }
}

async fn serve_requests(mut stream: UnixStream, backend: std::sync::Arc<dyn DiskBackend>) {
    let mut header_buf = [0u8; NbdRequestHeader::WIRE_SIZE];
    loop {
        if let Err(e) = stream.read_exact(&mut header_buf).await {
            tracing::debug!(error = %e, "NBD request socket closed");
            return;
        }

        let header = match NbdRequestHeader::parse(&header_buf) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed NBD request header");
                return;
            }
        };
        if header.magic != NBD_REQUEST_MAGIC {
            tracing::warn!("Bad NBD request magic, closing");
            return;
        }

        match header.request_type {
            NBD_CMD_READ => {
                match backend.read_at(header.from, header.len).await {
                    Ok(data) => {
                        let reply = encode_reply(header.handle, 0);
                        if stream.write_all(&reply).await.is_err() || stream.write_all(&data).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Backend read failed");
                        let reply = encode_reply(header.handle, 5); // EIO
                        if stream.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
            NBD_CMD_WRITE => {
                // Virtual media mounted through this engine is read-only
                // from the host's perspective; drain the payload so the
                // wire stays in sync, then answer EROFS (30).
                let mut drain = vec![0u8; header.len as usize];
                if stream.read_exact(&mut drain).await.is_err() {
                    return;
                }
                let reply = encode_reply(header.handle, 30);
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
            NBD_CMD_DISC => return,
            other => {
                tracing::warn!(request_type = other, "Unsupported NBD command");
                let reply = encode_reply(header.handle, 38); // ENOSYS
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_parses_fixed_wire_layout() {
        let mut buf = [0u8; NbdRequestHeader::WIRE_SIZE];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&NBD_CMD_READ.to_be_bytes());
        buf[8..16].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        buf[16..24].copy_from_slice(&4096u64.to_be_bytes());
        buf[24..28].copy_from_slice(&512u32.to_be_bytes());

        let header = NbdRequestHeader::parse(&buf).unwrap();
        assert_eq!(header.magic, NBD_REQUEST_MAGIC);
        assert_eq!(header.request_type, NBD_CMD_READ);
        assert_eq!(header.from, 4096);
        assert_eq!(header.len, 512);
    }

    #[test]
    fn reply_encodes_magic_and_handle() {
        let handle = [9u8; 8];
        let reply = encode_reply(handle, 0);
        assert_eq!(&reply[0..4], &NBD_REPLY_MAGIC.to_be_bytes());
        assert_eq!(&reply[8..16], &handle);
    }
}
