//! MEI character-device transport (Linux / Android).
//!
//! The co-processor exposes one device node; a logical client is selected
//! with the `IOCTL_MEI_CONNECT_CLIENT` ioctl, which answers with the largest
//! message the client accepts. After that every `write` is one message and
//! every `read` returns one message.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::{info, warn};
use uuid::Uuid;

use crate::rpc::transport::Transport;

/// Default device node.
pub const DEFAULT_DEVICE: &str = "/dev/mei0";

/// `_IOWR('H', 0x01, struct mei_connect_client_data)`.
const IOCTL_MEI_CONNECT_CLIENT: libc::c_ulong = 0xC010_4801;

#[repr(C)]
#[derive(Clone, Copy)]
struct MeiClient {
    max_msg_length: u32,
    protocol_version: u8,
    reserved: [u8; 3],
}

#[repr(C)]
union MeiConnectData {
    in_client_uuid: [u8; 16],
    out_client_properties: MeiClient,
}

pub struct MeiDevice {
    path: PathBuf,
    file: Option<File>,
}

impl MeiDevice {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "MEI client not connected"))
    }
}

impl Transport for MeiDevice {
    type Error = io::Error;

    fn connect(&mut self, client: &Uuid) -> io::Result<usize> {
        self.disconnect();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&self.path)?;

        let mut data = MeiConnectData {
            in_client_uuid: client.to_bytes_le(),
        };
        // SAFETY: `data` is a live, properly sized `mei_connect_client_data`
        // for the duration of the call, and the fd is owned by `file`.
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                IOCTL_MEI_CONNECT_CLIENT as _,
                std::ptr::addr_of_mut!(data),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            warn!("MEI: connect to {} on {} failed: {}", client, self.path.display(), err);
            return Err(err);
        }
        // SAFETY: on success the kernel has overwritten the union with the
        // client properties.
        let props = unsafe { data.out_client_properties };
        info!(
            "MEI: connected to {} (max message {} B, protocol {})",
            client, props.max_msg_length, props.protocol_version
        );
        self.file = Some(file);
        Ok(props.max_msg_length as usize)
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file()?.write(data)
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buf)
    }

    fn available(&self) -> bool {
        let Some(file) = &self.file else {
            return false;
        };
        let mut pfd = libc::pollfd {
            fd: file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd, zero timeout.
        let rc = unsafe { libc::poll(&raw mut pfd, 1, 0) };
        rc > 0 && (pfd.revents & libc::POLLIN) != 0
    }

    fn disconnect(&mut self) {
        if self.file.take().is_some() {
            info!("MEI: disconnected from {}", self.path.display());
        }
    }
}
