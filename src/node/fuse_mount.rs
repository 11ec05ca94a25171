//! Opens `/dev/fuse` and issues the kernel `mount(2)` call establishing a
//! Mountpoint Pod's Source Mount.

use std::os::fd::AsRawFd;
use std::path::Path;

use rustix::fd::OwnedFd;
use rustix::fs::{open, Mode, OFlags};
use rustix::mount::{mount, MountFlags};

use crate::error::DriverError;

/// Options threaded into the kernel fuse mount string. `user_id`/`group_id`
/// are the ids the Mountpoint Pod's FUSE process will run as, not the
/// node's.
#[derive(Debug, Clone)]
pub struct FuseMountOptions {
    pub user_id: u32,
    pub group_id: u32,
    pub allow_other: bool,
    pub read_only: bool,
}

/// Opens `/dev/fuse`, issues `mount(2)` with type `fuse` and source label
/// `mountpoint-s3`, and returns the FUSE file descriptor. The kernel now
/// holds the filesystem open at `target`; the fd is the only way left to
/// service it, and is handed to the Mountpoint Pod in the handshake step.
pub fn mount_fuse(target: &Path, options: &FuseMountOptions) -> Result<OwnedFd, DriverError> {
    let fd = open("/dev/fuse", OFlags::RDWR, Mode::empty()).map_err(|errno| {
        DriverError::FuseMount {
            path: target.to_path_buf(),
            source: std::io::Error::from(errno),
        }
    })?;

    let mut data = format!(
        "fd={},rootmode=40000,user_id={},group_id={}",
        fd.as_raw_fd(),
        options.user_id,
        options.group_id
    );
    if options.allow_other {
        data.push_str(",allow_other");
    }

    let mut flags = MountFlags::NOSUID | MountFlags::NODEV;
    if options.read_only {
        flags |= MountFlags::RDONLY;
    }

    mount("mountpoint-s3", target, "fuse", flags, data.as_str()).map_err(|errno| {
        DriverError::FuseMount {
            path: target.to_path_buf(),
            source: std::io::Error::from(errno),
        }
    })?;

    Ok(fd)
}
