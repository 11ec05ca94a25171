//! Step 6 of the Node Mount Engine: bind-mounting a Source Mount onto a
//! workload's Target Mount, and the target-only unmount for unpublish.

use std::path::Path;

use rustix::mount::{mount_bind, unmount, UnmountFlags};

use crate::error::DriverError;

pub fn bind(source: &Path, target: &Path) -> Result<(), DriverError> {
    mount_bind(source, target).map_err(|errno| DriverError::BindMount {
        source_path: source.to_path_buf(),
        target_path: target.to_path_buf(),
        source: std::io::Error::from(errno),
    })
}

/// Unmounts only the target bind mount; the source mount is left for the
/// reconciler/kernel to reclaim once the Mountpoint Pod itself is deleted.
pub fn unbind(target: &Path) -> Result<(), DriverError> {
    unmount(target, UnmountFlags::empty()).map_err(|errno| DriverError::BindMount {
        source_path: target.to_path_buf(),
        target_path: target.to_path_buf(),
        source: std::io::Error::from(errno),
    })
}
