//! Small shared helpers that don't belong to any one component.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// True if `path` is itself a mount point, detected by comparing device
/// ids with its parent -- the same technique `stat`/`findmnt` use, cheaper
/// than parsing `/proc/self/mountinfo` for a single path.
pub fn is_mount_point(path: &Path) -> std::io::Result<bool> {
    let Some(parent) = path.parent() else {
        return Ok(false);
    };
    let path_dev = std::fs::metadata(path)?.dev();
    let parent_dev = std::fs::metadata(parent)?.dev();
    Ok(path_dev != parent_dev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn plain_subdirectory_is_not_a_mount_point() {
        let root = tempdir().unwrap();
        let child = root.path().join("child");
        std::fs::create_dir(&child).unwrap();
        assert!(!is_mount_point(&child).unwrap());
    }

    #[test]
    fn root_of_filesystem_has_no_parent_and_is_not_flagged() {
        assert!(!is_mount_point(Path::new("/")).unwrap());
    }
}
