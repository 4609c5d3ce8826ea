//! Free-space queries for the filesystem backing a download destination.

use std::path::{Path, PathBuf};
use sysinfo::Disks;

/// Which storage root a destination belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Internal,
    External,
}

impl Storage {
    pub fn resolve(path: &Path, internal_root: Option<&Path>) -> Self {
        match internal_root {
            Some(root) if path.starts_with(root) => Storage::Internal,
            _ => Storage::External,
        }
    }
}

pub trait SpaceChecker: Send + Sync {
    /// Bytes available to the destination at `path`, or `None` if the
    /// backing volume cannot be determined.
    fn available_bytes(&self, storage: Storage, path: &Path) -> Option<u64>;
}

/// [`SpaceChecker`] backed by the system disk list.
#[derive(Debug, Clone, Default)]
pub struct DiskSpace {
    internal_root: Option<PathBuf>,
}

impl DiskSpace {
    pub fn new(internal_root: Option<PathBuf>) -> Self {
        Self { internal_root }
    }
}

impl SpaceChecker for DiskSpace {
    fn available_bytes(&self, storage: Storage, path: &Path) -> Option<u64> {
        let target = match (storage, &self.internal_root) {
            (Storage::Internal, Some(root)) => root.as_path(),
            _ => path,
        };
        available_disk_space(target)
    }
}

fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}

fn available_disk_space(path: &Path) -> Option<u64> {
    let target = nearest_existing_path(path);
    let target = std::fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
