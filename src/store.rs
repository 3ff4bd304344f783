//! On-disk metadata store for VM and snapshot descriptors.
//!
//! Flat directory layout: one JSON file per descriptor. Reads are lockless;
//! writes hold a per-file advisory lock and go through write-to-temp +
//! atomic rename. Enumeration tolerates partial or corrupt files by
//! skipping them with a warning.

use crate::config::StorageLayout;
use crate::error::{Error, Result};
use crate::util::write_json_atomic;
use crate::vm::{SnapshotDescriptor, VmDescriptor};
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Metadata store rooted at the storage layout.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    layout: StorageLayout,
}

impl MetadataStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    fn vm_path(&self, vm_id: &str) -> PathBuf {
        self.layout.metadata_dir().join(format!("{}.json", vm_id))
    }

    fn snapshot_path(&self, snapshot_id: &str) -> PathBuf {
        self.layout.snapshot_dir(snapshot_id).join("descriptor.json")
    }

    /// Persist a VM descriptor.
    pub fn save_vm(&self, descriptor: &VmDescriptor) -> Result<()> {
        locked_write(&self.vm_path(&descriptor.vm_id), descriptor)
    }

    /// Load a VM descriptor by id.
    pub fn load_vm(&self, vm_id: &str) -> Result<VmDescriptor> {
        let path = self.vm_path(vm_id);
        let data = std::fs::read(&path)
            .map_err(|_| Error::NotFound(format!("VM {}", vm_id)))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Remove a VM descriptor. No-op if absent.
    pub fn delete_vm(&self, vm_id: &str) -> Result<()> {
        match std::fs::remove_file(self.vm_path(vm_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate all VM descriptors, skipping unparseable files.
    pub fn list_vms(&self) -> Result<Vec<VmDescriptor>> {
        let mut out = Vec::new();
        let dir = self.layout.metadata_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path).map_err(Error::from).and_then(|data| {
                serde_json::from_slice::<VmDescriptor>(&data).map_err(Error::from)
            }) {
                Ok(descriptor) => out.push(descriptor),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping corrupt VM descriptor");
                }
            }
        }
        Ok(out)
    }

    /// Persist a snapshot descriptor.
    pub fn save_snapshot(&self, descriptor: &SnapshotDescriptor) -> Result<()> {
        let path = self.snapshot_path(&descriptor.snapshot_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        locked_write(&path, descriptor)
    }

    /// Load a snapshot descriptor by id.
    pub fn load_snapshot(&self, snapshot_id: &str) -> Result<SnapshotDescriptor> {
        let path = self.snapshot_path(snapshot_id);
        let data = std::fs::read(&path)
            .map_err(|_| Error::NotFound(format!("snapshot {}", snapshot_id)))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Enumerate all snapshot descriptors, skipping unparseable ones.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotDescriptor>> {
        let mut out = Vec::new();
        let dir = self.layout.snapshots_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join("descriptor.json");
            match std::fs::read(&path).map_err(Error::from).and_then(|data| {
                serde_json::from_slice::<SnapshotDescriptor>(&data).map_err(Error::from)
            }) {
                Ok(descriptor) => out.push(descriptor),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping corrupt snapshot descriptor");
                }
            }
        }
        Ok(out)
    }
}

/// Write a descriptor under a per-file advisory lock.
fn locked_write<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path(path))?;
    let rc = unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let result = write_json_atomic(path, value);

    unsafe {
        libc::flock(lock_file.as_raw_fd(), libc::LOCK_UN);
    }
    result
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{VmResources, VmStatus};

    fn store(tmp: &tempfile::TempDir) -> MetadataStore {
        let layout = StorageLayout::new(tmp.path().join("store"));
        layout.ensure().unwrap();
        MetadataStore::new(layout)
    }

    fn descriptor(vm_id: &str) -> VmDescriptor {
        VmDescriptor::new(
            vm_id.to_string(),
            Some("demo".to_string()),
            PathBuf::from("/images/x.ext4"),
            PathBuf::from("/vmlinux"),
            VmResources::default(),
            512,
        )
    }

    #[test]
    fn test_vm_descriptor_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);

        let mut d = descriptor("vm-1");
        d.status = VmStatus::Running;
        d.vmm_pid = Some(4242);
        store.save_vm(&d).unwrap();

        let loaded = store.load_vm("vm-1").unwrap();
        assert_eq!(loaded.vm_id, "vm-1");
        assert_eq!(loaded.status, VmStatus::Running);
        assert_eq!(loaded.vmm_pid, Some(4242));
        assert_eq!(loaded.name.as_deref(), Some("demo"));
    }

    #[test]
    fn test_load_missing_vm_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        assert!(matches!(store.load_vm("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_delete_vm_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        store.save_vm(&descriptor("vm-1")).unwrap();
        store.delete_vm("vm-1").unwrap();
        store.delete_vm("vm-1").unwrap();
        assert!(store.list_vms().unwrap().is_empty());
    }

    #[test]
    fn test_list_skips_corrupt_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        store.save_vm(&descriptor("vm-1")).unwrap();
        store.save_vm(&descriptor("vm-2")).unwrap();

        // Simulate a torn write.
        std::fs::write(
            tmp.path().join("store/metadata/broken.json"),
            b"{\"vm_id\": \"bro",
        )
        .unwrap();

        let vms = store.list_vms().unwrap();
        assert_eq!(vms.len(), 2);
    }

    #[test]
    fn test_snapshot_descriptor_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);

        let snap = SnapshotDescriptor {
            snapshot_id: "s1".to_string(),
            name: Some("before-build".to_string()),
            source_vm_id: "vm-1".to_string(),
            mem_file_path: PathBuf::from("/snapshots/s1/mem"),
            state_file_path: PathBuf::from("/snapshots/s1/state"),
            rootfs_copy_path: PathBuf::from("/snapshots/s1/rootfs.ext4"),
            kernel_path: PathBuf::from("/vmlinux"),
            vsock_config: None,
            network_config: None,
            resources: VmResources::default(),
            created_at: crate::util::current_timestamp(),
        };
        store.save_snapshot(&snap).unwrap();

        let loaded = store.load_snapshot("s1").unwrap();
        assert_eq!(loaded.source_vm_id, "vm-1");
        assert_eq!(loaded.name.as_deref(), Some("before-build"));
        assert_eq!(store.list_snapshots().unwrap().len(), 1);
    }
}
