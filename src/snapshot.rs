//! Snapshot creation and restore.
//!
//! Create: pause is a precondition, the vsock listener is closed so the
//! VMM can quiesce its backend, memory and device state are persisted,
//! the rootfs is copied, a descriptor is written, and the listener
//! reopens before return so `resume` is safe.
//!
//! Restore: a brand-new VM is built around the snapshot. The restored
//! guest memory still references the original CID, port and UDS path, so
//! the new VMM runs in a private mount namespace where a per-VM
//! directory shadows the original socket directory; the original path
//! name then resolves to a distinct inode per restore, and two
//! concurrent restores of one snapshot cannot collide.

use crate::config::VSOCK_RUNTIME_DIR;
use crate::error::{Error, Result};
use crate::util::current_timestamp;
use crate::vm::controller::VmDeps;
use crate::vm::{SnapshotDescriptor, VmController, VmDescriptor, VmStatus, VsockConfig};
use crate::vmm::SnapshotType;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Snapshot/restore operations over the shared VM dependencies.
pub struct SnapshotEngine {
    deps: Arc<VmDeps>,
}

impl SnapshotEngine {
    pub fn new(deps: Arc<VmDeps>) -> Self {
        Self { deps }
    }

    /// Persist a paused VM into a new snapshot.
    pub fn create(&self, vm: &VmController, name: Option<String>) -> Result<SnapshotDescriptor> {
        let _transition = vm.transition_guard();

        let descriptor = vm.descriptor();
        if descriptor.status != VmStatus::Paused {
            return Err(Error::state_conflict("paused", descriptor.status));
        }

        let snapshot_id = uuid::Uuid::new_v4().to_string();
        let snapshot_dir = self.deps.layout.snapshot_dir(&snapshot_id);
        std::fs::create_dir_all(&snapshot_dir)?;

        let mem_file = snapshot_dir.join("mem");
        let state_file = snapshot_dir.join("state");
        let rootfs_copy = snapshot_dir.join("rootfs.ext4");

        tracing::info!(vm = %vm.vm_id(), snapshot = %snapshot_id, "creating snapshot");

        // The VMM needs its vsock backend quiesced while it serializes
        // device state.
        vm.suspend_listener();

        let result = (|| -> Result<()> {
            vm.vmm_client()
                .snapshot_create(SnapshotType::Full, &mem_file, &state_file)?;
            std::fs::copy(&descriptor.rootfs_path, &rootfs_copy)?;
            Ok(())
        })();

        // Reopen before returning either way, so `resume` stays safe.
        if let Err(e) = vm.reopen_listener() {
            tracing::warn!(vm = %vm.vm_id(), error = %e, "failed to reopen vsock listener");
        }

        if let Err(e) = result {
            let _ = std::fs::remove_dir_all(&snapshot_dir);
            return Err(e);
        }

        let snapshot = SnapshotDescriptor {
            snapshot_id: snapshot_id.clone(),
            name,
            source_vm_id: descriptor.vm_id.clone(),
            mem_file_path: mem_file,
            state_file_path: state_file,
            rootfs_copy_path: rootfs_copy,
            kernel_path: descriptor.kernel_path.clone(),
            vsock_config: descriptor.vsock.as_ref().map(normalize_vsock),
            network_config: descriptor.network.clone(),
            resources: descriptor.resources(),
            created_at: current_timestamp(),
        };
        self.deps.store.save_snapshot(&snapshot)?;

        tracing::info!(snapshot = %snapshot_id, "snapshot created");
        Ok(snapshot)
    }

    /// Reconstitute a snapshot as a brand-new VM.
    pub fn restore(&self, snapshot_id: &str, networking: bool) -> Result<Arc<VmController>> {
        let snapshot = self.deps.store.load_snapshot(snapshot_id)?;
        let vm_id = uuid::Uuid::new_v4().to_string();

        tracing::info!(snapshot = %snapshot_id, vm = %vm_id, "restoring snapshot");

        // The restored VM gets its own rootfs copy; the snapshot itself
        // is never mutated.
        let rootfs = self.deps.layout.instance_rootfs(&vm_id);
        std::fs::copy(&snapshot.rootfs_copy_path, &rootfs)?;

        // Fresh CID/port keep the uniqueness invariant among live VMs;
        // the guest keeps dialing its original port, which the isolated
        // listener serves.
        let vsock = match &snapshot.vsock_config {
            Some(source) => {
                let cid = match self.deps.cids.acquire() {
                    Ok(cid) => cid,
                    Err(e) => {
                        let _ = std::fs::remove_file(&rootfs);
                        return Err(e);
                    }
                };
                let port = match self.deps.ports.acquire() {
                    Ok(port) => port,
                    Err(e) => {
                        let _ = self.deps.cids.release(cid);
                        let _ = std::fs::remove_file(&rootfs);
                        return Err(e);
                    }
                };
                Some(self.isolated_vsock(&vm_id, source, cid, port)?)
            }
            None => None,
        };

        // Restored guest memory carries its original IP configuration, so
        // networking is best-effort: a provisioning clash must not sink
        // the restore.
        let network = if networking {
            match self.deps.network.provision(&vm_id) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!(vm = %vm_id, error = %e, "restore continues without networking");
                    None
                }
            }
        } else {
            None
        };

        let mut descriptor = VmDescriptor::new(
            vm_id.clone(),
            Some(format!("from-{}", snapshot_id)),
            rootfs,
            snapshot.kernel_path.clone(),
            snapshot.resources,
            0,
        );
        descriptor.vsock = vsock;
        descriptor.network = network;
        descriptor.source_snapshot_id = Some(snapshot_id.to_string());
        self.deps.store.save_vm(&descriptor)?;

        let controller = Arc::new(VmController::new(descriptor, self.deps.clone()));
        controller.boot_from_snapshot(&snapshot)?;
        Ok(controller)
    }

    /// Build the restore vsock config: isolation directory created, stale
    /// sockets gone, UDS base pointing at the per-VM shadow of the
    /// original path.
    fn isolated_vsock(
        &self,
        vm_id: &str,
        source: &VsockConfig,
        cid: u32,
        port: u16,
    ) -> Result<VsockConfig> {
        let isolation_dir = self.deps.config.vsock_isolation_dir.join(vm_id);
        std::fs::create_dir_all(&isolation_dir)?;

        let base_name = source
            .uds_path
            .file_name()
            .ok_or_else(|| Error::Internal("snapshot vsock path has no file name".into()))?;
        let isolated_base = isolation_dir.join(base_name);

        // Remove any stale socket at the shadowed path.
        for stale in [
            isolated_base.clone(),
            crate::vm::listener_path_for(&isolated_base, source.guest_port),
        ] {
            match std::fs::remove_file(&stale) {
                Ok(()) => tracing::debug!(path = %stale.display(), "removed stale socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(VsockConfig {
            cid,
            port,
            guest_port: source.guest_port,
            uds_path: isolated_base,
        })
    }

    /// Remove a snapshot's files. Never touches VMs restored from it.
    pub fn delete(&self, snapshot_id: &str) -> Result<()> {
        // Existence check first, for a precise error.
        self.deps.store.load_snapshot(snapshot_id)?;
        let dir = self.deps.layout.snapshot_dir(snapshot_id);
        std::fs::remove_dir_all(&dir)?;
        tracing::info!(snapshot = %snapshot_id, "snapshot deleted");
        Ok(())
    }
}

/// Map a possibly-isolated UDS base back to its original-namespace name.
///
/// The VMM's saved state always references the path configured at the
/// first boot (`/tmp/bandsox/<base>`); a VM that is itself a restore sees
/// that name through its private bind mount, so the basename is stable
/// across generations of snapshots.
fn normalize_vsock(vsock: &VsockConfig) -> VsockConfig {
    let base_name = vsock
        .uds_path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| vsock.uds_path.clone());
    VsockConfig {
        cid: vsock.cid,
        port: vsock.port,
        guest_port: vsock.guest_port,
        uds_path: Path::new(VSOCK_RUNTIME_DIR).join(base_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{CidAllocator, PortAllocator};
    use crate::config::{BandsoxConfig, StorageLayout};
    use crate::network::NoNetwork;
    use crate::store::MetadataStore;

    fn engine(tmp: &tempfile::TempDir) -> SnapshotEngine {
        let root = tmp.path().join("store");
        let layout = StorageLayout::new(&root);
        layout.ensure().unwrap();
        let config = BandsoxConfig {
            storage_root: root,
            kernel_path: tmp.path().join("vmlinux"),
            firecracker_bin: PathBuf::from("/nonexistent/firecracker"),
            vsock_isolation_dir: tmp.path().join("bsx"),
        };
        SnapshotEngine::new(Arc::new(VmDeps {
            layout: layout.clone(),
            store: MetadataStore::new(layout),
            cids: CidAllocator::new(config.storage_root.join("cid_allocator.json")),
            ports: PortAllocator::new(config.storage_root.join("port_allocator.json")),
            network: Arc::new(NoNetwork),
            config,
        }))
    }

    #[test]
    fn test_isolated_vsock_paths_are_distinct_per_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(&tmp);

        let source = VsockConfig {
            cid: 3,
            port: 9000,
            guest_port: 9000,
            uds_path: PathBuf::from("/tmp/bandsox/vsock_vm-a.sock"),
        };

        // Two restores of the same snapshot: same guest port, distinct
        // isolation directories and socket paths.
        let a = engine.isolated_vsock("vm-b", &source, 4, 9001).unwrap();
        let b = engine.isolated_vsock("vm-c", &source, 5, 9002).unwrap();

        assert_ne!(a.uds_path, b.uds_path);
        assert_eq!(a.guest_port, 9000);
        assert_eq!(b.guest_port, 9000);
        assert!(a.uds_path.parent().unwrap().is_dir());
        assert!(b.uds_path.parent().unwrap().is_dir());
        assert_eq!(
            a.uds_path.file_name(),
            source.uds_path.file_name(),
            "the path name the saved VMM state references must be kept"
        );
    }

    #[test]
    fn test_restore_of_missing_snapshot_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(&tmp);
        assert!(matches!(
            engine.restore("no-such-snapshot", false),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_normalize_vsock_restores_runtime_dir() {
        let isolated = VsockConfig {
            cid: 7,
            port: 9004,
            guest_port: 9001,
            uds_path: PathBuf::from("/tmp/bsx/vm-b/vsock_vm-a.sock"),
        };
        let normalized = normalize_vsock(&isolated);
        assert_eq!(
            normalized.uds_path,
            PathBuf::from("/tmp/bandsox/vsock_vm-a.sock")
        );
        assert_eq!(normalized.guest_port, 9001);
    }

    #[test]
    fn test_normalize_vsock_is_identity_for_first_generation() {
        let original = VsockConfig {
            cid: 3,
            port: 9000,
            guest_port: 9000,
            uds_path: PathBuf::from("/tmp/bandsox/vsock_vm-a.sock"),
        };
        assert_eq!(normalize_vsock(&original), original);
    }
}
