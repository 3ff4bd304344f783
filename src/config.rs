//! Runtime configuration and on-disk layout.
//!
//! Configuration is resolved from environment variables with compiled
//! defaults; there is no config file. [`StorageLayout`] owns the directory
//! scheme under the storage root:
//!
//! ```text
//! images/               ext4 rootfs files, one per VM or per image
//! snapshots/<id>/       {mem, state, rootfs.ext4, descriptor.json}
//! sockets/<vm_id>.sock  VMM API socket
//! metadata/<vm_id>.json VmDescriptor
//! cid_allocator.json
//! port_allocator.json
//! ```

use crate::error::Result;
use std::path::{Path, PathBuf};

/// Default storage root. Override with `BANDSOX_STORAGE`.
pub const DEFAULT_STORAGE_ROOT: &str = "/var/lib/bandsox";

/// Default guest kernel path. Override with `BANDSOX_KERNEL`.
pub const DEFAULT_KERNEL_PATH: &str = "/var/lib/bandsox/vmlinux";

/// Default firecracker binary. Override with `BANDSOX_FIRECRACKER`.
pub const DEFAULT_FIRECRACKER_BIN: &str = "/usr/bin/firecracker";

/// Kernel command line shared by all VMs.
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Directory holding per-VM vsock UDS endpoints in the default namespace.
pub const VSOCK_RUNTIME_DIR: &str = "/tmp/bandsox";

/// Default root for per-restore vsock isolation directories.
/// Override with `BANDSOX_VSOCK_ISOLATION_DIR`.
pub const DEFAULT_VSOCK_ISOLATION_DIR: &str = "/tmp/bsx";

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct BandsoxConfig {
    /// Storage root directory.
    pub storage_root: PathBuf,
    /// Guest kernel image.
    pub kernel_path: PathBuf,
    /// Firecracker binary.
    pub firecracker_bin: PathBuf,
    /// Root for per-restore mount-namespace isolation directories.
    pub vsock_isolation_dir: PathBuf,
}

impl Default for BandsoxConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl BandsoxConfig {
    /// Resolve configuration from the environment.
    pub fn from_env() -> Self {
        let env_path = |var: &str, default: &str| {
            std::env::var_os(var)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };

        Self {
            storage_root: env_path("BANDSOX_STORAGE", DEFAULT_STORAGE_ROOT),
            kernel_path: env_path("BANDSOX_KERNEL", DEFAULT_KERNEL_PATH),
            firecracker_bin: env_path("BANDSOX_FIRECRACKER", DEFAULT_FIRECRACKER_BIN),
            vsock_isolation_dir: env_path(
                "BANDSOX_VSOCK_ISOLATION_DIR",
                DEFAULT_VSOCK_ISOLATION_DIR,
            ),
        }
    }

    /// Layout rooted at this configuration's storage root.
    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.storage_root)
    }
}

/// The directory scheme under the storage root.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create every directory the layout needs.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.images_dir(),
            self.snapshots_dir(),
            self.sockets_dir(),
            self.metadata_dir(),
            PathBuf::from(VSOCK_RUNTIME_DIR),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn snapshot_dir(&self, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir().join(snapshot_id)
    }

    pub fn sockets_dir(&self) -> PathBuf {
        self.root.join("sockets")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    /// The VMM API socket for a VM.
    pub fn vmm_socket(&self, vm_id: &str) -> PathBuf {
        self.sockets_dir().join(format!("{}.sock", vm_id))
    }

    /// Per-VM instance rootfs path.
    pub fn instance_rootfs(&self, vm_id: &str) -> PathBuf {
        self.images_dir().join(format!("{}.ext4", vm_id))
    }

    pub fn cid_allocator_file(&self) -> PathBuf {
        self.root.join("cid_allocator.json")
    }

    pub fn port_allocator_file(&self) -> PathBuf {
        self.root.join("port_allocator.json")
    }
}

/// Vsock UDS base path for a VM in the default namespace.
///
/// Firecracker-style per-port listener sockets live at `"{base}_{port}"`.
pub fn vsock_base_path(vm_id: &str) -> PathBuf {
    PathBuf::from(VSOCK_RUNTIME_DIR).join(format!("vsock_{}.sock", vm_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = StorageLayout::new("/var/lib/bandsox");
        assert_eq!(
            layout.vmm_socket("abc"),
            PathBuf::from("/var/lib/bandsox/sockets/abc.sock")
        );
        assert_eq!(
            layout.instance_rootfs("abc"),
            PathBuf::from("/var/lib/bandsox/images/abc.ext4")
        );
        assert_eq!(
            layout.snapshot_dir("s1"),
            PathBuf::from("/var/lib/bandsox/snapshots/s1")
        );
        assert_eq!(
            layout.cid_allocator_file(),
            PathBuf::from("/var/lib/bandsox/cid_allocator.json")
        );
    }

    #[test]
    fn test_vsock_base_path() {
        assert_eq!(
            vsock_base_path("vm-1"),
            PathBuf::from("/tmp/bandsox/vsock_vm-1.sock")
        );
    }

    #[test]
    fn test_layout_ensure_creates_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(tmp.path().join("store"));
        layout.ensure().unwrap();
        assert!(layout.images_dir().is_dir());
        assert!(layout.snapshots_dir().is_dir());
        assert!(layout.sockets_dir().is_dir());
        assert!(layout.metadata_dir().is_dir());
    }
}
