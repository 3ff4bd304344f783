//! VM descriptors and lifecycle state.

pub mod controller;

pub use controller::{VmController, VmDeps};

use crate::network::NetworkConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// VM lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Descriptor exists, VMM not started.
    #[default]
    Created,
    /// VMM spawned, configuration in progress.
    Booting,
    /// Guest is executing.
    Running,
    /// Guest vCPUs are paused.
    Paused,
    /// VMM exited or was stopped.
    Stopped,
    /// An operation failed and could not be recovered.
    Failed,
    /// Resources released; descriptor about to disappear.
    Deleted,
}

impl VmStatus {
    /// Live states hold allocator entries and (normally) a VMM process.
    pub fn is_live(self) -> bool {
        matches!(self, VmStatus::Booting | VmStatus::Running | VmStatus::Paused)
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmStatus::Created => "created",
            VmStatus::Booting => "booting",
            VmStatus::Running => "running",
            VmStatus::Paused => "paused",
            VmStatus::Stopped => "stopped",
            VmStatus::Failed => "failed",
            VmStatus::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

/// Resource shape, immutable after create.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmResources {
    /// Number of vCPUs.
    pub vcpu: u8,
    /// Memory in MiB.
    pub mem_mib: u32,
}

impl Default for VmResources {
    fn default() -> Self {
        Self {
            vcpu: 1,
            mem_mib: 128,
        }
    }
}

/// Vsock channel bookkeeping for one VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VsockConfig {
    /// Allocator-owned guest CID.
    pub cid: u32,
    /// Allocator-owned control port.
    pub port: u16,
    /// Port the guest actually dials. Equals `port`, except for restored
    /// VMs, whose in-memory agent still targets the snapshot's port.
    #[serde(default)]
    pub guest_port: u16,
    /// Host-side UDS base path; per-port listeners are `"{base}_{port}"`.
    pub uds_path: PathBuf,
}

impl VsockConfig {
    /// The UDS path the control-port listener binds.
    pub fn listener_path(&self) -> PathBuf {
        listener_path_for(&self.uds_path, self.guest_port)
    }
}

/// Firecracker routes guest connections to port N to `"{base}_{N}"`.
pub fn listener_path_for(base: &std::path::Path, port: u16) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!("_{}", port));
    PathBuf::from(name)
}

/// Persisted per-VM descriptor (`metadata/<vm_id>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDescriptor {
    /// Opaque unique identifier (UUID).
    pub vm_id: String,

    /// Optional human label, unique among live VMs.
    #[serde(default)]
    pub name: Option<String>,

    /// Absolute path to this VM's ext4 rootfs.
    pub rootfs_path: PathBuf,

    /// Absolute path to the kernel blob.
    pub kernel_path: PathBuf,

    /// Number of vCPUs.
    pub vcpu: u8,

    /// Memory in MiB.
    pub mem_mib: u32,

    /// Rootfs size hint in MiB.
    #[serde(default)]
    pub disk_size_mib: u64,

    /// TAP/NAT configuration, if networking is enabled.
    #[serde(default)]
    pub network: Option<NetworkConfig>,

    /// Vsock channel, assigned at boot.
    #[serde(default)]
    pub vsock: Option<VsockConfig>,

    /// Lifecycle state.
    #[serde(default)]
    pub status: VmStatus,

    /// Process id of the live VMM, if any.
    #[serde(default)]
    pub vmm_pid: Option<i32>,

    /// Snapshot this VM was restored from, if any.
    #[serde(default)]
    pub source_snapshot_id: Option<String>,

    /// Creation timestamp (seconds since epoch).
    pub created_at: String,

    /// Last update timestamp (seconds since epoch).
    #[serde(default)]
    pub updated_at: String,
}

impl VmDescriptor {
    /// Fresh descriptor in the `Created` state.
    pub fn new(
        vm_id: String,
        name: Option<String>,
        rootfs_path: PathBuf,
        kernel_path: PathBuf,
        resources: VmResources,
        disk_size_mib: u64,
    ) -> Self {
        let now = crate::util::current_timestamp();
        Self {
            vm_id,
            name,
            rootfs_path,
            kernel_path,
            vcpu: resources.vcpu,
            mem_mib: resources.mem_mib,
            disk_size_mib,
            network: None,
            vsock: None,
            status: VmStatus::Created,
            vmm_pid: None,
            source_snapshot_id: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn resources(&self) -> VmResources {
        VmResources {
            vcpu: self.vcpu,
            mem_mib: self.mem_mib,
        }
    }

    /// Touch the update timestamp.
    pub fn touch(&mut self) {
        self.updated_at = crate::util::current_timestamp();
    }
}

/// Persisted per-snapshot descriptor (`snapshots/<id>/descriptor.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub snapshot_id: String,

    #[serde(default)]
    pub name: Option<String>,

    pub source_vm_id: String,

    pub mem_file_path: PathBuf,
    pub state_file_path: PathBuf,
    pub rootfs_copy_path: PathBuf,
    pub kernel_path: PathBuf,

    /// Vsock channel of the source VM as of snapshot time.
    #[serde(default)]
    pub vsock_config: Option<VsockConfig>,

    /// Network shape of the source VM as of snapshot time.
    #[serde(default)]
    pub network_config: Option<NetworkConfig>,

    pub resources: VmResources,

    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&VmStatus::Running).unwrap(),
            "\"running\""
        );
        let s: VmStatus = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(s, VmStatus::Paused);
    }

    #[test]
    fn test_live_states() {
        assert!(VmStatus::Running.is_live());
        assert!(VmStatus::Paused.is_live());
        assert!(VmStatus::Booting.is_live());
        assert!(!VmStatus::Created.is_live());
        assert!(!VmStatus::Stopped.is_live());
        assert!(!VmStatus::Failed.is_live());
    }

    #[test]
    fn test_listener_path_suffix() {
        let cfg = VsockConfig {
            cid: 3,
            port: 9000,
            guest_port: 9000,
            uds_path: PathBuf::from("/tmp/bandsox/vsock_vm1.sock"),
        };
        assert_eq!(
            cfg.listener_path(),
            PathBuf::from("/tmp/bandsox/vsock_vm1.sock_9000")
        );
    }

    #[test]
    fn test_descriptor_tolerates_missing_optionals() {
        // Old descriptors may lack newer optional fields.
        let json = r#"{
            "vm_id": "abc",
            "rootfs_path": "/var/lib/bandsox/images/abc.ext4",
            "kernel_path": "/var/lib/bandsox/vmlinux",
            "vcpu": 1,
            "mem_mib": 128,
            "created_at": "1700000000"
        }"#;
        let d: VmDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.status, VmStatus::Created);
        assert!(d.name.is_none());
        assert!(d.vsock.is_none());
        assert!(d.network.is_none());
        assert!(d.vmm_pid.is_none());
    }
}
