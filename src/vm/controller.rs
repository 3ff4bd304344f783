//! Per-VM state machine.
//!
//! One controller owns one VMM process, its networking, its vsock
//! listener, its serial bridge, and the single-writer right to the VM's
//! descriptor. State-changing transitions serialize through a per-VM
//! mutex; operations on distinct VMs proceed in parallel.
//!
//! Lifecycle: `Created → Booting → Running ↔ Paused → Stopped → Deleted`,
//! with `Failed` reachable from any state when an operation cannot be
//! recovered.

use crate::agent::{AgentSession, SerialTransport, VsockTransport, REGISTRATION_GRACE};
use crate::alloc::{CidAllocator, PortAllocator};
use crate::config::{BandsoxConfig, StorageLayout, DEFAULT_BOOT_ARGS, VSOCK_RUNTIME_DIR};
use crate::error::{Error, Result};
use crate::network::{NetworkConfig, NetworkProvisioner};
use crate::process::{VmmProcess, STOP_GRACE};
use crate::serial::SerialBridge;
use crate::store::MetadataStore;
use crate::vm::{SnapshotDescriptor, VmDescriptor, VmStatus, VsockConfig};
use crate::vmm::VmmClient;
use crate::vsock::{VsockListener, GUEST_CONTROL_PORT};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long the VMM gets to open its API socket after spawn.
const API_SOCKET_TIMEOUT: Duration = Duration::from_secs(3);

/// Shared dependencies threaded through every controller.
pub struct VmDeps {
    pub config: BandsoxConfig,
    pub layout: StorageLayout,
    pub store: MetadataStore,
    pub cids: CidAllocator,
    pub ports: PortAllocator,
    pub network: Arc<dyn NetworkProvisioner>,
}

/// Controller for one VM.
pub struct VmController {
    vm_id: String,
    deps: Arc<VmDeps>,
    descriptor: Mutex<VmDescriptor>,
    vmm: VmmClient,
    process: Mutex<Option<VmmProcess>>,
    session: AgentSession,
    listener: Mutex<Option<VsockListener>>,
    serial_bridge: Mutex<Option<Arc<SerialBridge>>>,
    /// Serializes state-changing transitions on this VM.
    op: Mutex<()>,
}

impl std::fmt::Debug for VmController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmController")
            .field("vm_id", &self.vm_id)
            .finish_non_exhaustive()
    }
}

impl VmController {
    pub fn new(descriptor: VmDescriptor, deps: Arc<VmDeps>) -> Self {
        let vm_id = descriptor.vm_id.clone();
        let vmm = VmmClient::new(deps.layout.vmm_socket(&vm_id));
        let session = AgentSession::new(vm_id.clone());
        Self {
            vm_id,
            deps,
            descriptor: Mutex::new(descriptor),
            vmm,
            process: Mutex::new(None),
            session,
            listener: Mutex::new(None),
            serial_bridge: Mutex::new(None),
            op: Mutex::new(()),
        }
    }

    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    pub fn descriptor(&self) -> VmDescriptor {
        self.descriptor.lock().clone()
    }

    pub fn status(&self) -> VmStatus {
        self.descriptor.lock().status
    }

    pub fn session(&self) -> &AgentSession {
        &self.session
    }

    pub(crate) fn vmm_client(&self) -> &VmmClient {
        &self.vmm
    }

    /// Mutate and persist the descriptor (single-writer).
    fn persist(&self, mutate: impl FnOnce(&mut VmDescriptor)) -> Result<()> {
        let mut descriptor = self.descriptor.lock();
        mutate(&mut descriptor);
        descriptor.touch();
        self.deps.store.save_vm(&descriptor)
    }

    // ========================================================================
    // Boot
    // ========================================================================

    /// Boot a freshly created VM. Not idempotent: re-entering from any
    /// state but `Created` fails with `StateConflict`.
    pub fn boot(&self, networking: bool) -> Result<()> {
        let _op = self.op.lock();

        {
            let descriptor = self.descriptor.lock();
            if descriptor.status != VmStatus::Created {
                return Err(Error::state_conflict("created", descriptor.status));
            }
        }
        self.persist(|d| d.status = VmStatus::Booting)?;

        // Network first: a provisioning failure must leave no VMM and no
        // allocator entries behind.
        let network = if networking {
            match self.deps.network.provision(&self.vm_id) {
                Ok(config) => Some(config),
                Err(e) => {
                    let _ = self.persist(|d| d.status = VmStatus::Failed);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let cid = match self.deps.cids.acquire() {
            Ok(cid) => cid,
            Err(e) => {
                self.abort_boot(&network, None, None);
                return Err(e);
            }
        };
        let port = match self.deps.ports.acquire() {
            Ok(port) => port,
            Err(e) => {
                self.abort_boot(&network, Some(cid), None);
                return Err(e);
            }
        };

        if let Err(e) = self.boot_inner(network.clone(), cid, port) {
            self.abort_boot(&network, Some(cid), Some(port));
            return Err(match e {
                e @ (Error::Vmm { .. } | Error::Io(_) | Error::Internal(_)) => {
                    Error::BootFailed(e.to_string())
                }
                other => other,
            });
        }
        Ok(())
    }

    fn boot_inner(&self, network: Option<NetworkConfig>, cid: u32, port: u16) -> Result<()> {
        let (kernel_path, rootfs_path, vcpu, mem_mib) = {
            let d = self.descriptor.lock();
            (
                d.kernel_path.clone(),
                d.rootfs_path.clone(),
                d.vcpu,
                d.mem_mib,
            )
        };

        let uds_base = crate::config::vsock_base_path(&self.vm_id);
        self.spawn_vmm(None)?;
        self.vmm.wait_for_socket(API_SOCKET_TIMEOUT)?;

        self.vmm.put_machine_config(vcpu, mem_mib)?;

        let mut boot_args = format!(
            "{} root=/dev/vda init=/init bandsox.vsock_port={}",
            DEFAULT_BOOT_ARGS, port
        );
        if let Some(net) = &network {
            boot_args.push(' ');
            boot_args.push_str(&net.boot_arg());
        }
        self.vmm.put_boot_source(&kernel_path, &boot_args)?;
        self.vmm.put_drive("rootfs", &rootfs_path, true, false)?;
        if let Some(net) = &network {
            self.vmm.put_network_interface("eth0", &net.tap_name, &net.mac)?;
        }
        self.vmm.put_vsock(cid, &uds_base)?;

        // The listener must exist before the guest's first connect.
        let vsock = VsockConfig {
            cid,
            port,
            guest_port: port,
            uds_path: uds_base.clone(),
        };
        let listener = VsockListener::bind(&uds_base, &[port], self.session.router())?;
        *self.listener.lock() = Some(listener);
        self.session
            .set_vsock_transport(Arc::new(VsockTransport::new(&uds_base, GUEST_CONTROL_PORT)));

        self.vmm.start()?;

        let pid = self.process.lock().as_ref().map(|p| p.pid());
        self.persist(|d| {
            d.network = network.clone();
            d.vsock = Some(vsock);
            d.vmm_pid = pid;
            d.status = VmStatus::Running;
        })?;

        self.await_registration();
        Ok(())
    }

    /// Wait out the registration grace period; a silent agent leaves the
    /// VM running on the serial-only path.
    fn await_registration(&self) {
        let deadline = Instant::now() + REGISTRATION_GRACE;
        while Instant::now() < deadline {
            if self.session.registered() {
                tracing::info!(vm = %self.vm_id, "agent registered over vsock");
                return;
            }
            if let Some(process) = self.process.lock().as_mut() {
                if !process.is_running() {
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        tracing::warn!(
            vm = %self.vm_id,
            "agent did not register within {:?}; using serial fallback",
            REGISTRATION_GRACE
        );
    }

    /// Spawn the firecracker child. For restores, `isolation` carries
    /// `(source_dir, target_dir)` for the per-VM mount namespace bind.
    fn spawn_vmm(&self, isolation: Option<(PathBuf, PathBuf)>) -> Result<()> {
        let api_socket = self.deps.layout.vmm_socket(&self.vm_id);
        match std::fs::remove_file(&api_socket) {
            Ok(()) => tracing::debug!(path = %api_socket.display(), "removed stale API socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut command = Command::new(&self.deps.config.firecracker_bin);
        command
            .arg("--api-sock")
            .arg(&api_socket)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        if let Some((source, target)) = isolation {
            enter_mount_namespace(&mut command, source, target);
        }

        let child = command.spawn().map_err(|e| {
            Error::BootFailed(format!(
                "failed to spawn {}: {}",
                self.deps.config.firecracker_bin.display(),
                e
            ))
        })?;

        let mut process = VmmProcess::new(child);
        tracing::info!(vm = %self.vm_id, pid = process.pid(), "VMM started");

        // The serial console rides the child's stdio.
        let writer = process
            .take_stdin()
            .ok_or_else(|| Error::Internal("VMM child has no stdin".into()))?;
        let reader = process
            .take_stdout()
            .ok_or_else(|| Error::Internal("VMM child has no stdout".into()))?;
        let bridge = SerialBridge::start(writer, reader, self.session.router());
        self.session
            .set_serial_transport(Arc::new(SerialTransport::new(bridge.clone())));
        *self.serial_bridge.lock() = Some(bridge);
        *self.process.lock() = Some(process);
        Ok(())
    }

    /// Undo a partial boot: runtime down, allocators back, network gone,
    /// descriptor `Failed`.
    fn abort_boot(&self, network: &Option<NetworkConfig>, cid: Option<u32>, port: Option<u16>) {
        self.teardown_runtime();
        if let Some(port) = port {
            if let Err(e) = self.deps.ports.release(port) {
                tracing::warn!(vm = %self.vm_id, port, error = %e, "port release failed");
            }
        }
        if let Some(cid) = cid {
            if let Err(e) = self.deps.cids.release(cid) {
                tracing::warn!(vm = %self.vm_id, cid, error = %e, "CID release failed");
            }
        }
        if let Some(net) = network {
            if let Err(e) = self.deps.network.teardown(net) {
                tracing::warn!(vm = %self.vm_id, error = %e, "network teardown failed");
            }
        }
        let _ = self.persist(|d| {
            d.status = VmStatus::Failed;
            d.vmm_pid = None;
        });
    }

    // ========================================================================
    // Restore
    // ========================================================================

    /// Boot this (freshly created) controller from a snapshot.
    ///
    /// The descriptor must already carry the restore vsock config: fresh
    /// CID/port for bookkeeping, the snapshot's `guest_port`, and an
    /// isolated UDS base under the isolation root. The VMM child enters a
    /// private mount namespace where the isolation directory is
    /// bind-mounted over the directory of the snapshot's original UDS
    /// path, so concurrent restores never collide on one socket path.
    pub(crate) fn boot_from_snapshot(&self, snapshot: &SnapshotDescriptor) -> Result<()> {
        let _op = self.op.lock();

        {
            let descriptor = self.descriptor.lock();
            if descriptor.status != VmStatus::Created {
                return Err(Error::state_conflict("created", descriptor.status));
            }
        }
        self.persist(|d| d.status = VmStatus::Booting)?;

        let (network, vsock) = {
            let d = self.descriptor.lock();
            (d.network.clone(), d.vsock.clone())
        };

        if let Err(e) = self.restore_inner(snapshot, &vsock) {
            let (cid, port) = vsock
                .as_ref()
                .map(|v| (Some(v.cid), Some(v.port)))
                .unwrap_or((None, None));
            self.abort_boot(&network, cid, port);
            return Err(match e {
                e @ (Error::Vmm { .. } | Error::Io(_) | Error::Internal(_)) => {
                    Error::BootFailed(e.to_string())
                }
                other => other,
            });
        }
        Ok(())
    }

    fn restore_inner(
        &self,
        snapshot: &SnapshotDescriptor,
        vsock: &Option<VsockConfig>,
    ) -> Result<()> {
        let isolation = vsock.as_ref().map(|v| {
            // The saved VMM state references the original path name; bind
            // our per-VM directory over its parent so that name resolves
            // to a private inode.
            let source = v
                .uds_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| v.uds_path.clone());
            (source, PathBuf::from(VSOCK_RUNTIME_DIR))
        });

        self.spawn_vmm(isolation)?;
        self.vmm.wait_for_socket(API_SOCKET_TIMEOUT)?;

        if let Some(vsock) = vsock {
            let listener =
                VsockListener::bind(&vsock.uds_path, &[vsock.guest_port], self.session.router())?;
            *self.listener.lock() = Some(listener);
            self.session.set_vsock_transport(Arc::new(VsockTransport::new(
                &vsock.uds_path,
                GUEST_CONTROL_PORT,
            )));
        }

        self.vmm
            .snapshot_load(&snapshot.mem_file_path, &snapshot.state_file_path, false)?;
        self.vmm.resume()?;

        // The restored memory holds an agent that registered long ago.
        self.session.mark_registered();

        let pid = self.process.lock().as_ref().map(|p| p.pid());
        self.persist(|d| {
            d.vmm_pid = pid;
            d.status = VmStatus::Running;
        })?;
        Ok(())
    }

    // ========================================================================
    // Pause / resume / snapshot hooks
    // ========================================================================

    pub fn pause(&self) -> Result<()> {
        let _op = self.op.lock();
        {
            let descriptor = self.descriptor.lock();
            if descriptor.status != VmStatus::Running {
                return Err(Error::state_conflict("running", descriptor.status));
            }
        }
        self.vmm.pause()?;
        self.persist(|d| d.status = VmStatus::Paused)
    }

    pub fn resume(&self) -> Result<()> {
        let _op = self.op.lock();
        {
            let descriptor = self.descriptor.lock();
            if descriptor.status != VmStatus::Paused {
                return Err(Error::state_conflict("paused", descriptor.status));
            }
        }
        self.vmm.resume()?;
        self.persist(|d| d.status = VmStatus::Running)
    }

    /// Close the vsock listener so the VMM can quiesce its backend
    /// (snapshot prelude). The socket paths stay recorded in the
    /// descriptor for [`Self::reopen_listener`].
    pub(crate) fn suspend_listener(&self) {
        if let Some(mut listener) = self.listener.lock().take() {
            listener.shutdown();
        }
    }

    /// Rebind the vsock listener after a snapshot, so `resume` is safe.
    pub(crate) fn reopen_listener(&self) -> Result<()> {
        let vsock = self.descriptor.lock().vsock.clone();
        if let Some(vsock) = vsock {
            let listener =
                VsockListener::bind(&vsock.uds_path, &[vsock.guest_port], self.session.router())?;
            *self.listener.lock() = Some(listener);
        }
        Ok(())
    }

    /// Hold the per-VM transition lock for a compound operation.
    pub(crate) fn transition_guard(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.op.lock()
    }

    // ========================================================================
    // Stop / delete / reconciliation
    // ========================================================================

    /// Stop the VM. Idempotent: stopping a stopped (or never-started) VM
    /// succeeds. After return, no further agent callbacks fire.
    pub fn stop(&self) -> Result<()> {
        let _op = self.op.lock();

        match self.descriptor.lock().status {
            VmStatus::Stopped | VmStatus::Failed | VmStatus::Created | VmStatus::Deleted => {
                return Ok(());
            }
            VmStatus::Booting | VmStatus::Running | VmStatus::Paused => {}
        }

        tracing::info!(vm = %self.vm_id, "stopping VM");
        self.session.kill_all();
        self.teardown_runtime();
        self.persist(|d| {
            d.status = VmStatus::Stopped;
            d.vmm_pid = None;
        })
    }

    /// Release everything the VM holds. Only valid from `Stopped` or
    /// `Failed`; refuses live states.
    pub fn delete(&self) -> Result<()> {
        let _op = self.op.lock();

        let descriptor = self.descriptor.lock().clone();
        match descriptor.status {
            VmStatus::Stopped | VmStatus::Failed => {}
            VmStatus::Deleted => return Ok(()),
            other => {
                return Err(Error::state_conflict("stopped or failed", other));
            }
        }

        tracing::info!(vm = %self.vm_id, "deleting VM");

        // Failures past this point are recoverable leaks, not aborts.
        if let Some(network) = &descriptor.network {
            if let Err(e) = self.deps.network.teardown(network) {
                tracing::warn!(vm = %self.vm_id, error = %e, "leaking network config");
            }
        }
        if let Some(vsock) = &descriptor.vsock {
            if let Err(e) = self.deps.cids.release(vsock.cid) {
                tracing::warn!(vm = %self.vm_id, cid = vsock.cid, error = %e, "leaking CID");
            }
            if let Err(e) = self.deps.ports.release(vsock.port) {
                tracing::warn!(vm = %self.vm_id, port = vsock.port, error = %e, "leaking port");
            }
            remove_vsock_files(vsock);

            // A restored VM owns its isolation directory.
            let isolation_root = &self.deps.config.vsock_isolation_dir;
            if vsock.uds_path.starts_with(isolation_root) {
                if let Some(dir) = vsock.uds_path.parent() {
                    let _ = std::fs::remove_dir_all(dir);
                }
            }
        }

        remove_tolerant(&self.deps.layout.vmm_socket(&self.vm_id));
        remove_tolerant(&descriptor.rootfs_path);

        self.descriptor.lock().status = VmStatus::Deleted;
        self.deps.store.delete_vm(&self.vm_id)
    }

    /// Fold an observed VMM exit into the state machine: a live VM whose
    /// process is gone becomes `Stopped` (clean exit) or `Failed`.
    pub fn observe_exit(&self) {
        let exit_code = {
            let mut process = self.process.lock();
            match process.as_mut() {
                Some(p) => p.poll_exit(),
                None => None,
            }
        };
        let Some(code) = exit_code else { return };

        let _op = self.op.lock();
        if !self.descriptor.lock().status.is_live() {
            return;
        }

        let status = if code == 0 {
            tracing::info!(vm = %self.vm_id, "VMM exited cleanly");
            VmStatus::Stopped
        } else {
            tracing::warn!(vm = %self.vm_id, code, "VMM exited unexpectedly");
            VmStatus::Failed
        };

        self.teardown_runtime();
        if let Err(e) = self.persist(|d| {
            d.status = status;
            d.vmm_pid = None;
        }) {
            tracing::warn!(vm = %self.vm_id, error = %e, "failed to persist observed exit");
        }
    }

    /// Close every channel and reap the VMM. Waiters unblock with
    /// `AgentDisconnected`.
    fn teardown_runtime(&self) {
        self.session.close();
        if let Some(mut listener) = self.listener.lock().take() {
            listener.shutdown();
        }
        if let Some(bridge) = self.serial_bridge.lock().take() {
            bridge.close();
        }
        if let Some(mut process) = self.process.lock().take() {
            match process.stop(STOP_GRACE) {
                Ok(code) => tracing::debug!(vm = %self.vm_id, code, "VMM stopped"),
                Err(e) => tracing::warn!(vm = %self.vm_id, error = %e, "VMM stop failed"),
            }
        }
        remove_tolerant(&self.deps.layout.vmm_socket(&self.vm_id));
    }
}

/// Configure `command` to run in a private mount namespace with `source`
/// bind-mounted over `target`.
fn enter_mount_namespace(command: &mut Command, source: PathBuf, target: PathBuf) {
    use nix::mount::{mount, MsFlags};
    use nix::sched::{unshare, CloneFlags};
    use std::os::unix::process::CommandExt;

    let errno_to_io = |e: nix::errno::Errno| std::io::Error::from_raw_os_error(e as i32);

    // Safety: the closure only performs async-signal-safe syscalls plus
    // mkdir, before exec in the child.
    unsafe {
        command.pre_exec(move || {
            unshare(CloneFlags::CLONE_NEWNS).map_err(errno_to_io)?;
            // Stop mount events from leaking back to the parent.
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None::<&str>,
            )
            .map_err(errno_to_io)?;
            std::fs::create_dir_all(&target)?;
            mount(
                Some(source.as_path()),
                target.as_path(),
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(errno_to_io)?;
            Ok(())
        });
    }
}

fn remove_vsock_files(vsock: &VsockConfig) {
    remove_tolerant(&vsock.uds_path);
    remove_tolerant(&vsock.listener_path());
}

fn remove_tolerant(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NoNetwork;
    use crate::vm::VmResources;

    fn deps(tmp: &tempfile::TempDir) -> Arc<VmDeps> {
        let root = tmp.path().join("store");
        let layout = StorageLayout::new(&root);
        layout.ensure().unwrap();
        let config = BandsoxConfig {
            storage_root: root,
            kernel_path: tmp.path().join("vmlinux"),
            firecracker_bin: PathBuf::from("/nonexistent/firecracker"),
            vsock_isolation_dir: tmp.path().join("bsx"),
        };
        Arc::new(VmDeps {
            layout: layout.clone(),
            store: MetadataStore::new(layout),
            cids: CidAllocator::new(config.storage_root.join("cid_allocator.json")),
            ports: PortAllocator::new(config.storage_root.join("port_allocator.json")),
            network: Arc::new(NoNetwork),
            config,
        })
    }

    fn controller(deps: &Arc<VmDeps>, status: VmStatus) -> VmController {
        let mut descriptor = VmDescriptor::new(
            uuid::Uuid::new_v4().to_string(),
            None,
            deps.layout.instance_rootfs("x"),
            deps.config.kernel_path.clone(),
            VmResources::default(),
            512,
        );
        descriptor.status = status;
        deps.store.save_vm(&descriptor).unwrap();
        VmController::new(descriptor, deps.clone())
    }

    #[test]
    fn test_boot_requires_created() {
        let tmp = tempfile::tempdir().unwrap();
        let deps = deps(&tmp);
        let vm = controller(&deps, VmStatus::Running);
        let err = vm.boot(false).unwrap_err();
        assert!(matches!(err, Error::StateConflict { .. }));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_boot_spawn_failure_releases_allocators() {
        let tmp = tempfile::tempdir().unwrap();
        let deps = deps(&tmp);
        // The firecracker binary does not exist, so boot fails at spawn.
        let vm = controller(&deps, VmStatus::Created);
        let err = vm.boot(false).unwrap_err();
        assert!(matches!(err, Error::BootFailed(_)));
        assert_eq!(vm.status(), VmStatus::Failed);

        // The acquired CID went back on the free-list; the port left the
        // used set.
        assert_eq!(deps.cids.acquire().unwrap(), 3);
        assert!(!used_ports(&deps).contains(&9000));
    }

    /// Read the port allocator's used set straight off disk.
    fn used_ports(deps: &Arc<VmDeps>) -> Vec<u16> {
        let data =
            std::fs::read(deps.config.storage_root.join("port_allocator.json")).unwrap_or_default();
        if data.is_empty() {
            return Vec::new();
        }
        let state: serde_json::Value = serde_json::from_slice(&data).unwrap();
        state["used"]
            .as_array()
            .map(|a| a.iter().map(|v| v.as_u64().unwrap() as u16).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_stop_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let deps = deps(&tmp);
        let vm = controller(&deps, VmStatus::Created);
        vm.stop().unwrap();
        vm.stop().unwrap();
    }

    #[test]
    fn test_delete_refuses_running() {
        let tmp = tempfile::tempdir().unwrap();
        let deps = deps(&tmp);
        let vm = controller(&deps, VmStatus::Running);
        let err = vm.delete().unwrap_err();
        assert!(matches!(err, Error::StateConflict { .. }));
    }

    #[test]
    fn test_delete_releases_resources_and_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let deps = deps(&tmp);

        let cid = deps.cids.acquire().unwrap();
        let port = deps.ports.acquire().unwrap();

        let vm = controller(&deps, VmStatus::Stopped);
        let rootfs = vm.descriptor().rootfs_path.clone();
        std::fs::write(&rootfs, b"fake ext4").unwrap();
        let vm_id = vm.vm_id().to_string();

        {
            let mut d = vm.descriptor.lock();
            d.vsock = Some(VsockConfig {
                cid,
                port,
                guest_port: port,
                uds_path: tmp.path().join("vsock_test.sock"),
            });
        }
        deps.store.save_vm(&vm.descriptor()).unwrap();

        vm.delete().unwrap();

        assert!(!rootfs.exists());
        assert!(matches!(
            deps.store.load_vm(&vm_id),
            Err(Error::NotFound(_))
        ));
        // CID and port are back in the pool.
        assert_eq!(deps.cids.acquire().unwrap(), cid);
        assert!(!used_ports(&deps).contains(&port));
    }

    #[test]
    fn test_pause_requires_running() {
        let tmp = tempfile::tempdir().unwrap();
        let deps = deps(&tmp);
        let vm = controller(&deps, VmStatus::Stopped);
        assert!(matches!(
            vm.pause(),
            Err(Error::StateConflict { .. })
        ));
        let vm = controller(&deps, VmStatus::Created);
        assert!(matches!(
            vm.resume(),
            Err(Error::StateConflict { .. })
        ));
    }
}
