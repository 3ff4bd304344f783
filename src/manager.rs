//! Top-level coordinator: create, delete, list, snapshot, restore.
//!
//! One Manager per host. It owns the storage layout, both allocators, the
//! metadata store, and the registry of live controllers. Opening a
//! Manager runs crash recovery: descriptors claiming to be live whose VMM
//! is gone are downgraded to `Stopped` and their allocator entries
//! reclaimed.

use crate::agent::AgentSession;
use crate::alloc::{CidAllocator, PortAllocator};
use crate::config::BandsoxConfig;
use crate::error::{Error, Result};
use crate::image::{DockerImageBuilder, ImageBuilder};
use crate::network::{NetworkProvisioner, TapNetwork};
use crate::process::is_alive;
use crate::snapshot::SnapshotEngine;
use crate::store::MetadataStore;
use crate::vm::{SnapshotDescriptor, VmController, VmDeps, VmDescriptor, VmResources, VmStatus};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Parameters for [`Manager::create`].
#[derive(Debug, Clone)]
pub struct CreateSpec {
    /// Container image reference (e.g. "alpine:latest").
    pub image: String,
    /// Optional human label, unique among live VMs.
    pub name: Option<String>,
    pub resources: VmResources,
    /// Rootfs size hint in MiB (0 = builder default).
    pub disk_size_mib: u64,
    pub networking: bool,
}

/// The host-side control plane.
pub struct Manager {
    deps: Arc<VmDeps>,
    snapshots: SnapshotEngine,
    image_builder: Arc<dyn ImageBuilder>,
    vms: RwLock<HashMap<String, Arc<VmController>>>,
}

impl Manager {
    /// Open the manager with the default collaborators and run recovery.
    pub fn open(config: BandsoxConfig) -> Result<Self> {
        let images_dir = config.layout().images_dir();
        Self::with_collaborators(
            config,
            Arc::new(TapNetwork),
            Arc::new(DockerImageBuilder::new(images_dir)),
        )
    }

    /// Open with explicit collaborators (tests swap these out).
    pub fn with_collaborators(
        config: BandsoxConfig,
        network: Arc<dyn NetworkProvisioner>,
        image_builder: Arc<dyn ImageBuilder>,
    ) -> Result<Self> {
        let layout = config.layout();
        layout.ensure()?;

        let deps = Arc::new(VmDeps {
            store: MetadataStore::new(layout.clone()),
            cids: CidAllocator::new(layout.cid_allocator_file()),
            ports: PortAllocator::new(layout.port_allocator_file()),
            network,
            layout,
            config,
        });

        let manager = Self {
            snapshots: SnapshotEngine::new(deps.clone()),
            image_builder,
            vms: RwLock::new(HashMap::new()),
            deps,
        };
        manager.recover()?;
        Ok(manager)
    }

    /// Reconcile descriptors with reality after a crash or reboot.
    ///
    /// Every descriptor claiming `Running`/`Paused`/`Booting` whose
    /// `vmm_pid` is dead is downgraded to `Stopped`, its CID and port
    /// released (release is idempotent, so a second recovery pass is a
    /// no-op), and its socket files removed.
    fn recover(&self) -> Result<()> {
        for mut descriptor in self.deps.store.list_vms()? {
            if !descriptor.status.is_live() {
                continue;
            }
            let alive = descriptor.vmm_pid.map(is_alive).unwrap_or(false);
            if alive {
                tracing::warn!(
                    vm = %descriptor.vm_id,
                    pid = ?descriptor.vmm_pid,
                    "VMM outlived the previous manager; leaving descriptor as-is"
                );
                continue;
            }

            tracing::info!(
                vm = %descriptor.vm_id,
                was = %descriptor.status,
                "reconciling dead VM to stopped"
            );

            if let Some(vsock) = &descriptor.vsock {
                if let Err(e) = self.deps.cids.release(vsock.cid) {
                    tracing::warn!(vm = %descriptor.vm_id, error = %e, "CID reclaim failed");
                }
                if let Err(e) = self.deps.ports.release(vsock.port) {
                    tracing::warn!(vm = %descriptor.vm_id, error = %e, "port reclaim failed");
                }
                let _ = std::fs::remove_file(&vsock.uds_path);
                let _ = std::fs::remove_file(vsock.listener_path());
            }
            let _ = std::fs::remove_file(self.deps.layout.vmm_socket(&descriptor.vm_id));

            descriptor.status = VmStatus::Stopped;
            descriptor.vmm_pid = None;
            descriptor.touch();
            self.deps.store.save_vm(&descriptor)?;
        }
        Ok(())
    }

    /// Build a rootfs for `spec.image`, create the VM, and boot it.
    pub fn create(&self, spec: CreateSpec) -> Result<Arc<VmController>> {
        if spec.resources.vcpu == 0 {
            return Err(Error::InvalidArgument("vcpu must be at least 1".into()));
        }
        if spec.resources.mem_mib < 32 {
            return Err(Error::InvalidArgument(
                "mem_mib must be at least 32".into(),
            ));
        }
        if let Some(name) = &spec.name {
            self.ensure_name_free(name)?;
        }

        let vm_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(vm = %vm_id, image = %spec.image, "creating VM");

        // Each VM mutates a private copy of the image's base rootfs.
        let base = self.image_builder.build(&spec.image, spec.disk_size_mib)?;
        let rootfs = self.deps.layout.instance_rootfs(&vm_id);
        std::fs::copy(&base, &rootfs)?;

        let descriptor = VmDescriptor::new(
            vm_id.clone(),
            spec.name.clone(),
            rootfs.clone(),
            self.deps.config.kernel_path.clone(),
            spec.resources,
            spec.disk_size_mib,
        );
        self.deps.store.save_vm(&descriptor)?;

        let controller = Arc::new(VmController::new(descriptor, self.deps.clone()));
        self.vms
            .write()
            .insert(vm_id.clone(), controller.clone());

        if let Err(e) = controller.boot(spec.networking) {
            // The failed VM stays on disk (status Failed) for inspection;
            // its allocator entries were already released by the
            // controller.
            tracing::error!(vm = %vm_id, error = %e, "boot failed");
            return Err(e);
        }
        Ok(controller)
    }

    fn ensure_name_free(&self, name: &str) -> Result<()> {
        for descriptor in self.deps.store.list_vms()? {
            if descriptor.name.as_deref() == Some(name)
                && descriptor.status != VmStatus::Deleted
                && descriptor.status != VmStatus::Failed
            {
                return Err(Error::InvalidArgument(format!(
                    "name '{}' is already in use by VM {}",
                    name, descriptor.vm_id
                )));
            }
        }
        Ok(())
    }

    /// Get the live controller for a VM id.
    pub fn get(&self, vm_id: &str) -> Result<Arc<VmController>> {
        if let Some(controller) = self.vms.read().get(vm_id) {
            controller.observe_exit();
            return Ok(controller.clone());
        }

        // Descriptor-only VMs (created by an earlier manager run) get a
        // fresh controller for stop/delete-style operations.
        let descriptor = self.deps.store.load_vm(vm_id)?;
        let controller = Arc::new(VmController::new(descriptor, self.deps.clone()));
        self.vms
            .write()
            .insert(vm_id.to_string(), controller.clone());
        Ok(controller)
    }

    /// Resolve a VM by name or id.
    pub fn resolve(&self, name_or_id: &str) -> Result<Arc<VmController>> {
        if self.deps.store.load_vm(name_or_id).is_ok() {
            return self.get(name_or_id);
        }
        for descriptor in self.deps.store.list_vms()? {
            if descriptor.name.as_deref() == Some(name_or_id) {
                return self.get(&descriptor.vm_id);
            }
        }
        Err(Error::NotFound(format!("VM {}", name_or_id)))
    }

    /// Agent session of a live VM.
    pub fn session(&self, name_or_id: &str) -> Result<Arc<VmController>> {
        let controller = self.resolve(name_or_id)?;
        match controller.status() {
            VmStatus::Running | VmStatus::Paused => Ok(controller),
            other => Err(Error::state_conflict("running", other)),
        }
    }

    /// All VM descriptors, with observed VMM exits folded in.
    pub fn list(&self) -> Result<Vec<VmDescriptor>> {
        for controller in self.vms.read().values() {
            controller.observe_exit();
        }
        let mut vms = self.deps.store.list_vms()?;
        vms.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(vms)
    }

    pub fn stop(&self, name_or_id: &str) -> Result<()> {
        self.resolve(name_or_id)?.stop()
    }

    pub fn pause(&self, name_or_id: &str) -> Result<()> {
        self.resolve(name_or_id)?.pause()
    }

    pub fn resume(&self, name_or_id: &str) -> Result<()> {
        self.resolve(name_or_id)?.resume()
    }

    /// Delete a VM. Refuses live states unless stopped first.
    pub fn delete(&self, name_or_id: &str) -> Result<()> {
        let controller = self.resolve(name_or_id)?;
        controller.observe_exit();
        controller.delete()?;
        self.vms.write().remove(controller.vm_id());
        Ok(())
    }

    /// Snapshot a VM. A running VM is paused around the snapshot and
    /// resumed afterwards.
    pub fn snapshot(&self, name_or_id: &str, name: Option<String>) -> Result<SnapshotDescriptor> {
        let controller = self.resolve(name_or_id)?;

        let was_running = controller.status() == VmStatus::Running;
        if was_running {
            controller.pause()?;
        }

        let result = self.snapshots.create(&controller, name);

        if was_running {
            if let Err(e) = controller.resume() {
                tracing::warn!(vm = %controller.vm_id(), error = %e, "resume after snapshot failed");
                if result.is_ok() {
                    return Err(e);
                }
            }
        }
        result
    }

    /// Restore a snapshot into a brand-new VM.
    pub fn restore(&self, snapshot_id: &str, networking: bool) -> Result<Arc<VmController>> {
        let controller = self.snapshots.restore(snapshot_id, networking)?;
        self.vms
            .write()
            .insert(controller.vm_id().to_string(), controller.clone());
        Ok(controller)
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotDescriptor>> {
        let mut snapshots = self.deps.store.list_snapshots()?;
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(snapshots)
    }

    pub fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.snapshots.delete(snapshot_id)
    }

    /// Convenience: run a command in a VM and return its outcome.
    pub fn exec(
        &self,
        name_or_id: &str,
        argv: Vec<String>,
        timeout: std::time::Duration,
    ) -> Result<crate::agent::ExecOutcome> {
        let controller = self.session(name_or_id)?;
        let session: &AgentSession = controller.session();
        session.exec(argv, Vec::new(), None, timeout, None)
    }
}
