//! `bandsox create` - build a rootfs and boot a new sandbox.

use bandsox::manager::{CreateSpec, Manager};
use bandsox::vm::VmResources;
use clap::Args;

/// Create and boot a sandbox from a container image.
#[derive(Args, Debug)]
pub struct CreateCmd {
    /// Container image reference (e.g. alpine:latest)
    pub image: String,

    /// Human-readable VM name (unique among live VMs)
    #[arg(long)]
    pub name: Option<String>,

    /// Number of vCPUs
    #[arg(long, default_value = "1")]
    pub vcpu: u8,

    /// Memory in MiB
    #[arg(long, default_value = "128")]
    pub mem: u32,

    /// Rootfs size hint in MiB
    #[arg(long, default_value = "1024")]
    pub disk: u64,

    /// Disable guest networking
    #[arg(long)]
    pub no_net: bool,
}

impl CreateCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        let controller = manager.create(CreateSpec {
            image: self.image.clone(),
            name: self.name.clone(),
            resources: VmResources {
                vcpu: self.vcpu,
                mem_mib: self.mem,
            },
            disk_size_mib: self.disk,
            networking: !self.no_net,
        })?;

        let descriptor = controller.descriptor();
        println!("{}", descriptor.vm_id);
        if let Some(name) = &descriptor.name {
            eprintln!("Created VM '{}' ({})", name, descriptor.status);
        } else {
            eprintln!("Created VM ({})", descriptor.status);
        }
        if controller.session().registered() {
            eprintln!("Agent connected over vsock");
        } else {
            eprintln!("Agent on serial fallback");
        }
        Ok(())
    }
}
