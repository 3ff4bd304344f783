//! `bandsox ls` - list sandboxes.

use bandsox::manager::Manager;
use clap::Args;

/// List all sandboxes.
#[derive(Args, Debug)]
pub struct LsCmd {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl LsCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        let vms = manager.list()?;

        if self.json {
            let entries: Vec<_> = vms
                .iter()
                .map(|d| {
                    serde_json::json!({
                        "vm_id": d.vm_id,
                        "name": d.name,
                        "status": d.status.to_string(),
                        "vcpu": d.vcpu,
                        "mem_mib": d.mem_mib,
                        "pid": d.vmm_pid,
                        "cid": d.vsock.as_ref().map(|v| v.cid),
                        "port": d.vsock.as_ref().map(|v| v.port),
                        "restored_from": d.source_snapshot_id,
                        "created_at": d.created_at,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }

        if vms.is_empty() {
            println!("No VMs found");
            return Ok(());
        }

        println!(
            "{:<36} {:<16} {:<8} {:<5} {:<8} {:<8}",
            "ID", "NAME", "STATE", "CPUS", "MEMORY", "PID"
        );
        for d in vms {
            println!(
                "{:<36} {:<16} {:<8} {:<5} {:<8} {:<8}",
                d.vm_id,
                d.name.as_deref().unwrap_or("-"),
                d.status,
                d.vcpu,
                format!("{} MiB", d.mem_mib),
                d.vmm_pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            );
        }
        Ok(())
    }
}
