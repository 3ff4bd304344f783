//! Snapshot subcommands: create, list, delete, restore.

use bandsox::manager::Manager;
use clap::{Args, Subcommand};

/// Manage snapshots.
#[derive(Subcommand, Debug)]
pub enum SnapshotCmd {
    /// Snapshot a sandbox (paused around the operation if running)
    Create(SnapshotCreateCmd),

    /// List all snapshots
    #[command(alias = "list")]
    Ls(SnapshotLsCmd),

    /// Delete a snapshot
    #[command(alias = "rm")]
    Delete(SnapshotDeleteCmd),
}

impl SnapshotCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        match self {
            SnapshotCmd::Create(cmd) => cmd.run(manager),
            SnapshotCmd::Ls(cmd) => cmd.run(manager),
            SnapshotCmd::Delete(cmd) => cmd.run(manager),
        }
    }
}

/// Snapshot a sandbox.
#[derive(Args, Debug)]
pub struct SnapshotCreateCmd {
    /// VM name or id
    pub vm: String,

    /// Snapshot label
    #[arg(long)]
    pub name: Option<String>,
}

impl SnapshotCreateCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        let snapshot = manager.snapshot(&self.vm, self.name.clone())?;
        println!("{}", snapshot.snapshot_id);
        if let Some(name) = &snapshot.name {
            eprintln!("Snapshot '{}' created from {}", name, snapshot.source_vm_id);
        }
        Ok(())
    }
}

/// List all snapshots.
#[derive(Args, Debug)]
pub struct SnapshotLsCmd {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl SnapshotLsCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        let snapshots = manager.list_snapshots()?;

        if self.json {
            let entries: Vec<_> = snapshots
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "snapshot_id": s.snapshot_id,
                        "name": s.name,
                        "source_vm_id": s.source_vm_id,
                        "vcpu": s.resources.vcpu,
                        "mem_mib": s.resources.mem_mib,
                        "created_at": s.created_at,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }

        if snapshots.is_empty() {
            println!("No snapshots found");
            return Ok(());
        }

        println!("{:<36} {:<16} {:<36}", "ID", "NAME", "SOURCE VM");
        for s in snapshots {
            println!(
                "{:<36} {:<16} {:<36}",
                s.snapshot_id,
                s.name.as_deref().unwrap_or("-"),
                s.source_vm_id,
            );
        }
        Ok(())
    }
}

/// Delete a snapshot.
#[derive(Args, Debug)]
pub struct SnapshotDeleteCmd {
    /// Snapshot id
    pub snapshot: String,
}

impl SnapshotDeleteCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        manager.delete_snapshot(&self.snapshot)?;
        println!("Deleted snapshot {}", self.snapshot);
        Ok(())
    }
}

/// Restore a snapshot into a new sandbox.
#[derive(Args, Debug)]
pub struct RestoreCmd {
    /// Snapshot id
    pub snapshot: String,

    /// Disable guest networking on the restored VM
    #[arg(long)]
    pub no_net: bool,
}

impl RestoreCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        let controller = manager.restore(&self.snapshot, !self.no_net)?;
        println!("{}", controller.vm_id());
        eprintln!("Restored snapshot {} into new VM", self.snapshot);
        Ok(())
    }
}
