//! Lifecycle subcommands: stop, pause, resume, delete.

use bandsox::manager::Manager;
use clap::Args;

/// Stop a running sandbox (idempotent).
#[derive(Args, Debug)]
pub struct StopCmd {
    /// VM name or id
    pub vm: String,
}

impl StopCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        manager.stop(&self.vm)?;
        println!("Stopped {}", self.vm);
        Ok(())
    }
}

/// Pause a running sandbox.
#[derive(Args, Debug)]
pub struct PauseCmd {
    /// VM name or id
    pub vm: String,
}

impl PauseCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        manager.pause(&self.vm)?;
        println!("Paused {}", self.vm);
        Ok(())
    }
}

/// Resume a paused sandbox.
#[derive(Args, Debug)]
pub struct ResumeCmd {
    /// VM name or id
    pub vm: String,
}

impl ResumeCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        manager.resume(&self.vm)?;
        println!("Resumed {}", self.vm);
        Ok(())
    }
}

/// Delete a stopped sandbox and release its resources.
#[derive(Args, Debug)]
pub struct DeleteCmd {
    /// VM name or id
    pub vm: String,

    /// Stop the VM first if it is running
    #[arg(short, long)]
    pub force: bool,
}

impl DeleteCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        if self.force {
            manager.stop(&self.vm)?;
        }
        manager.delete(&self.vm)?;
        println!("Deleted {}", self.vm);
        Ok(())
    }
}
