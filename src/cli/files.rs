//! File transfer subcommands: upload, download, cat.

use bandsox::manager::Manager;
use clap::Args;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use super::parse_duration;

/// Copy a host file into a sandbox.
#[derive(Args, Debug)]
pub struct UploadCmd {
    /// VM name or id
    pub vm: String,

    /// Local source path
    pub local: PathBuf,

    /// Remote destination path
    pub remote: String,

    /// Transfer deadline (default scales with file size)
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
}

impl UploadCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        let controller = manager.session(&self.vm)?;
        controller
            .session()
            .upload_file(&self.local, &self.remote, self.timeout)?;
        println!("Uploaded {} -> {}", self.local.display(), self.remote);
        Ok(())
    }
}

/// Copy a sandbox file onto the host.
#[derive(Args, Debug)]
pub struct DownloadCmd {
    /// VM name or id
    pub vm: String,

    /// Remote source path
    pub remote: String,

    /// Local destination path
    pub local: PathBuf,

    /// Transfer deadline
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
}

impl DownloadCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        let controller = manager.session(&self.vm)?;
        let size = controller
            .session()
            .download_file(&self.remote, &self.local, self.timeout)?;
        println!(
            "Downloaded {} -> {} ({} bytes)",
            self.remote,
            self.local.display(),
            size
        );
        Ok(())
    }
}

/// Print a sandbox file to stdout.
#[derive(Args, Debug)]
pub struct CatCmd {
    /// VM name or id
    pub vm: String,

    /// Remote path
    pub remote: String,
}

impl CatCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        let controller = manager.session(&self.vm)?;
        let bytes = controller.session().get_file_contents(&self.remote)?;
        std::io::stdout().write_all(&bytes)?;
        Ok(())
    }
}
