//! bandsox CLI entry point.

use bandsox::config::BandsoxConfig;
use bandsox::manager::Manager;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

/// bandsox - Firecracker microVM sandbox manager
#[derive(Parser, Debug)]
#[command(name = "bandsox")]
#[command(about = "Firecracker microVM sandbox manager")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create and boot a sandbox from a container image
    Create(cli::create::CreateCmd),

    /// List all sandboxes
    #[command(alias = "list")]
    Ls(cli::list::LsCmd),

    /// Execute a command in a running sandbox
    Exec(cli::exec::ExecCmd),

    /// Pause a running sandbox
    Pause(cli::lifecycle::PauseCmd),

    /// Resume a paused sandbox
    Resume(cli::lifecycle::ResumeCmd),

    /// Stop a running sandbox
    Stop(cli::lifecycle::StopCmd),

    /// Delete a stopped sandbox
    #[command(alias = "rm")]
    Delete(cli::lifecycle::DeleteCmd),

    /// Manage snapshots
    #[command(subcommand)]
    Snapshot(cli::snapshot::SnapshotCmd),

    /// Restore a snapshot into a new sandbox
    Restore(cli::snapshot::RestoreCmd),

    /// Copy a host file into a sandbox
    Upload(cli::files::UploadCmd),

    /// Copy a sandbox file onto the host
    Download(cli::files::DownloadCmd),

    /// Print a sandbox file to stdout
    Cat(cli::files::CatCmd),
}

fn main() {
    init_logging();

    tracing::debug!(version = bandsox::VERSION, "starting bandsox");

    let cli = Cli::parse();

    let manager = match Manager::open(BandsoxConfig::from_env()) {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!(error = %e, "failed to open manager");
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    let result = match cli.command {
        Commands::Create(cmd) => cmd.run(&manager),
        Commands::Ls(cmd) => cmd.run(&manager),
        Commands::Exec(cmd) => cmd.run(&manager),
        Commands::Pause(cmd) => cmd.run(&manager),
        Commands::Resume(cmd) => cmd.run(&manager),
        Commands::Stop(cmd) => cmd.run(&manager),
        Commands::Delete(cmd) => cmd.run(&manager),
        Commands::Snapshot(cmd) => cmd.run(&manager),
        Commands::Restore(cmd) => cmd.run(&manager),
        Commands::Upload(cmd) => cmd.run(&manager),
        Commands::Download(cmd) => cmd.run(&manager),
        Commands::Cat(cmd) => cmd.run(&manager),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bandsox=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
