//! `bandsox exec` - run a command inside a sandbox.

use bandsox::manager::Manager;
use clap::Args;
use std::io::Write;
use std::time::Duration;

use super::parse_duration;

/// Execute a command in a running sandbox.
#[derive(Args, Debug)]
pub struct ExecCmd {
    /// VM name or id
    pub vm: String,

    /// Command and arguments to execute
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,

    /// Working directory inside the guest
    #[arg(short = 'w', long)]
    pub workdir: Option<String>,

    /// Environment variable (KEY=VALUE)
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// Timeout for command execution (e.g., "30s", "5m")
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub timeout: Duration,
}

impl ExecCmd {
    pub fn run(self, manager: &Manager) -> bandsox::Result<()> {
        let controller = manager.session(&self.vm)?;

        let env: Vec<(String, String)> = self
            .env
            .iter()
            .filter_map(|spec| {
                let (key, value) = spec.split_once('=')?;
                (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
            })
            .collect();

        let outcome = controller.session().exec(
            self.command.clone(),
            env,
            self.workdir.clone(),
            self.timeout,
            None,
        )?;

        if !outcome.stdout_tail.is_empty() {
            print!("{}", outcome.stdout_tail);
        }
        if !outcome.stderr_tail.is_empty() {
            eprint!("{}", outcome.stderr_tail);
        }
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        std::process::exit(outcome.exit_code);
    }
}
