use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};

mod command_flows;
mod completion;
mod config;
mod dispatch;
mod logging;
mod render;

use completion::CliCompletionShell;
use dispatch::{report_error, run_cli};

#[derive(Parser, Debug)]
#[command(name = "keelctl")]
#[command(about = "Install, upgrade and roll back a keel installation", long_about = None)]
struct Cli {
    /// Installation prefix (defaults to KEEL_PREFIX, then ~/.keel).
    #[arg(long, global = true)]
    prefix: Option<PathBuf>,
    /// Directory holding one sub-directory per release.
    #[arg(long, global = true)]
    releases: Option<PathBuf>,
    /// Config file (defaults to keel.toml under the prefix).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    lock_timeout_secs: Option<u64>,
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install an exact release version.
    Install { version: String },
    /// Upgrade to the newest release, or the newest matching a version or requirement.
    Upgrade { requirement: Option<String> },
    /// Restore a version this installation was upgraded from.
    Rollback { version: String },
    /// Continue an interrupted transition.
    Resume,
    /// Undo an interrupted transition.
    Abort,
    /// Re-verify a failed installation and mark it stable.
    Repair,
    /// Show the installed version, status and components.
    Status,
    /// Print the installed version.
    Version,
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => ExitCode::from(report_error(&err)),
    }
}
