use std::io::Write;

use anyhow::{Context, Result};
use buildtrack_config::{config_path, ensure_workspace_config, validate_config};
use buildtrackd::cli::{Cli, Commands, parse_cli};
use buildtrackd::commands::{run_init, run_reconcile, run_report, run_status, run_sync};
use buildtrackd::logging::init_tracing;

fn main() -> Result<()> {
    let cli = parse_cli();
    init_tracing(cli.log_format)?;
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let workspace = cli.workspace.canonicalize().with_context(|| {
        format!(
            "failed to resolve workspace path {}",
            cli.workspace.display()
        )
    })?;

    let config = ensure_workspace_config(&workspace).with_context(|| {
        format!(
            "failed to load or create workspace config at {}",
            config_path(&workspace).display()
        )
    })?;
    for warning in validate_config(&config) {
        tracing::warn!(code = warning.code, "{}", warning.message);
    }

    let mut out = std::io::stdout().lock();
    match cli.command {
        Commands::Init => run_init(&workspace, &mut out),
        Commands::Report(args) => run_report(&workspace, &args, &mut out),
        Commands::Status(args) => run_status(&workspace, &args, &mut out),
        Commands::Sync(args) => run_sync(&workspace, &args, &mut out).map(|_| ()),
        Commands::Reconcile(args) => {
            if run_reconcile(&workspace, &args, &mut out)? {
                Ok(())
            } else {
                out.flush()?;
                std::process::exit(1);
            }
        }
    }
}
