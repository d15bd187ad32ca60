//! omni-runs CLI: one-shot run or YAML batch through the run scheduler.
//!
//! Logging: set `RUST_LOG=omni_runs=debug` (or `warn`, `trace`) to see scheduler logs on stderr.

mod cli;
mod nodes;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use omni_runs::{load_runtime_settings, set_config_home_override};

use crate::cli::{Cli, Command};
use crate::nodes::{RunCommandRequest, run_batch_mode, run_single_mode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Some(conf_dir) = cli.conf.clone() {
        set_config_home_override(conf_dir);
    }

    // RUST_LOG overrides; --verbose => debug; else info
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose {
            "omni_runs=debug"
        } else {
            "omni_runs=info"
        })
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let runtime_settings = load_runtime_settings();

    match cli.command {
        Command::Run {
            provider,
            model,
            prompt,
            system,
            tool_schema,
            tool_name,
            name,
        } => {
            run_single_mode(
                RunCommandRequest {
                    provider: provider.into(),
                    model,
                    prompt,
                    system,
                    tool_schema,
                    tool_name,
                    name,
                },
                cli.max_concurrent,
                &runtime_settings,
            )
            .await
        }
        Command::Batch { file } => {
            run_batch_mode(&file, cli.max_concurrent, &runtime_settings).await
        }
    }
}
