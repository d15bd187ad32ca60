use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use omni_runs::Provider;

#[derive(Parser)]
#[command(name = "omni-runs")]
#[command(about = "Run scheduler: queue model invocations under a concurrency cap and wait for results.")]
pub(crate) struct Cli {
    /// Override config directory (user `omni-dev-fusion/runs.yaml` lives under it).
    #[arg(long, global = true)]
    pub(crate) conf: Option<PathBuf>,

    /// Debug logging for omni_runs (ignored when RUST_LOG is set).
    #[arg(long, short, global = true)]
    pub(crate) verbose: bool,

    /// Override scheduler.max_concurrent_runs.
    #[arg(long, global = true)]
    pub(crate) max_concurrent: Option<usize>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum ProviderArg {
    Openai,
    Ollama,
}

impl From<ProviderArg> for Provider {
    fn from(value: ProviderArg) -> Self {
        match value {
            ProviderArg::Openai => Provider::OpenAi,
            ProviderArg::Ollama => Provider::Ollama,
        }
    }
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Create one run, wait for it, print the terminal run and response as JSON.
    Run {
        /// Inference provider.
        #[arg(long, value_enum, default_value_t = ProviderArg::Openai)]
        provider: ProviderArg,

        /// Provider-specific model name (e.g. gpt-4o-mini, llama3.2).
        #[arg(long)]
        model: String,

        /// User prompt.
        #[arg(long)]
        prompt: String,

        /// Optional system prompt placed before the user prompt.
        #[arg(long)]
        system: Option<String>,

        /// JSON Schema file for structured output; the run becomes tooled.
        #[arg(long)]
        tool_schema: Option<PathBuf>,

        /// Tool name for `--tool-schema` (default: respond).
        #[arg(long, default_value = "respond")]
        tool_name: String,

        /// Human label for the run.
        #[arg(long, default_value = "cli")]
        name: String,
    },
    /// Enqueue every run from a YAML file, wait for all, print a JSON summary.
    Batch {
        /// YAML file with a top-level `runs` list.
        #[arg(long)]
        file: PathBuf,
    },
}
