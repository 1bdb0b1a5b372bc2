mod config;
mod pipeline;
mod tracking;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pipeline::TrainArgs;

/// Train a binary token classifier on sharded token/label data.
#[derive(Parser)]
#[command(name = "train-token-cls", version, about, args_override_self = true)]
struct Cli {
    #[command(flatten)]
    args: TrainArgs,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let summary = pipeline::run_train(cli.args)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
