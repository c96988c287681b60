use clap::Parser;
use eyre::Result;
use filer_remote::FilerConfig;

mod app;
mod runner;

use app::Args;
use runner::Runner;

#[tokio::main]
async fn main() -> Result<()> {
    filer_remote::init_tracing();

    let args = Args::parse();
    let config = FilerConfig::load(args.config.as_deref())?;
    tracing::debug!("Loaded configuration: {config:?}");

    Runner::new(config).run(args.command).await
}
