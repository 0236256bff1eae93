mod cli;

use clap::Parser;
use cli::Cli;
use starttls_probe::engine::Engine;
use starttls_probe::output::OutputChannel;
use starttls_probe::tls::OpensslUpgrader;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let cfg = cli.into_config()?;

    let upgrader = Arc::new(OpensslUpgrader::new()?);
    let sink = OutputChannel::new(cfg.output.clone())?;
    let mut engine = Engine::new(cfg, sink.clone(), upgrader);
    engine.run().await?;
    sink.shutdown().await?;

    Ok(())
}
