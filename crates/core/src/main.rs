use anyhow::Context as _;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ganache_provider_config::Arguments;
use ganache_provider_node::GanacheProvider;

/// The name the command line provider reports its connection under.
const NETWORK_CHOICE: &str = "development";

fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set the tracing subscriber")?;

    let args = Arguments::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed building the runtime")?
        .block_on(run(args))
}

async fn run(args: Arguments) -> anyhow::Result<()> {
    let config = args.provider_config()?;
    info!(
        port = %config.port,
        hostname = %config.hostname,
        fork = config.is_fork(),
        "Starting"
    );

    let provider = GanacheProvider::new(NETWORK_CHOICE, config);

    // Dropping the connect future on Ctrl-C kills a half started Ganache.
    let endpoint = tokio::select! {
        endpoint = provider.connect() => endpoint.context("Failed to connect to Ganache")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted while starting");
            return Ok(());
        }
    };

    println!("{}", endpoint.uri);
    info!(
        uri = %endpoint.uri,
        owned_by_us = endpoint.owned_by_us,
        pid = endpoint.pid,
        "Ganache is running, press Ctrl-C to stop"
    );

    let interrupted = tokio::signal::ctrl_c().await;
    provider.disconnect().await;
    interrupted.context("Failed to listen for Ctrl-C")?;

    info!("Stopped");
    Ok(())
}
