//! Broker binary entry point.

use anyhow::Result;
use clap::Parser;
use tunnelcraft::broker::{Broker, BrokerArgs};

/// Distinguishes a SIGTERM-triggered shutdown (exit 0) from a SIGINT one
/// (exit 130), per the broker's documented exit-code contract.
enum ExitSignal {
    Sigint,
    Sigterm,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = BrokerArgs::parse();
    if let Err(e) = args.validate() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    match run(args).await {
        Ok(ExitSignal::Sigterm) => std::process::exit(0),
        Ok(ExitSignal::Sigint) => std::process::exit(130),
        Err(e) => {
            eprintln!("fatal error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(args: BrokerArgs) -> Result<ExitSignal> {
    let broker = Broker::new(args);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => ExitSignal::Sigint,
            _ = sigterm.recv() => ExitSignal::Sigterm,
        }
    };

    broker.run(shutdown).await
}
