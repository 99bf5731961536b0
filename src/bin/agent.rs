//! Agent binary entry point.

use clap::Parser;
use tunnelcraft::agent::config::{self, AgentArgs, PersistedConnection};
use tunnelcraft::agent::control::{connect_and_run, AgentConnectParams};
use tunnelcraft::error::AgentError;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = AgentArgs::parse();
    let state_path = args.state_file.clone().or_else(PersistedConnection::default_path);

    if let Some(path) = &state_path {
        match PersistedConnection::load(path) {
            Ok(persisted) => persisted.merge_into(&mut args),
            Err(e) => log::warn!("could not load persisted connection state from {}: {e}", path.display()),
        }
    }

    let config = match config::resolve(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    if let Some(path) = &state_path {
        if let Err(e) = PersistedConnection::from(&config).save(path) {
            log::warn!("could not persist connection state to {}: {e}", path.display());
        }
    }

    let params = AgentConnectParams {
        server_host: config.server_host.clone(),
        server_port: config.server_port,
        token: config.token.clone(),
        local_host: config.local_host.clone(),
        local_port: config.local_port,
    };

    match connect_and_run(params).await {
        Ok(()) => std::process::exit(0),
        Err(AgentError::AuthenticationFailed) => {
            eprintln!("authentication failed: the broker rejected the token");
            std::process::exit(1);
        }
        Err(e @ AgentError::ConnectionFailed(_)) => {
            eprintln!("connection error: {e}");
            std::process::exit(1);
        }
    }
}
