//! Broker: the public-facing half of the tunnel. Accepts agent control
//! connections, leases public ports, and relays traffic between them.

pub mod control;
pub mod listener;
pub mod port_allocator;
pub mod registry;
pub mod session;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use control::ControlHandlerConfig;
use port_allocator::PortAllocator;
use registry::SessionRegistry;

/// Command-line flags for the broker process.
#[derive(Debug, Parser)]
#[command(name = "tunnelcraft-broker", about = "Public-facing reverse tunnel broker")]
pub struct BrokerArgs {
    /// Address for the control listener.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// TCP port for the control listener.
    #[arg(long, default_value_t = 7000)]
    pub control: u16,

    /// Lower bound of the public port range.
    #[arg(long = "port-min", default_value_t = 10000)]
    pub port_min: u16,

    /// Upper bound of the public port range.
    #[arg(long = "port-max", default_value_t = 11000)]
    pub port_max: u16,

    /// Shared authentication secret.
    #[arg(long)]
    pub token: String,
}

impl BrokerArgs {
    /// Validate flag combinations that `clap` can't express on its own.
    pub fn validate(&self) -> Result<()> {
        if self.port_min > self.port_max {
            bail!("--port-min ({}) must be <= --port-max ({})", self.port_min, self.port_max);
        }
        if self.token.is_empty() {
            bail!("--token must not be empty");
        }
        Ok(())
    }
}

/// Top-level broker process: owns the control listener, the port
/// allocator, and the session registry.
#[derive(Debug)]
pub struct Broker {
    args: BrokerArgs,
    registry: Arc<SessionRegistry>,
    port_allocator: Arc<PortAllocator>,
}

impl Broker {
    /// Construct a broker from validated CLI flags.
    pub fn new(args: BrokerArgs) -> Self {
        let port_allocator = Arc::new(PortAllocator::new(args.port_min, args.port_max));
        Self {
            args,
            registry: Arc::new(SessionRegistry::new()),
            port_allocator,
        }
    }

    /// Accessor used by tests and by `main` to report final state.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind the control listener and run the accept loop until `shutdown`
    /// resolves (e.g. a signal future). Returns whatever `shutdown` resolved
    /// to, so callers can recover which signal triggered the exit.
    pub async fn run<T>(&self, shutdown: impl std::future::Future<Output = T>) -> Result<T> {
        let listener = TcpListener::bind((self.args.bind.as_str(), self.args.control))
            .await
            .with_context(|| format!("failed to bind control listener on {}:{}", self.args.bind, self.args.control))?;
        log::info!("control listener bound on {}:{}", self.args.bind, self.args.control);

        let config = Arc::new(ControlHandlerConfig {
            token: self.args.token.clone(),
            bind_addr: self.args.bind.clone(),
        });

        let mut connection_tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

        tokio::pin!(shutdown);
        let reason = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::error!("control listener accept error: {e}");
                            continue;
                        }
                    };
                    log::debug!("control connection from {addr}");
                    let config = Arc::clone(&config);
                    let registry = Arc::clone(&self.registry);
                    let port_allocator = Arc::clone(&self.port_allocator);
                    let task = tokio::spawn(async move {
                        if let Err(e) = control::handle_control_connection(socket, config, registry, port_allocator).await {
                            log::error!("control connection from {addr} ended with error: {e}");
                        }
                    });
                    connection_tasks.retain(|t| !t.is_finished());
                    connection_tasks.push(task);
                }
                reason = &mut shutdown => {
                    log::info!("shutdown requested, closing control listener");
                    break reason;
                }
            }
        };

        self.shutdown_all_sessions();
        // Each session's own control-read loop notices the shutdown request
        // and runs its normal teardown (control-read task exit, public
        // listener close, stream-pump abort, registry/port release); wait
        // for that to actually happen rather than returning with sessions
        // still torn down only in appearance.
        for task in connection_tasks {
            let _ = task.await;
        }
        Ok(reason)
    }

    /// Request every live session's control-read loop to stop and tear
    /// itself down. Does not itself touch the registry/port allocator —
    /// that happens once, in `control::handle_control_connection`'s own
    /// teardown path, when each loop notices the request.
    fn shutdown_all_sessions(&self) {
        for session in self.registry.get_all() {
            log::info!("requesting shutdown for session {}", session.agent_id);
            session.request_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_inverted_port_range() {
        let args = BrokerArgs {
            bind: "0.0.0.0".to_string(),
            control: 7000,
            port_min: 11000,
            port_max: 10000,
            token: "t".to_string(),
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_token() {
        let args = BrokerArgs {
            bind: "0.0.0.0".to_string(),
            control: 7000,
            port_min: 10000,
            port_max: 11000,
            token: String::new(),
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn validate_accepts_sane_defaults() {
        let args = BrokerArgs {
            bind: "0.0.0.0".to_string(),
            control: 7000,
            port_min: 10000,
            port_max: 11000,
            token: "t".to_string(),
        };
        assert!(args.validate().is_ok());
    }
}
