//! Agent configuration: CLI flags, validation, and optional persisted
//! connection state (excluding the token).

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line flags for the agent process.
#[derive(Debug, Parser)]
#[command(name = "tunnelcraft-agent", about = "NAT-side reverse tunnel agent")]
pub struct AgentArgs {
    /// Broker host to dial.
    #[arg(long = "server-host")]
    pub server_host: Option<String>,

    /// Broker control port.
    #[arg(long = "server-port")]
    pub server_port: Option<u16>,

    /// Shared authentication token. May also be set via `TUNNEL_AGENT_TOKEN`.
    #[arg(long)]
    pub token: Option<String>,

    /// Local service host to dial on `OPEN`.
    #[arg(long = "local-host")]
    pub local_host: Option<String>,

    /// Local service port to dial on `OPEN`.
    #[arg(long = "local-port")]
    pub local_port: Option<u16>,

    /// Override the persisted-state file location (mainly for tests).
    #[arg(long = "state-file")]
    pub state_file: Option<PathBuf>,
}

/// Validated agent configuration, ready to hand to
/// [`crate::agent::control::connect_and_run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Broker host to dial.
    pub server_host: String,
    /// Broker control port.
    pub server_port: u16,
    /// Shared authentication token.
    pub token: String,
    /// Local service host to dial on `OPEN`.
    pub local_host: String,
    /// Local service port to dial on `OPEN`.
    pub local_port: u16,
}

impl AgentConfig {
    /// Validate the required-field and port-range rules.
    ///
    /// # Errors
    ///
    /// Fails if `token`, `server_host`, or `local_host` is empty, or if
    /// either port is `0`.
    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            bail!("token must not be empty");
        }
        if self.server_host.is_empty() {
            bail!("server_host must not be empty");
        }
        if self.local_host.is_empty() {
            bail!("local_host must not be empty");
        }
        if self.server_port == 0 {
            bail!("server_port must be in 1..=65535");
        }
        if self.local_port == 0 {
            bail!("local_port must be in 1..=65535");
        }
        Ok(())
    }
}

/// Fields of [`AgentConfig`] safe to persist to disk: everything except the
/// token, mirroring the original client's explicit exclusion of the secret
/// from its saved connection profile.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedConnection {
    /// Broker host, if previously used.
    pub server_host: Option<String>,
    /// Broker control port, if previously used.
    pub server_port: Option<u16>,
    /// Local service host, if previously used.
    pub local_host: Option<String>,
    /// Local service port, if previously used.
    pub local_port: Option<u16>,
}

impl PersistedConnection {
    /// Default on-disk location: `<config_dir>/tunnelcraft-agent/agent.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tunnelcraft-agent").join("agent.json"))
    }

    /// Load persisted connection fields, if the file exists and parses.
    pub fn load(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Persist connection fields (never the token) to `path`, creating
    /// parent directories as needed.
    pub fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Overlay `self` onto an [`AgentArgs`], filling any flags the user
    /// didn't pass on the command line.
    pub fn merge_into(&self, args: &mut AgentArgs) {
        if args.server_host.is_none() {
            args.server_host = self.server_host.clone();
        }
        if args.server_port.is_none() {
            args.server_port = self.server_port;
        }
        if args.local_host.is_none() {
            args.local_host = self.local_host.clone();
        }
        if args.local_port.is_none() {
            args.local_port = self.local_port;
        }
    }
}

impl From<&AgentConfig> for PersistedConnection {
    fn from(config: &AgentConfig) -> Self {
        Self {
            server_host: Some(config.server_host.clone()),
            server_port: Some(config.server_port),
            local_host: Some(config.local_host.clone()),
            local_port: Some(config.local_port),
        }
    }
}

/// Resolve CLI flags plus the `TUNNEL_AGENT_TOKEN` environment override
/// into a validated [`AgentConfig`].
///
/// # Errors
///
/// Fails if a required field is missing after merging persisted state and
/// environment overrides, or if [`AgentConfig::validate`] rejects the result.
pub fn resolve(args: AgentArgs) -> Result<AgentConfig> {
    let token = args
        .token
        .or_else(|| std::env::var("TUNNEL_AGENT_TOKEN").ok())
        .ok_or_else(|| anyhow::anyhow!("--token (or TUNNEL_AGENT_TOKEN) is required"))?;

    let config = AgentConfig {
        server_host: args.server_host.ok_or_else(|| anyhow::anyhow!("--server-host is required"))?,
        server_port: args.server_port.ok_or_else(|| anyhow::anyhow!("--server-port is required"))?,
        token,
        local_host: args.local_host.ok_or_else(|| anyhow::anyhow!("--local-host is required"))?,
        local_port: args.local_port.ok_or_else(|| anyhow::anyhow!("--local-port is required"))?,
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AgentConfig {
        AgentConfig {
            server_host: "example.com".to_string(),
            server_port: 7000,
            token: "secret".to_string(),
            local_host: "127.0.0.1".to_string(),
            local_port: 8080,
        }
    }

    #[test]
    fn validate_accepts_a_sane_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_token() {
        let mut config = valid_config();
        config.token.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_ports() {
        let mut config = valid_config();
        config.local_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn persisted_connection_round_trips_without_token() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("agent.json");

        let config = valid_config();
        let persisted = PersistedConnection::from(&config);
        persisted.save(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("secret"), "token must never be persisted");

        let loaded = PersistedConnection::load(&path).unwrap();
        assert_eq!(loaded.server_host, Some("example.com".to_string()));
        assert_eq!(loaded.local_port, Some(8080));
    }

    #[test]
    fn merge_into_only_fills_missing_fields() {
        let persisted = PersistedConnection {
            server_host: Some("from-disk.example".to_string()),
            server_port: Some(7000),
            local_host: Some("127.0.0.1".to_string()),
            local_port: Some(9000),
        };
        let mut args = AgentArgs {
            server_host: None,
            server_port: None,
            token: Some("t".to_string()),
            local_host: Some("explicit-host".to_string()),
            local_port: None,
            state_file: None,
        };
        persisted.merge_into(&mut args);
        assert_eq!(args.server_host, Some("from-disk.example".to_string()));
        assert_eq!(args.local_host, Some("explicit-host".to_string()));
        assert_eq!(args.local_port, Some(9000));
    }
}
