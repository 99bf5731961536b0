//! Domain error kinds that callers need to match on, distinct from the
//! `anyhow::Error` used everywhere else for context-carrying propagation.

use std::fmt;

/// Errors from the port allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortAllocatorError {
    /// No free port remained in the configured range.
    Exhausted {
        /// Lower bound of the configured range.
        port_min: u16,
        /// Upper bound of the configured range.
        port_max: u16,
    },
}

impl fmt::Display for PortAllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortAllocatorError::Exhausted { port_min, port_max } => {
                write!(f, "no free port in range [{port_min}, {port_max}]")
            }
        }
    }
}

impl std::error::Error for PortAllocatorError {}

/// Errors surfaced by the agent's control-channel handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The control socket closed before a `WELCOME` was received. Per the
    /// wire protocol this is indistinguishable from a wrong token, so it is
    /// always surfaced as an authentication failure.
    AuthenticationFailed,
    /// The broker is unreachable or the connection otherwise failed at the
    /// transport level.
    ConnectionFailed(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::AuthenticationFailed => {
                write!(f, "authentication failed: control socket closed before WELCOME")
            }
            AgentError::ConnectionFailed(msg) => write!(f, "connection failed: {msg}"),
        }
    }
}

impl std::error::Error for AgentError {}
