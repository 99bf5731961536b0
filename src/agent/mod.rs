//! Agent: dials the broker, authenticates, and services tunneled streams
//! against a configured local service.

pub mod config;
pub mod control;
