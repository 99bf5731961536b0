//! Per-stream lifecycle, shared conceptually by both broker and agent sides.
//!
//! A stream transitions `Opening -> Open -> Closing -> Closed`. Removal from
//! a session's stream table *is* the `Closed` state — there is no tombstone
//! kept around, so the closed/absent notions coincide.

/// Lifecycle stage of one multiplexed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Accepted (broker) or dial in flight (agent); not yet passing data.
    Opening,
    /// Bidirectional `DATA` flows.
    Open,
    /// One side has observed EOF/error and sent `CLOSE`; teardown under way.
    Closing,
}
