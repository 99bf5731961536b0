//! Per-agent session state: control channel handle and stream table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use crate::stream_state::StreamState;

/// Per-stream bookkeeping held by the owning session.
///
/// `write_tx` feeds the stream's external-socket writer task; dropping it
/// (via [`AgentSession::remove_stream`]) is what tears the writer down.
/// `reader_abort`/`writer_abort` cancel the stream's two relay-pump tasks
/// outright, so a forced session teardown doesn't have to wait for their
/// sockets to notice the world going away.
#[derive(Debug)]
pub struct StreamHandle {
    /// Channel into the stream's external-socket writer task.
    pub write_tx: mpsc::Sender<Vec<u8>>,
    /// Current lifecycle stage, for diagnostics and tests.
    pub state: StreamState,
    /// Abort handle for this stream's external-socket read pump.
    pub reader_abort: AbortHandle,
    /// Abort handle for this stream's external-socket write pump.
    pub writer_abort: AbortHandle,
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.reader_abort.abort();
        self.writer_abort.abort();
    }
}

/// All broker-side state for one connected agent: its immutable identity,
/// a handle to its control-channel writer, and its exclusively-owned
/// stream table.
#[derive(Debug)]
pub struct AgentSession {
    /// Server-generated opaque identifier.
    pub agent_id: String,
    /// Shared token the agent authenticated with.
    pub token: String,
    /// Local host the agent declared it will dial on `OPEN`.
    pub local_host: String,
    /// Local port the agent declared it will dial on `OPEN`.
    pub local_port: u16,
    /// Public port leased for this session.
    pub public_port: u16,
    /// Sender into the control socket's single writer task; this is the
    /// serialization point required by the concurrency model, since
    /// multiple stream tasks may emit `OPEN`/`DATA`/`CLOSE` concurrently.
    control_tx: mpsc::UnboundedSender<Vec<u8>>,
    streams: Mutex<HashMap<u32, StreamHandle>>,
    next_stream_id: AtomicU32,
    /// Broadcasts a one-way shutdown request to this session's control-read
    /// loop; cooperative cancellation lets the loop run its own teardown
    /// instead of being force-aborted mid-write.
    shutdown_tx: watch::Sender<bool>,
}

impl AgentSession {
    /// Construct a session around an already-negotiated control channel.
    pub fn new(
        agent_id: String,
        token: String,
        local_host: String,
        local_port: u16,
        public_port: u16,
        control_tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            agent_id,
            token,
            local_host,
            local_port,
            public_port,
            control_tx,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(1),
            shutdown_tx,
        }
    }

    /// Ask this session's control-read loop to stop at its next
    /// opportunity and run its normal teardown path.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Subscribe to this session's shutdown request.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Send an already-encoded frame over the control channel.
    ///
    /// Returns `false` if the control writer task has shut down, meaning
    /// the session is tearing down or already torn down.
    pub fn send_control_frame(&self, bytes: Vec<u8>) -> bool {
        self.control_tx.send(bytes).is_ok()
    }

    /// Allocate the next stream id, wrapping at `2^32` and skipping ids
    /// that are still live in the stream table.
    pub fn next_stream_id(&self) -> u32 {
        loop {
            let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
            // 0 is reserved for HELLO/WELCOME; never hand it out as a stream id.
            if id == 0 {
                continue;
            }
            if !self.streams.lock().expect("stream table mutex poisoned").contains_key(&id) {
                return id;
            }
        }
    }

    /// Record a newly accepted stream.
    pub fn insert_stream(&self, stream_id: u32, handle: StreamHandle) {
        self.streams
            .lock()
            .expect("stream table mutex poisoned")
            .insert(stream_id, handle);
    }

    /// Remove and return a stream's handle, if it was live.
    pub fn remove_stream(&self, stream_id: u32) -> Option<StreamHandle> {
        self.streams.lock().expect("stream table mutex poisoned").remove(&stream_id)
    }

    /// Get the writer channel for a live stream, without removing it.
    pub fn stream_write_tx(&self, stream_id: u32) -> Option<mpsc::Sender<Vec<u8>>> {
        self.streams
            .lock()
            .expect("stream table mutex poisoned")
            .get(&stream_id)
            .map(|h| h.write_tx.clone())
    }

    /// True if the stream table has any live entries.
    pub fn has_streams(&self) -> bool {
        !self.streams.lock().expect("stream table mutex poisoned").is_empty()
    }

    /// Ids of all currently live streams (used for session-wide teardown).
    pub fn stream_ids(&self) -> Vec<u32> {
        self.streams.lock().expect("stream table mutex poisoned").keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session() -> AgentSession {
        let (tx, _rx) = mpsc::unbounded_channel();
        AgentSession::new(
            "agent-1".to_string(),
            "tok".to_string(),
            "127.0.0.1".to_string(),
            9,
            10100,
            tx,
        )
    }

    /// A pair of abort handles for throwaway tasks, standing in for a real
    /// stream's reader/writer pumps in tests that don't drive any I/O.
    fn dummy_abort_handles() -> (AbortHandle, AbortHandle) {
        (tokio::spawn(async {}).abort_handle(), tokio::spawn(async {}).abort_handle())
    }

    #[tokio::test]
    async fn stream_id_assignment_skips_live_ids() {
        let session = new_session();
        let (write_tx, _rx) = mpsc::channel(1);
        let (reader_abort, writer_abort) = dummy_abort_handles();
        let id1 = session.next_stream_id();
        session.insert_stream(
            id1,
            StreamHandle {
                write_tx: write_tx.clone(),
                state: StreamState::Opening,
                reader_abort,
                writer_abort,
            },
        );
        let id2 = session.next_stream_id();
        assert_ne!(id1, id2);
    }

    #[tokio::test]
    async fn remove_stream_returns_handle_and_clears_table() {
        let session = new_session();
        let (write_tx, _rx) = mpsc::channel(1);
        let (reader_abort, writer_abort) = dummy_abort_handles();
        let id = session.next_stream_id();
        session.insert_stream(
            id,
            StreamHandle {
                write_tx,
                state: StreamState::Open,
                reader_abort,
                writer_abort,
            },
        );
        assert!(session.has_streams());
        assert!(session.remove_stream(id).is_some());
        assert!(!session.has_streams());
        assert!(session.remove_stream(id).is_none());
    }

    #[tokio::test]
    async fn removing_a_stream_aborts_its_pump_tasks() {
        let session = new_session();
        let (write_tx, _rx) = mpsc::channel(1);
        let reader_task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        let writer_task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        let id = session.next_stream_id();
        session.insert_stream(
            id,
            StreamHandle {
                write_tx,
                state: StreamState::Open,
                reader_abort: reader_task.abort_handle(),
                writer_abort: writer_task.abort_handle(),
            },
        );
        session.remove_stream(id);
        assert!(reader_task.await.unwrap_err().is_cancelled());
        assert!(writer_task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn request_shutdown_notifies_subscriber() {
        let session = new_session();
        let mut rx = session.shutdown_signal();
        session.request_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
