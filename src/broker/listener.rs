//! Public-facing listener: one per session, bound to the session's leased port.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::codec::{encode_close, encode_data, encode_open};
use crate::stream_state::StreamState;

use super::session::{AgentSession, StreamHandle};

/// Chunk size for reads off the public socket (spec's 4-64 KiB tuning range).
const CHUNK_SIZE: usize = 64 * 1024;

/// Bounded channel capacity for the per-stream writer task; provides
/// backpressure if the agent sends `DATA` faster than the public socket
/// can absorb it.
const WRITE_CHANNEL_BOUND: usize = 32;

/// A running public listener for one session's leased port.
#[derive(Debug)]
pub struct PublicListener {
    accept_handle: JoinHandle<()>,
}

impl PublicListener {
    /// Bind `bind_addr:public_port`, without yet accepting connections.
    ///
    /// Binding is split from [`PublicListener::spawn`] so a caller can send
    /// `WELCOME` on the control channel in between: the accept loop must
    /// not exist (and so cannot enqueue an `OPEN` frame) before `WELCOME`
    /// has already been enqueued ahead of it.
    ///
    /// # Errors
    ///
    /// Fails if the OS refuses the bind (e.g. `EADDRINUSE`); the caller is
    /// responsible for releasing the port lease on failure.
    pub async fn bind(bind_addr: &str, public_port: u16) -> anyhow::Result<TcpListener> {
        let listener = TcpListener::bind((bind_addr, public_port)).await?;
        log::info!("public listener bound on {bind_addr}:{public_port}");
        Ok(listener)
    }

    /// Spawn the accept loop over an already-bound listener.
    pub fn spawn(listener: TcpListener, session: Arc<AgentSession>) -> Self {
        let accept_handle = tokio::spawn(accept_loop(listener, session));
        Self { accept_handle }
    }

    /// Stop accepting new connections on this port.
    pub fn shutdown(&self) {
        self.accept_handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, session: Arc<AgentSession>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                log::debug!("accepted external connection from {addr} for agent {}", session.agent_id);
                handle_accepted(stream, Arc::clone(&session));
            }
            Err(e) => {
                log::error!("public listener accept error for agent {}: {e}", session.agent_id);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Record the new stream, emit `OPEN`, and spawn its relay pump.
fn handle_accepted(stream: TcpStream, session: Arc<AgentSession>) {
    let stream_id = session.next_stream_id();
    let (read_half, write_half) = stream.into_split();
    let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(WRITE_CHANNEL_BOUND);

    let writer_handle = tokio::spawn(writer_task(write_half, write_rx, stream_id));
    let reader_handle = tokio::spawn(external_read_pump(read_half, Arc::clone(&session), stream_id));

    session.insert_stream(
        stream_id,
        StreamHandle {
            write_tx,
            state: StreamState::Opening,
            reader_abort: reader_handle.abort_handle(),
            writer_abort: writer_handle.abort_handle(),
        },
    );

    let open_frame = match encode_open(stream_id) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("failed to encode OPEN for stream {stream_id}: {e}");
            session.remove_stream(stream_id);
            return;
        }
    };
    if !session.send_control_frame(open_frame) {
        // The control writer is gone, so this session's control socket is
        // dead even though the read side may not have noticed yet. Don't
        // just drop this one stream: request a full session teardown so
        // `accept_loop` stops accepting (and silently dropping) further
        // connections on a session that can no longer reach its agent.
        log::warn!(
            "control channel closed for agent {}, requesting session teardown before OPEN could be sent for stream {stream_id}",
            session.agent_id
        );
        session.remove_stream(stream_id);
        session.request_shutdown();
    }
}

/// Drains `write_rx` (DATA payloads routed from the agent) into the public
/// socket's write half.
async fn writer_task(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    stream_id: u32,
) {
    while let Some(data) = write_rx.recv().await {
        if let Err(e) = write_half.write_all(&data).await {
            log::debug!("write error on external stream {stream_id}: {e}");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// External-side relay pump: reads from the public socket, wraps as `DATA`,
/// writes to the control channel. EOF/error sends `CLOSE`; the stream entry
/// itself is torn down only once the agent's answering `CLOSE` arrives, so
/// an in-flight reply can still be delivered.
async fn external_read_pump(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    session: Arc<AgentSession>,
    stream_id: u32,
) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                log::debug!("external stream {stream_id} read EOF");
                break;
            }
            Ok(n) => match encode_data(stream_id, &buf[..n]) {
                Ok(frame) => {
                    if !session.send_control_frame(frame) {
                        log::warn!("control channel closed while relaying stream {stream_id}");
                        break;
                    }
                }
                Err(e) => {
                    log::error!("failed to encode DATA for stream {stream_id}: {e}");
                    break;
                }
            },
            Err(e) => {
                log::debug!("external stream {stream_id} read error: {e}");
                break;
            }
        }
    }

    // Only notify the agent; don't remove the stream here. The agent may
    // still be relaying an in-flight reply into this stream's writer task,
    // and that channel's sender only disappears once the agent's own
    // CLOSE (sent after *its* local read reaches EOF) is processed below.
    if let Ok(frame) = encode_close(stream_id) {
        session.send_control_frame(frame);
    }
}
