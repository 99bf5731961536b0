//! Broker-side handler for one inbound agent control connection.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::protocol::codec::{decode_hello, encode_close, encode_welcome};
use crate::protocol::frame::message_type;
use crate::protocol::{FrameDecoder, ProtocolError};

use super::listener::PublicListener;
use super::port_allocator::PortAllocator;
use super::registry::SessionRegistry;
use super::session::AgentSession;

/// Read buffer size for the control socket.
const READ_CHUNK: usize = 8192;

/// Shared configuration the control handler needs for every connection.
#[derive(Debug, Clone)]
pub struct ControlHandlerConfig {
    /// Expected authentication token.
    pub token: String,
    /// Address the per-session public listener binds to.
    pub bind_addr: String,
}

/// Drive one inbound control connection end-to-end: handshake,
/// registration, and the control-read loop until EOF or error.
///
/// Never returns an `Err` for conditions the protocol defines as "close the
/// socket silently" (bad token, port exhaustion, bind failure) — those are
/// logged and the function returns `Ok(())`, mirroring spec §7's policy
/// that these never propagate past the connection.
pub async fn handle_control_connection(
    socket: TcpStream,
    config: Arc<ControlHandlerConfig>,
    registry: Arc<SessionRegistry>,
    port_allocator: Arc<PortAllocator>,
) -> anyhow::Result<()> {
    let (mut read_half, write_half) = socket.into_split();
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    let hello_frame = match read_until_first_frame(&mut read_half, &mut decoder, &mut buf).await? {
        Some(frame) => frame,
        None => return Ok(()), // EOF before any frame arrived
    };

    if hello_frame.frame_type != message_type::HELLO {
        log::warn!("{}; closing", ProtocolError::UnexpectedFirstFrame(hello_frame.frame_type));
        return Ok(());
    }
    let hello = decode_hello(&hello_frame.payload)?;

    if !constant_time_eq(hello.token.as_bytes(), config.token.as_bytes()) {
        log::warn!("authentication failed: invalid token");
        return Ok(());
    }

    let public_port = match port_allocator.allocate() {
        Ok(port) => port,
        Err(e) => {
            log::error!("registration failed: {e}");
            return Ok(());
        }
    };

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let writer_handle = tokio::spawn(control_writer_task(write_half, control_rx));

    let agent_id = uuid::Uuid::new_v4().to_string();
    let session = Arc::new(AgentSession::new(
        agent_id.clone(),
        hello.token,
        hello.local_host,
        hello.local_port,
        public_port,
        control_tx,
    ));

    // Bind without yet accepting connections: the accept loop must not
    // exist (and so cannot enqueue an OPEN) until WELCOME has already been
    // enqueued ahead of it on the control channel.
    let tcp_listener = match PublicListener::bind(&config.bind_addr, public_port).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("failed to bind public listener for agent {agent_id}: {e}");
            port_allocator.release(public_port);
            writer_handle.abort();
            return Ok(());
        }
    };

    registry.insert(Arc::clone(&session));

    let welcome = encode_welcome(public_port)?;
    if !session.send_control_frame(welcome) {
        log::error!("control writer gone before WELCOME could be sent for agent {agent_id}");
        registry.remove(&agent_id);
        port_allocator.release(public_port);
        writer_handle.abort();
        return Ok(());
    }
    log::info!(
        "agent {agent_id} registered: local={}:{}, public_port={public_port}",
        session.local_host, session.local_port
    );

    let listener = PublicListener::spawn(tcp_listener, Arc::clone(&session));

    control_read_loop(&mut read_half, &mut decoder, &mut buf, &session).await;

    teardown_session(&agent_id, &session, &listener, &registry, &port_allocator);
    writer_handle.abort();
    Ok(())
}

/// Read frames until one arrives, or return `None` on EOF first.
async fn read_until_first_frame(
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
    decoder: &mut FrameDecoder,
    buf: &mut [u8],
) -> anyhow::Result<Option<crate::protocol::Frame>> {
    loop {
        let n = read_half.read(buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let mut frames = decoder.feed(&buf[..n])?;
        if !frames.is_empty() {
            return Ok(Some(frames.remove(0)));
        }
    }
}

/// Dispatch `DATA`/`CLOSE` frames from the agent until the control socket
/// is closed, errors, or a session-wide shutdown is requested.
async fn control_read_loop(
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
    decoder: &mut FrameDecoder,
    buf: &mut [u8],
    session: &Arc<AgentSession>,
) {
    let mut shutdown_rx = session.shutdown_signal();
    loop {
        let n = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                log::info!("session {} shutdown requested, tearing down", session.agent_id);
                return;
            }
            result = read_half.read(buf) => match result {
                Ok(0) => {
                    log::info!("control socket EOF for agent {}", session.agent_id);
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    log::warn!("control socket error for agent {}: {e}", session.agent_id);
                    return;
                }
            },
        };

        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                log::error!("protocol violation on control socket for agent {}: {e}", session.agent_id);
                return;
            }
        };

        for frame in frames {
            match frame.frame_type {
                message_type::DATA => handle_data_frame(session, frame.stream_id, frame.payload).await,
                message_type::CLOSE => {
                    session.remove_stream(frame.stream_id);
                    log::debug!("stream {} closed by agent {}", frame.stream_id, session.agent_id);
                }
                other => {
                    log::warn!("unexpected frame type {other} from agent {}, ignoring", session.agent_id);
                }
            }
        }
    }
}

/// Relay `DATA(id, bytes)` to the matching external stream's writer.
///
/// Awaits the bounded channel send so a slow external socket backpressures
/// the control read loop, preserving exact byte ordering — this is why
/// `try_send`-and-drop (as used for best-effort relays elsewhere) is wrong
/// here: the spec requires no data loss on a live stream.
async fn handle_data_frame(session: &Arc<AgentSession>, stream_id: u32, payload: Vec<u8>) {
    let Some(write_tx) = session.stream_write_tx(stream_id) else {
        log::debug!("DATA for unknown stream {stream_id}, replying CLOSE");
        if let Ok(frame) = encode_close(stream_id) {
            session.send_control_frame(frame);
        }
        return;
    };
    if write_tx.send(payload).await.is_err() {
        session.remove_stream(stream_id);
        if let Ok(frame) = encode_close(stream_id) {
            session.send_control_frame(frame);
        }
    }
}

fn teardown_session(
    agent_id: &str,
    session: &Arc<AgentSession>,
    listener: &PublicListener,
    registry: &Arc<SessionRegistry>,
    port_allocator: &Arc<PortAllocator>,
) {
    listener.shutdown();
    for stream_id in session.stream_ids() {
        session.remove_stream(stream_id);
    }
    registry.remove(agent_id);
    port_allocator.release(session.public_port);
    log::info!("session {agent_id} torn down, released port {}", session.public_port);
}

/// Drains the control-frame channel into the control socket's write half.
///
/// This is the single serialization point for control-channel writes:
/// every task that wants to emit `OPEN`/`DATA`/`CLOSE` sends bytes here
/// instead of writing the socket directly.
async fn control_writer_task(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut control_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(bytes) = control_rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            log::debug!("control writer error: {e}");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Constant-time byte comparison, to avoid leaking token length/prefix
/// information through response-time side channels.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"secret", b"secret"));
    }

    #[test]
    fn constant_time_eq_rejects_mismatch() {
        assert!(!constant_time_eq(b"secret", b"wrong"));
        assert!(!constant_time_eq(b"secret", b"secre"));
    }
}
