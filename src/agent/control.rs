//! Agent-side control channel: handshake, `WELCOME` wait, and the
//! `OPEN`/`DATA`/`CLOSE` dispatch loop against the local service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::AgentError;
use crate::protocol::codec::{decode_welcome, encode_close, encode_data, encode_hello};
use crate::protocol::frame::message_type;
use crate::protocol::FrameDecoder;

/// Chunk size for reads off the local service socket.
const CHUNK_SIZE: usize = 64 * 1024;
/// Bounded channel capacity for a stream's local-socket writer task.
const WRITE_CHANNEL_BOUND: usize = 32;
/// Read buffer size for the control socket.
const READ_CHUNK: usize = 8192;

/// Configuration for one tunnel connection attempt.
#[derive(Debug, Clone)]
pub struct AgentConnectParams {
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

/// Live agent-side connection state: the control writer handle and the
/// table of locally-dialed streams.
struct AgentConnection {
    local_host: String,
    local_port: u16,
    control_tx: mpsc::UnboundedSender<Vec<u8>>,
    streams: Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>,
}

impl AgentConnection {
    fn send_control_frame(&self, bytes: Vec<u8>) -> bool {
        self.control_tx.send(bytes).is_ok()
    }

    fn insert_stream(&self, stream_id: u32, write_tx: mpsc::Sender<Vec<u8>>) {
        self.streams.lock().expect("stream table mutex poisoned").insert(stream_id, write_tx);
    }

    fn remove_stream(&self, stream_id: u32) -> Option<mpsc::Sender<Vec<u8>>> {
        self.streams.lock().expect("stream table mutex poisoned").remove(&stream_id)
    }

    fn stream_write_tx(&self, stream_id: u32) -> Option<mpsc::Sender<Vec<u8>>> {
        self.streams.lock().expect("stream table mutex poisoned").get(&stream_id).cloned()
    }
}

/// Connect to the broker, complete the handshake, and service frames until
/// the control channel closes.
///
/// # Errors
///
/// Returns [`AgentError::ConnectionFailed`] for transport-level failures
/// and [`AgentError::AuthenticationFailed`] when the control socket closes
/// before `WELCOME` — per spec, that is the only observable signal of a
/// rejected token.
pub async fn connect_and_run(params: AgentConnectParams) -> Result<(), AgentError> {
    let socket = TcpStream::connect((params.server_host.as_str(), params.server_port))
        .await
        .map_err(|e| AgentError::ConnectionFailed(e.to_string()))?;
    let (mut read_half, write_half) = socket.into_split();

    let hello = encode_hello(&params.token, &params.local_host, params.local_port)
        .map_err(|e| AgentError::ConnectionFailed(e.to_string()))?;

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let writer_handle = tokio::spawn(control_writer_task(write_half, control_rx));
    if control_tx.send(hello).is_err() {
        return Err(AgentError::ConnectionFailed("control writer task exited immediately".to_string()));
    }

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let public_port = wait_for_welcome(&mut read_half, &mut decoder, &mut buf).await?;
    log::info!("connected to {}:{}, public port {public_port}", params.server_host, params.server_port);

    let conn = Arc::new(AgentConnection {
        local_host: params.local_host,
        local_port: params.local_port,
        control_tx,
        streams: Mutex::new(HashMap::new()),
    });

    dispatch_loop(&mut read_half, &mut decoder, &mut buf, &conn).await;
    writer_handle.abort();
    Ok(())
}

/// Read frames until `WELCOME` arrives. Any pre-`WELCOME` close — for any
/// underlying reason — is surfaced as authentication failure, matching the
/// only behaviour observable over the wire.
async fn wait_for_welcome(
    read_half: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
    buf: &mut [u8],
) -> Result<u16, AgentError> {
    loop {
        let n = read_half
            .read(buf)
            .await
            .map_err(|_| AgentError::AuthenticationFailed)?;
        if n == 0 {
            return Err(AgentError::AuthenticationFailed);
        }
        let frames = decoder.feed(&buf[..n]).map_err(|_| AgentError::AuthenticationFailed)?;
        for frame in frames {
            if frame.frame_type == message_type::WELCOME {
                return decode_welcome(&frame.payload).map_err(|_| AgentError::AuthenticationFailed);
            }
            log::warn!("ignoring frame type {} received before WELCOME", frame.frame_type);
        }
    }
}

async fn dispatch_loop(
    read_half: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
    buf: &mut [u8],
    conn: &Arc<AgentConnection>,
) {
    loop {
        let n = match read_half.read(buf).await {
            Ok(0) => {
                log::info!("control socket EOF, shutting down");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                log::warn!("control socket error: {e}");
                return;
            }
        };

        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                log::error!("protocol violation on control socket: {e}");
                return;
            }
        };

        for frame in frames {
            match frame.frame_type {
                message_type::OPEN => handle_open(conn, frame.stream_id).await,
                message_type::DATA => handle_data(conn, frame.stream_id, frame.payload).await,
                message_type::CLOSE => {
                    conn.remove_stream(frame.stream_id);
                    log::debug!("stream {} closed by broker", frame.stream_id);
                }
                other => log::warn!("unexpected frame type {other}, ignoring"),
            }
        }
    }
}

async fn handle_open(conn: &Arc<AgentConnection>, stream_id: u32) {
    if conn.stream_write_tx(stream_id).is_some() {
        log::warn!("duplicate OPEN for existing stream {stream_id}, ignoring");
        return;
    }

    match TcpStream::connect((conn.local_host.as_str(), conn.local_port)).await {
        Ok(local_stream) => {
            let (read_half, write_half) = local_stream.into_split();
            let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_BOUND);
            conn.insert_stream(stream_id, write_tx);
            tokio::spawn(local_writer_task(write_half, write_rx, stream_id));
            tokio::spawn(local_read_pump(read_half, Arc::clone(conn), stream_id));
        }
        Err(e) => {
            log::warn!("failed to dial local service for stream {stream_id}: {e}");
            if let Ok(frame) = encode_close(stream_id) {
                conn.send_control_frame(frame);
            }
        }
    }
}

async fn handle_data(conn: &Arc<AgentConnection>, stream_id: u32, payload: Vec<u8>) {
    let Some(write_tx) = conn.stream_write_tx(stream_id) else {
        log::debug!("DATA for unknown/closed stream {stream_id}, ignoring");
        return;
    };
    if write_tx.send(payload).await.is_err() {
        conn.remove_stream(stream_id);
        if let Ok(frame) = encode_close(stream_id) {
            conn.send_control_frame(frame);
        }
    }
}

async fn local_writer_task(
    mut write_half: OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    stream_id: u32,
) {
    while let Some(data) = write_rx.recv().await {
        if let Err(e) = write_half.write_all(&data).await {
            log::debug!("write error on local stream {stream_id}: {e}");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Local-side relay pump: reads from the local service, wraps as `DATA`,
/// writes to the control channel. EOF/error sends `CLOSE` back to the
/// broker (agent-initiated close); the stream entry is torn down once the
/// broker's answering `CLOSE` arrives, so an in-flight reply isn't dropped.
async fn local_read_pump(mut read_half: OwnedReadHalf, conn: Arc<AgentConnection>, stream_id: u32) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                log::debug!("local stream {stream_id} read EOF");
                break;
            }
            Ok(n) => match encode_data(stream_id, &buf[..n]) {
                Ok(frame) => {
                    if !conn.send_control_frame(frame) {
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
                log::debug!("local stream {stream_id} read error: {e}");
                break;
            }
        }
    }

    // Only notify the broker; don't remove the stream here. The broker may
    // still be relaying an in-flight reply into this stream's writer task,
    // and that channel's sender only disappears once the broker's own
    // CLOSE (sent after *its* external read reaches EOF) is processed
    // above, in `dispatch_loop`.
    if let Ok(frame) = encode_close(stream_id) {
        conn.send_control_frame(frame);
    }
}

/// Drains the control-frame channel into the control socket's write half.
async fn control_writer_task(mut write_half: OwnedWriteHalf, mut control_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = control_rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            log::debug!("control writer error: {e}");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
