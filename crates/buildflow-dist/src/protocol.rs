//! Wire protocol between coordinator and workers.
//!
//! Message framing: one type byte, a 4-byte big-endian payload length, then
//! the payload encoded with the shared binary codec. Length-prefixed framing
//! allows streaming over a plain TCP connection; TLS is an orthogonal
//! wrapper. The Registration message carries a magic and protocol version so
//! incompatible peers fail fast.

use crate::registry::WorkerCapabilities;
use buildflow_core::{codec, Action, ActionResult, Digest, Error, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Identifies the buildflow worker protocol in Registration.
pub const PROTOCOL_MAGIC: u32 = 0x424C_4450; // "BLDP"
/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound for a single frame; a peer announcing more is corrupt or
/// hostile.
const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

/// First message on every connection, worker -> coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub magic: u32,
    pub protocol_version: u8,
    pub worker_id: String,
    pub capabilities: WorkerCapabilities,
    /// Concurrent actions this worker will run.
    pub capacity: u32,
}

/// Periodic liveness signal, worker -> coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartBeat {
    pub worker_id: String,
    /// Load factor in [0.0, 1.0].
    pub load: f64,
    /// Actions queued locally on the worker.
    pub queue_depth: u32,
}

/// Worker asks for up to `capacity` more actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub worker_id: String,
    pub capacity: u32,
}

/// Coordinator hands one action to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: Action,
    /// Zero-based retry attempt.
    pub attempt: u32,
}

/// Worker reports one finished action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    pub worker_id: String,
    pub fingerprint: Digest,
    pub result: ActionResult,
}

/// Coordinator tells peers about a worker (steal routing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAnnounce {
    pub worker_id: String,
    pub addr: String,
}

/// Ask a loaded worker to give up queued actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StealRequest {
    pub thief_id: String,
    /// Upper bound on actions to hand over.
    pub max_actions: u32,
}

/// Stolen actions, taken from the back of the victim's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StealResponse {
    pub actions: Vec<Action>,
}

/// Orderly connection teardown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shutdown {
    pub reason: String,
}

/// Every frame that can cross the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Registration(Registration),
    HeartBeat(HeartBeat),
    WorkRequest(WorkRequest),
    ActionRequest(ActionRequest),
    ActionResult(ActionReport),
    PeerAnnounce(PeerAnnounce),
    StealRequest(StealRequest),
    StealResponse(StealResponse),
    Shutdown(Shutdown),
}

impl Message {
    fn type_byte(&self) -> u8 {
        match self {
            Message::Registration(_) => 1,
            Message::HeartBeat(_) => 2,
            Message::WorkRequest(_) => 3,
            Message::ActionRequest(_) => 4,
            Message::ActionResult(_) => 5,
            Message::PeerAnnounce(_) => 6,
            Message::StealRequest(_) => 7,
            Message::StealResponse(_) => 8,
            Message::Shutdown(_) => 9,
        }
    }

    fn payload(&self) -> Result<Vec<u8>> {
        match self {
            Message::Registration(m) => codec::encode(m),
            Message::HeartBeat(m) => codec::encode(m),
            Message::WorkRequest(m) => codec::encode(m),
            Message::ActionRequest(m) => codec::encode(m),
            Message::ActionResult(m) => codec::encode(m),
            Message::PeerAnnounce(m) => codec::encode(m),
            Message::StealRequest(m) => codec::encode(m),
            Message::StealResponse(m) => codec::encode(m),
            Message::Shutdown(m) => codec::encode(m),
        }
    }
}

/// Write one framed message.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let payload = message.payload()?;
    if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(Error::Transport(format!(
            "outgoing frame of {} bytes exceeds protocol bound",
            payload.len()
        )));
    }
    writer
        .write_u8(message.type_byte())
        .await
        .map_err(|e| Error::Transport(format!("write frame type: {e}")))?;
    writer
        .write_u32(payload.len() as u32)
        .await
        .map_err(|e| Error::Transport(format!("write frame length: {e}")))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|e| Error::Transport(format!("write frame payload: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Transport(format!("flush frame: {e}")))?;
    Ok(())
}

/// Read one framed message. Returns `None` on a clean EOF at a frame
/// boundary.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let type_byte = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Transport(format!("read frame type: {e}"))),
    };
    let len = reader
        .read_u32()
        .await
        .map_err(|e| Error::Transport(format!("read frame length: {e}")))?;
    if len > MAX_FRAME_BYTES {
        return Err(Error::Transport(format!(
            "incoming frame of {len} bytes exceeds protocol bound"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Transport(format!("read frame payload: {e}")))?;

    let message = match type_byte {
        1 => Message::Registration(decode_frame(&payload)?),
        2 => Message::HeartBeat(decode_frame(&payload)?),
        3 => Message::WorkRequest(decode_frame(&payload)?),
        4 => Message::ActionRequest(decode_frame(&payload)?),
        5 => Message::ActionResult(decode_frame(&payload)?),
        6 => Message::PeerAnnounce(decode_frame(&payload)?),
        7 => Message::StealRequest(decode_frame(&payload)?),
        8 => Message::StealResponse(decode_frame(&payload)?),
        9 => Message::Shutdown(decode_frame(&payload)?),
        other => {
            return Err(Error::Transport(format!("unknown frame type {other}")));
        }
    };
    Ok(Some(message))
}

fn decode_frame<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    // A malformed payload is a transport-level failure, not cache corruption.
    codec::decode(payload).map_err(|e| Error::Transport(format!("decode frame: {e}")))
}

/// Validate the opening Registration of a connection.
pub fn validate_registration(registration: &Registration) -> Result<()> {
    if registration.magic != PROTOCOL_MAGIC {
        return Err(Error::Transport(format!(
            "bad protocol magic {:#010x}",
            registration.magic
        )));
    }
    if registration.protocol_version != PROTOCOL_VERSION {
        return Err(Error::Transport(format!(
            "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
            registration.protocol_version
        )));
    }
    Ok(())
}
