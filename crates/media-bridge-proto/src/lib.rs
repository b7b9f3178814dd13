//! Shared protocol primitives for `session-server` and `session-client`.
//!
//! Framed stream over a single Unix socket connection. Frames carry JSON
//! encoded calls, replies and asynchronous events, so one connection serves
//! any number of sessions.
//!
//! Frame format:
//! - magic: 4 bytes "MSBR" (once, at connection start)
//! - version: u16 LE (once, at connection start)
//! - then repeated frames:
//!   - kind: u8
//!   - len: u32 LE
//!   - payload: [u8; len]

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

pub mod channel;
pub mod messages;

pub use channel::{CallError, EventHandler, RemoteChannel, SubscriptionTag, TransportClient};
pub use messages::{CallEnvelope, Event, EventKind, ReplyEnvelope, Request, Response};

pub const MAGIC: [u8; 4] = *b"MSBR";
pub const VERSION: u16 = 1;

/// Socket used when neither side is told otherwise.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/media-bridge.sock";

/// Upper bound on a single payload; larger headers are treated as corruption.
pub const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Client → server: [`CallEnvelope`].
    Call = 0x10,
    /// Server → client: [`ReplyEnvelope`].
    Reply = 0x11,

    /// Server → client: asynchronous [`Event`].
    Event = 0x20,

    Error = 0x7F,
}

impl FrameKind {
    pub fn from_u8(b: u8) -> io::Result<Self> {
        let k = match b {
            0x10 => FrameKind::Call,
            0x11 => FrameKind::Reply,
            0x20 => FrameKind::Event,
            0x7F => FrameKind::Error,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown frame kind {b:#x}"),
                ))
            }
        };
        Ok(k)
    }
}

/// Connection prelude: magic + version.
pub fn write_prelude(mut w: impl Write) -> io::Result<()> {
    w.write_all(&MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    Ok(())
}

/// Read and validate the connection prelude.
pub fn read_prelude(mut r: impl Read) -> io::Result<()> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
    }

    let mut ver = [0u8; 2];
    r.read_exact(&mut ver)?;
    let version = u16::from_le_bytes(ver);
    if version != VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported version {version}"),
        ));
    }

    Ok(())
}

/// Encode a frame into a single buffer (header + payload).
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;

    let mut out = Vec::with_capacity(1 + 4 + payload.len());
    out.push(kind as u8);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Write a frame header + payload with a single `write_all`.
pub fn write_frame(mut w: impl Write, kind: FrameKind, payload: &[u8]) -> io::Result<()> {
    let frame = encode_frame(kind, payload)?;
    w.write_all(&frame)?;
    w.flush()
}

/// Read a frame header and return `(kind, len)`.
pub fn read_frame_header(mut r: impl Read) -> io::Result<(FrameKind, u32)> {
    let mut kindb = [0u8; 1];
    r.read_exact(&mut kindb)?;
    let kind = FrameKind::from_u8(kindb[0])?;

    let mut lenb = [0u8; 4];
    r.read_exact(&mut lenb)?;
    let len = u32::from_le_bytes(lenb);
    if len > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        ));
    }
    Ok((kind, len))
}

/// Read a whole frame, returning its kind and payload.
pub fn read_frame(mut r: impl Read) -> io::Result<(FrameKind, Vec<u8>)> {
    let (kind, len) = read_frame_header(&mut r)?;
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok((kind, payload))
}

/// Serialize `value` as JSON and write it as one frame.
pub fn write_json_frame<T: Serialize>(w: impl Write, kind: FrameKind, value: &T) -> io::Result<()> {
    let payload = serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    write_frame(w, kind, &payload)
}

/// Decode a JSON frame payload.
pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> io::Result<T> {
    serde_json::from_slice(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_bridge_types::SessionId;
    use std::io::Cursor;

    #[test]
    fn prelude_roundtrip_ok() {
        let mut buf = Vec::new();
        write_prelude(&mut buf).unwrap();
        let mut cur = Cursor::new(buf);
        read_prelude(&mut cur).unwrap();
    }

    #[test]
    fn prelude_rejects_bad_magic() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"NOPE");
        buf.extend_from_slice(&VERSION.to_le_bytes());
        let mut cur = Cursor::new(buf);
        let err = read_prelude(&mut cur).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn prelude_rejects_bad_version() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&(VERSION + 1).to_le_bytes());
        let mut cur = Cursor::new(buf);
        let err = read_prelude(&mut cur).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn frame_kind_rejects_unknown() {
        let err = FrameKind::from_u8(0x99).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn read_frame_rejects_oversized_header() {
        let mut buf = vec![FrameKind::Call as u8];
        buf.extend_from_slice(&(MAX_PAYLOAD + 1).to_le_bytes());
        let err = read_frame(Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn read_frame_reports_truncated_payload() {
        let mut frame = encode_frame(FrameKind::Event, b"abcdef").unwrap();
        frame.truncate(frame.len() - 2);
        let err = read_frame(Cursor::new(frame)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn json_frame_carries_call_envelope() {
        let call = CallEnvelope {
            call_id: 42,
            request: Request::Play { session_id: SessionId(3) },
        };
        let mut buf = Vec::new();
        write_json_frame(&mut buf, FrameKind::Call, &call).unwrap();

        let (kind, payload) = read_frame(Cursor::new(buf)).unwrap();
        assert_eq!(kind, FrameKind::Call);
        let decoded: CallEnvelope = decode_json(&payload).unwrap();
        assert_eq!(decoded, call);
    }

    #[test]
    fn decode_json_maps_garbage_to_invalid_data() {
        let err = decode_json::<ReplyEnvelope>(b"{not json").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
