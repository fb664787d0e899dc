//! Wire protocol implementation for hytun.
//!
//! Stream frames use a TLV (Type-Length-Value) layout:
//! `type:u8 | length:varint | payload`. Once a `ConnectResponse` reports
//! success the stream carries unframed bytes. Unreliable datagrams carry
//! a [`UdpMessage`] each.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame type constants.
const FRAME_AUTH: u8 = 0x01;
const FRAME_AUTH_ACK: u8 = 0x02;
const FRAME_CONNECT_REQ: u8 = 0x03;
const FRAME_CONNECT_RESP: u8 = 0x04;
const FRAME_UDP_REQ: u8 = 0x05;
const FRAME_UDP_RESP: u8 = 0x06;

/// Protocol version carried in the auth frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// ALPN protocol identifier negotiated during the TLS handshake.
pub const DEFAULT_ALPN: &str = "hytun/1";

/// Maximum varint size in bytes (for u64).
const MAX_VARINT_SIZE: usize = 10;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Size of the fixed datagram header before the address.
const UDP_SESSION_ID_SIZE: usize = 4;

/// Protocol error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid frame type: {0:#x}")]
    InvalidFrameType(u8),

    #[error("varint overflow")]
    VarintOverflow,

    #[error("incomplete data")]
    IncompleteData,

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("unexpected frame: expected {expected}, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Wire protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client credentials and claimed bandwidth (client -> server, once).
    Auth {
        version: u8,
        up_bps: u64,
        down_bps: u64,
        token: Bytes,
    },
    /// Server verdict (server -> client, once).
    /// - up_bps: rate the server will send to the client
    /// - down_bps: rate the server accepts from the client
    AuthAck {
        accepted: bool,
        up_bps: u64,
        down_bps: u64,
        message: String,
    },
    /// Open a TCP connection to `addr` (client -> server, per stream).
    ConnectRequest { addr: String },
    /// Result of a connect request (server -> client, per stream).
    ConnectResponse { ok: bool, message: String },
    /// Allocate a datagram session (client -> server).
    UdpRequest,
    /// Result of a datagram session request (server -> client).
    UdpResponse {
        ok: bool,
        session_id: u32,
        message: String,
    },
}

/// Encode a u64 value as a varint.
///
/// Uses MSB as continuation flag, lower 7 bits for data.
pub fn encode_varint(mut value: u64, buf: &mut BytesMut) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a varint from a buffer.
///
/// Returns `Ok(None)` if there isn't enough data.
/// Returns `Err(VarintOverflow)` if the varint is too large.
pub fn decode_varint(buf: &mut &[u8]) -> ProtocolResult<Option<u64>> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;

    for i in 0..MAX_VARINT_SIZE {
        if buf.is_empty() {
            return Ok(None);
        }

        let byte = buf[0];
        *buf = &buf[1..];

        let value = (byte & 0x7F) as u64;

        if shift >= 64 || (shift == 63 && value > 1) {
            return Err(ProtocolError::VarintOverflow);
        }

        result |= value << shift;
        shift += 7;

        if byte & 0x80 == 0 {
            return Ok(Some(result));
        }

        if i == MAX_VARINT_SIZE - 1 {
            return Err(ProtocolError::VarintOverflow);
        }
    }

    Err(ProtocolError::VarintOverflow)
}

/// Calculate the encoded size of a varint.
fn varint_size(value: u64) -> usize {
    if value == 0 {
        return 1;
    }
    let bits = 64 - value.leading_zeros();
    bits.div_ceil(7) as usize
}

fn put_string(bytes: &[u8], buf: &mut BytesMut) {
    encode_varint(bytes.len() as u64, buf);
    buf.put_slice(bytes);
}

fn string_size(bytes: &[u8]) -> usize {
    varint_size(bytes.len() as u64) + bytes.len()
}

fn take_u8(buf: &mut &[u8]) -> ProtocolResult<u8> {
    let (&b, rest) = buf.split_first().ok_or(ProtocolError::IncompleteData)?;
    *buf = rest;
    Ok(b)
}

fn take_varint(buf: &mut &[u8]) -> ProtocolResult<u64> {
    decode_varint(buf)?.ok_or(ProtocolError::IncompleteData)
}

fn take_bytes<'a>(buf: &mut &'a [u8]) -> ProtocolResult<&'a [u8]> {
    let len = take_varint(buf)? as usize;
    if buf.len() < len {
        return Err(ProtocolError::IncompleteData);
    }
    let (head, rest) = buf.split_at(len);
    *buf = rest;
    Ok(head)
}

fn take_string(buf: &mut &[u8]) -> ProtocolResult<String> {
    let raw = take_bytes(buf)?;
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

impl Frame {
    /// Returns a human-readable name for the frame type.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Auth { .. } => "AUTH",
            Frame::AuthAck { .. } => "AUTH_ACK",
            Frame::ConnectRequest { .. } => "CONNECT_REQ",
            Frame::ConnectResponse { .. } => "CONNECT_RESP",
            Frame::UdpRequest => "UDP_REQ",
            Frame::UdpResponse { .. } => "UDP_RESP",
        }
    }

    /// Encode this frame to a byte buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Auth {
                version,
                up_bps,
                down_bps,
                token,
            } => {
                buf.put_u8(FRAME_AUTH);
                let payload_len =
                    1 + varint_size(*up_bps) + varint_size(*down_bps) + string_size(token);
                encode_varint(payload_len as u64, buf);
                buf.put_u8(*version);
                encode_varint(*up_bps, buf);
                encode_varint(*down_bps, buf);
                put_string(token, buf);
            }
            Frame::AuthAck {
                accepted,
                up_bps,
                down_bps,
                message,
            } => {
                buf.put_u8(FRAME_AUTH_ACK);
                let payload_len = 1
                    + varint_size(*up_bps)
                    + varint_size(*down_bps)
                    + string_size(message.as_bytes());
                encode_varint(payload_len as u64, buf);
                buf.put_u8(u8::from(*accepted));
                encode_varint(*up_bps, buf);
                encode_varint(*down_bps, buf);
                put_string(message.as_bytes(), buf);
            }
            Frame::ConnectRequest { addr } => {
                buf.put_u8(FRAME_CONNECT_REQ);
                encode_varint(string_size(addr.as_bytes()) as u64, buf);
                put_string(addr.as_bytes(), buf);
            }
            Frame::ConnectResponse { ok, message } => {
                buf.put_u8(FRAME_CONNECT_RESP);
                encode_varint((1 + string_size(message.as_bytes())) as u64, buf);
                buf.put_u8(u8::from(*ok));
                put_string(message.as_bytes(), buf);
            }
            Frame::UdpRequest => {
                buf.put_u8(FRAME_UDP_REQ);
                encode_varint(0, buf);
            }
            Frame::UdpResponse {
                ok,
                session_id,
                message,
            } => {
                buf.put_u8(FRAME_UDP_RESP);
                let payload_len = 1 + UDP_SESSION_ID_SIZE + string_size(message.as_bytes());
                encode_varint(payload_len as u64, buf);
                buf.put_u8(u8::from(*ok));
                buf.put_u32(*session_id);
                put_string(message.as_bytes(), buf);
            }
        }
    }

    /// Decode a frame from a byte buffer.
    ///
    /// Returns `Ok(None)` if there isn't enough data to decode a complete frame.
    /// On success, returns the decoded frame and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> ProtocolResult<Option<(Frame, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let frame_type = buf[0];
        let mut remaining = &buf[1..];
        let start_len = remaining.len();

        let length = match decode_varint(&mut remaining)? {
            Some(len) => len as usize,
            None => return Ok(None),
        };
        if length > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(length));
        }

        let header_size = 1 + (start_len - remaining.len());

        if remaining.len() < length {
            return Ok(None);
        }

        let payload = &remaining[..length];
        let frame = Self::decode_payload(frame_type, payload)?;

        Ok(Some((frame, header_size + length)))
    }

    /// Decode the payload based on frame type.
    fn decode_payload(frame_type: u8, payload: &[u8]) -> ProtocolResult<Frame> {
        let mut buf = payload;

        match frame_type {
            FRAME_AUTH => {
                let version = take_u8(&mut buf)?;
                let up_bps = take_varint(&mut buf)?;
                let down_bps = take_varint(&mut buf)?;
                let token = Bytes::copy_from_slice(take_bytes(&mut buf)?);
                Ok(Frame::Auth {
                    version,
                    up_bps,
                    down_bps,
                    token,
                })
            }
            FRAME_AUTH_ACK => {
                let accepted = take_u8(&mut buf)? != 0;
                let up_bps = take_varint(&mut buf)?;
                let down_bps = take_varint(&mut buf)?;
                let message = take_string(&mut buf)?;
                Ok(Frame::AuthAck {
                    accepted,
                    up_bps,
                    down_bps,
                    message,
                })
            }
            FRAME_CONNECT_REQ => {
                let addr = take_string(&mut buf)?;
                Ok(Frame::ConnectRequest { addr })
            }
            FRAME_CONNECT_RESP => {
                let ok = take_u8(&mut buf)? != 0;
                let message = take_string(&mut buf)?;
                Ok(Frame::ConnectResponse { ok, message })
            }
            FRAME_UDP_REQ => Ok(Frame::UdpRequest),
            FRAME_UDP_RESP => {
                let ok = take_u8(&mut buf)? != 0;
                if buf.len() < UDP_SESSION_ID_SIZE {
                    return Err(ProtocolError::IncompleteData);
                }
                let (id, rest) = buf.split_at(UDP_SESSION_ID_SIZE);
                buf = rest;
                let session_id = u32::from_be_bytes([id[0], id[1], id[2], id[3]]);
                let message = take_string(&mut buf)?;
                Ok(Frame::UdpResponse {
                    ok,
                    session_id,
                    message,
                })
            }
            _ => Err(ProtocolError::InvalidFrameType(frame_type)),
        }
    }
}

/// Read exactly one frame from a stream without consuming any byte past it.
///
/// Returns `Ok(None)` if the stream ended cleanly before the first byte.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = BytesMut::with_capacity(1 + MAX_VARINT_SIZE);
    let frame_type = match reader.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    header.put_u8(frame_type);

    // Varint bytes are read one at a time so that raw stream data following
    // the frame stays in the stream.
    let length = loop {
        let byte = reader.read_u8().await?;
        header.put_u8(byte);
        let mut slice = &header[1..];
        match decode_varint(&mut slice).map_err(invalid_data)? {
            Some(len) => break len as usize,
            None => continue,
        }
    };
    if length > MAX_FRAME_LEN {
        return Err(invalid_data(ProtocolError::FrameTooLarge(length)));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Frame::decode_payload(frame_type, &payload)
        .map(Some)
        .map_err(invalid_data)
}

/// Encode and write a single frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    frame.encode(&mut buf);
    writer.write_all(&buf).await
}

fn invalid_data(e: ProtocolError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

/// One unreliable datagram: `session_id:u32 | addr_len:varint | addr | payload`.
///
/// The address is the destination on the way out and the source on the way in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpMessage {
    pub session_id: u32,
    pub addr: String,
    pub payload: Bytes,
}

impl UdpMessage {
    /// Number of bytes the message occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        UDP_SESSION_ID_SIZE + string_size(self.addr.as_bytes()) + self.payload.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32(self.session_id);
        put_string(self.addr.as_bytes(), buf);
        buf.put_slice(&self.payload);
    }

    pub fn decode(datagram: &Bytes) -> ProtocolResult<Self> {
        if datagram.len() < UDP_SESSION_ID_SIZE {
            return Err(ProtocolError::IncompleteData);
        }
        let session_id =
            u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        let mut buf = &datagram[UDP_SESSION_ID_SIZE..];
        let addr = take_string(&mut buf)?;
        let offset = datagram.len() - buf.len();
        Ok(Self {
            session_id,
            addr,
            payload: datagram.slice(offset..),
        })
    }
}
