use std::io::{self, Read, Write};

use tracing::trace;

use crate::error::FrameError;

/// Size of the fixed frame header: 1 byte type, 4 byte connection id, 4 byte length.
pub const HEADER_SIZE: usize = 9;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = 65536;

/// Connection ids are carried in 31 bits; the top bit of the wire u32 must be 0.
pub const MAX_CONNECTION_ID: u32 = (1 << 31) - 1;

/// The closed set of frame types carried on the control link.
///
/// Kept as a tagged enum with exhaustive matching at dispatch sites, per the
/// protocol's design notes, rather than a handler map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Ping = 1,
    Pong = 2,
    NewConnection = 3,
    Data = 4,
    Close = 5,
}

impl FrameType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameType::Ping),
            2 => Ok(FrameType::Pong),
            3 => Ok(FrameType::NewConnection),
            4 => Ok(FrameType::Data),
            5 => Ok(FrameType::Close),
            other => Err(FrameError::protocol(format!("unknown frame type {other}"))),
        }
    }
}

/// A decoded frame: type, connection id (0 means "no virtual connection"), payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub connection_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, connection_id: u32, payload: Vec<u8>) -> Result<Self, FrameError> {
        validate(frame_type, connection_id, payload.len())?;
        Ok(Self { frame_type, connection_id, payload })
    }

    pub fn ping(token: [u8; 8]) -> Self {
        Frame { frame_type: FrameType::Ping, connection_id: 0, payload: token.to_vec() }
    }

    pub fn pong(token: Vec<u8>) -> Self {
        Frame { frame_type: FrameType::Pong, connection_id: 0, payload: token }
    }

    pub fn new_connection(connection_id: u32, public_port: u16) -> Self {
        Frame {
            frame_type: FrameType::NewConnection,
            connection_id,
            payload: (u32::from(public_port)).to_be_bytes().to_vec(),
        }
    }

    pub fn data(connection_id: u32, payload: Vec<u8>) -> Self {
        Frame { frame_type: FrameType::Data, connection_id, payload }
    }

    pub fn close(connection_id: u32) -> Self {
        Frame { frame_type: FrameType::Close, connection_id, payload: Vec::new() }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        pack(self.frame_type, self.connection_id, &self.payload)
    }
}

fn validate(frame_type: FrameType, connection_id: u32, payload_len: usize) -> Result<(), FrameError> {
    let _ = frame_type;
    if connection_id > MAX_CONNECTION_ID {
        return Err(FrameError::protocol(format!(
            "connection id {connection_id} exceeds 31-bit range"
        )));
    }
    if payload_len > MAX_PAYLOAD {
        return Err(FrameError::protocol(format!(
            "payload of {payload_len} bytes exceeds MAX_PAYLOAD ({MAX_PAYLOAD})"
        )));
    }
    Ok(())
}

/// Encodes a frame to its wire representation: 9-byte header followed by payload.
pub fn pack(frame_type: FrameType, connection_id: u32, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    validate(frame_type, connection_id, payload.len())?;
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.push(frame_type.as_u8());
    out.extend_from_slice(&connection_id.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Writes a frame to `writer` in one call, so a partial write never leaves a
/// half-emitted frame on a buffered stream.
pub fn write_frame<W: Write>(writer: &mut W, frame_type: FrameType, connection_id: u32, payload: &[u8]) -> io::Result<()> {
    let bytes = pack(frame_type, connection_id, payload)?;
    writer.write_all(&bytes)
}

fn classify_read_error(err: io::Error) -> FrameError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => FrameError::IncompleteFrame,
        _ => {
            trace!(kind = ?err.kind(), "non-EOF error reading frame");
            FrameError::io(&err)
        }
    }
}

/// Reads exactly one frame from `reader`: 9 header bytes then `length` payload
/// bytes. No partial frame is ever returned to the caller.
pub fn unpack<R: Read>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    read_exact_or_incomplete(reader, &mut header)?;

    let frame_type = FrameType::try_from(header[0])?;
    let connection_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;

    if connection_id > MAX_CONNECTION_ID {
        return Err(FrameError::protocol(format!(
            "connection id {connection_id} exceeds 31-bit range"
        )));
    }
    if length > MAX_PAYLOAD {
        return Err(FrameError::protocol(format!(
            "declared length {length} exceeds MAX_PAYLOAD ({MAX_PAYLOAD})"
        )));
    }

    let mut payload = vec![0u8; length];
    read_exact_or_incomplete(reader, &mut payload)?;

    Ok(Frame { frame_type, connection_id, payload })
}

fn read_exact_or_incomplete<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) => Err(classify_read_error(err)),
    }
}

/// Incremental decoder for callers that only have arbitrary byte chunks
/// (partial reads from a non-blocking socket, or test fixtures that split a
/// frame across several `feed` calls) rather than a blocking `Read`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every frame that is now fully buffered, in
    /// order. Leaves a trailing partial frame buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < HEADER_SIZE {
                break;
            }
            let length =
                u32::from_be_bytes([self.buf[5], self.buf[6], self.buf[7], self.buf[8]]) as usize;
            if length > MAX_PAYLOAD {
                return Err(FrameError::protocol(format!(
                    "declared length {length} exceeds MAX_PAYLOAD ({MAX_PAYLOAD})"
                )));
            }
            let total = HEADER_SIZE + length;
            if self.buf.len() < total {
                break;
            }
            let frame_type = FrameType::try_from(self.buf[0])?;
            let connection_id =
                u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
            if connection_id > MAX_CONNECTION_ID {
                return Err(FrameError::protocol(format!(
                    "connection id {connection_id} exceeds 31-bit range"
                )));
            }
            let payload = self.buf[HEADER_SIZE..total].to_vec();
            frames.push(Frame { frame_type, connection_id, payload });
            self.buf.drain(..total);
        }
        Ok(frames)
    }
}
