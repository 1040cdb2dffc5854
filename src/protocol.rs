use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::{
    error::{FrameError, RowbridgeError},
    registers::Register,
};

/// Start-of-frame delimiter
pub const FRAME_DELIMITER: u8 = 0x7E;

/// Delimiter, two address bytes and the control byte
pub const HEADER_SIZE: usize = 4;

/// Largest payload the 4-bit length field can describe
pub const MAX_PAYLOAD: usize = 15;

/// Largest possible encoded frame
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD + 1;

/// Direction and outcome of a frame (control bits 7-6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Host to console
    Request = 0,
    /// Console answer carrying data or an acknowledgement
    Response = 1,
    /// Console refused the request (register unsupported)
    Error = 2,
}

impl FrameKind {
    /// Convert from the two control bits
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Register operation (control bits 5-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Read a register; the request payload carries the register width
    Read = 0,
    /// Write a register; the request payload carries the value bytes
    Write = 1,
    /// Reset the console session counters
    Reset = 2,
}

impl Opcode {
    /// Convert from the two control bits
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            2 => Some(Self::Reset),
            _ => None,
        }
    }
}

/// Command origin, used to prioritize on-demand work over polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Cyclic polling schedule
    Poll,
    /// One-off request from another component
    OnDemand,
}

/// One decoded unit of the serial wire protocol
///
/// Wire layout:
///
/// ```text
/// 0x7E | addr hi | addr lo | control | payload (0..=15) | checksum
/// control  = kind << 6 | opcode << 4 | payload length
/// checksum = XOR of address, control and payload bytes
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Register address
    pub address: u16,
    /// Operation
    pub opcode: Opcode,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(kind: FrameKind, address: u16, opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            address,
            opcode,
            payload: payload.into(),
        }
    }

    /// Response frame carrying value bytes (or an empty acknowledgement)
    pub fn response(address: u16, opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Response, address, opcode, payload)
    }

    /// Error frame signalling an unsupported register
    #[must_use]
    pub fn error(address: u16, opcode: Opcode) -> Self {
        Self::new(FrameKind::Error, address, opcode, Bytes::new())
    }

    /// Whether this frame answers the given command
    #[must_use]
    pub fn answers(&self, command: &Command) -> bool {
        self.kind != FrameKind::Request
            && self.address == command.address
            && self.opcode == command.opcode
    }
}

/// An outstanding request to the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Register address
    pub address: u16,
    /// Operation
    pub opcode: Opcode,
    /// Origin of the command
    pub priority: Priority,
    /// When the command was last written to the channel
    pub issued_at: Instant,
    /// Reissues left before the command is abandoned
    pub retries_left: u8,
    /// Request payload
    pub payload: Bytes,
}

impl Command {
    /// Read request for a register
    #[must_use]
    pub fn read(register: &Register, priority: Priority, retries: u8) -> Self {
        Self {
            address: register.address,
            opcode: Opcode::Read,
            priority,
            issued_at: Instant::now(),
            retries_left: retries,
            payload: Bytes::copy_from_slice(&[register.width.bytes()]),
        }
    }

    /// Write request carrying a raw value for a register
    #[must_use]
    pub fn write(register: &Register, value: u32, retries: u8) -> Self {
        Self {
            address: register.address,
            opcode: Opcode::Write,
            priority: Priority::OnDemand,
            issued_at: Instant::now(),
            retries_left: retries,
            payload: register.encode_value(value),
        }
    }

    /// Console reset request
    #[must_use]
    pub fn reset(retries: u8) -> Self {
        Self {
            address: 0,
            opcode: Opcode::Reset,
            priority: Priority::OnDemand,
            issued_at: Instant::now(),
            retries_left: retries,
            payload: Bytes::new(),
        }
    }

    /// Request frame for this command
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::new(
            FrameKind::Request,
            self.address,
            self.opcode,
            self.payload.clone(),
        )
    }
}

/// XOR checksum over address, control and payload bytes
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Serialize a frame to bytes
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLong`] if the payload exceeds [`MAX_PAYLOAD`].
pub fn encode_frame(frame: &Frame) -> Result<Bytes, FrameError> {
    let payload_len = frame.payload.len();
    if payload_len > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLong {
            len: payload_len,
            max: MAX_PAYLOAD,
        });
    }
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_len + 1);

    buf.put_u8(FRAME_DELIMITER);
    buf.put_u16(frame.address);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u8(((frame.kind as u8) << 6) | ((frame.opcode as u8) << 4) | payload_len as u8);
    buf.extend_from_slice(&frame.payload);

    let sum = checksum(&buf[1..]);
    buf.put_u8(sum);

    Ok(buf.freeze())
}

/// Serialize a command as the console expects it
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLong`] if the command payload exceeds [`MAX_PAYLOAD`].
pub fn encode_command(command: &Command) -> Result<Bytes, FrameError> {
    encode_frame(&command.to_frame())
}

/// Parse one frame from the start of `data`
///
/// Returns the frame together with the number of bytes it occupied.
///
/// # Errors
///
/// Returns [`FrameError::Incomplete`] when more bytes are needed,
/// [`FrameError::Checksum`] on a checksum mismatch, and
/// [`FrameError::Malformed`] when the buffer does not start with the delimiter or
/// carries reserved kind/opcode bits.
pub fn decode_frame(data: &[u8]) -> Result<(Frame, usize), FrameError> {
    let Some(&first) = data.first() else {
        return Err(FrameError::Incomplete);
    };
    if first != FRAME_DELIMITER {
        return Err(FrameError::Malformed(format!(
            "expected delimiter, found {first:02X}"
        )));
    }
    if data.len() < HEADER_SIZE {
        return Err(FrameError::Incomplete);
    }

    let control = data[3];
    let payload_len = usize::from(control & 0x0F);
    let total = HEADER_SIZE + payload_len + 1;
    if data.len() < total {
        return Err(FrameError::Incomplete);
    }

    let expected = checksum(&data[1..total - 1]);
    let found = data[total - 1];
    if expected != found {
        return Err(FrameError::Checksum { expected, found });
    }

    let kind = FrameKind::from_bits(control >> 6)
        .ok_or_else(|| FrameError::Malformed(format!("reserved kind in control {control:02X}")))?;
    let opcode = Opcode::from_bits((control >> 4) & 0x03).ok_or_else(|| {
        FrameError::Malformed(format!("reserved opcode in control {control:02X}"))
    })?;

    let mut buf = &data[1..];
    let address = buf.get_u16();
    let payload = Bytes::copy_from_slice(&data[HEADER_SIZE..HEADER_SIZE + payload_len]);

    Ok((
        Frame {
            kind,
            address,
            opcode,
            payload,
        },
        total,
    ))
}

/// Stream codec for console frames
///
/// Corrupt frames are skipped by discarding bytes up to the next delimiter.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RowbridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, RowbridgeError> {
        loop {
            match src.iter().position(|b| *b == FRAME_DELIMITER) {
                Some(start) => src.advance(start),
                None => {
                    src.clear();
                    return Ok(None);
                }
            }

            match decode_frame(&src[..]) {
                Ok((frame, consumed)) => {
                    src.advance(consumed);
                    return Ok(Some(frame));
                }
                Err(FrameError::Incomplete) => {
                    src.reserve(MAX_FRAME_SIZE);
                    return Ok(None);
                }
                Err(e) => {
                    debug!("Discarding corrupt frame: {}", e);
                    src.advance(1);
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = RowbridgeError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), RowbridgeError> {
        dst.extend_from_slice(&encode_frame(&item)?);
        Ok(())
    }
}
