//! RFC 6455 framing for upgraded connections.
//!
//! The reader owns the socket and feeds raw bytes in as they arrive, so this
//! is a push parser over the connection buffer rather than a stream adapter.
//! Frame headers are parsed and written by tungstenite; message reassembly
//! happens here.

use std::io::Cursor;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Control, Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::{Frame as WireFrame, FrameHeader};

/// Largest message accepted, matching the HTTP body ceiling.
pub const MAX_PAYLOAD: usize = 10 * 1024 * 1024;

/// Status 1000, normal closure.
const NORMAL_CLOSURE: [u8; 2] = [0x03, 0xE8];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_wire(code: OpCode) -> Result<Self, FrameError> {
        match code {
            OpCode::Data(Data::Continue) => Ok(Opcode::Continuation),
            OpCode::Data(Data::Text) => Ok(Opcode::Text),
            OpCode::Data(Data::Binary) => Ok(Opcode::Binary),
            OpCode::Control(Control::Close) => Ok(Opcode::Close),
            OpCode::Control(Control::Ping) => Ok(Opcode::Ping),
            OpCode::Control(Control::Pong) => Ok(Opcode::Pong),
            reserved => Err(FrameError::ReservedOpcode(reserved.into())),
        }
    }

    fn to_wire(self) -> OpCode {
        match self {
            Opcode::Continuation => OpCode::Data(Data::Continue),
            Opcode::Text => OpCode::Data(Data::Text),
            Opcode::Binary => OpCode::Data(Data::Binary),
            Opcode::Close => OpCode::Control(Control::Close),
            Opcode::Ping => OpCode::Control(Control::Ping),
            Opcode::Pong => OpCode::Control(Control::Pong),
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// A complete message: a control frame or a reassembled data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved websocket opcode {0:#x}")]
    ReservedOpcode(u8),

    #[error("websocket message exceeds {MAX_PAYLOAD} bytes")]
    TooLarge,

    #[error("fragmented websocket control frame")]
    FragmentedControl,

    #[error("continuation frame without a started message")]
    UnexpectedContinuation,

    #[error("new data frame while a fragmented message is pending")]
    InterleavedMessage,

    #[error("websocket framing: {0}")]
    Wire(String),
}

impl From<tungstenite::Error> for FrameError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Protocol(ProtocolError::InvalidOpcode(code)) => {
                FrameError::ReservedOpcode(code)
            }
            other => FrameError::Wire(other.to_string()),
        }
    }
}

#[derive(Default)]
pub struct FrameParser {
    message_opcode: Option<Opcode>,
    message: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a fragmented message is partially assembled.
    pub fn processing_started(&self) -> bool {
        self.message_opcode.is_some()
    }

    pub fn reset(&mut self) {
        self.message_opcode = None;
        self.message.clear();
    }

    /// Consume complete frames from `buf` until a whole message is available.
    ///
    /// Client frames are supposed to be masked; unmasked frames are accepted
    /// as-is.
    pub fn feed(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            let Some((fin, opcode, payload)) = take_frame(buf)? else {
                return Ok(None);
            };

            if opcode.is_control() {
                if !fin {
                    return Err(FrameError::FragmentedControl);
                }
                return Ok(Some(Frame { opcode, payload }));
            }

            match (opcode, self.message_opcode) {
                (Opcode::Continuation, None) => return Err(FrameError::UnexpectedContinuation),
                (Opcode::Continuation, Some(_)) => {}
                (_, Some(_)) => return Err(FrameError::InterleavedMessage),
                (first, None) => self.message_opcode = Some(first),
            }

            if self.message.len() + payload.len() > MAX_PAYLOAD {
                return Err(FrameError::TooLarge);
            }
            self.message.extend_from_slice(&payload);

            if fin {
                let opcode = self.message_opcode.take().unwrap_or(Opcode::Binary);
                let payload = std::mem::take(&mut self.message);
                return Ok(Some(Frame { opcode, payload }));
            }
        }
    }
}

/// Pop one raw frame off the front of `buf`, unmasked.
fn take_frame(buf: &mut BytesMut) -> Result<Option<(bool, Opcode, Vec<u8>)>, FrameError> {
    let mut cursor = Cursor::new(&buf[..]);
    let Some((header, payload_len)) = FrameHeader::parse(&mut cursor)? else {
        return Ok(None);
    };
    let opcode = Opcode::from_wire(header.opcode)?;
    if payload_len > MAX_PAYLOAD as u64 {
        return Err(FrameError::TooLarge);
    }
    let offset = cursor.position() as usize;
    let payload_len = payload_len as usize;
    if buf.len() < offset + payload_len {
        return Ok(None);
    }

    buf.advance(offset);
    let mut payload = buf.split_to(payload_len).to_vec();
    if let Some(mask) = header.mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok(Some((header.is_final, opcode, payload)))
}

/// Encode a single unmasked, final server frame.
pub fn encode(opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let frame = WireFrame::message(payload.to_vec(), opcode.to_wire(), true);
    let mut out = Vec::with_capacity(frame.len());
    frame.format(&mut out)?;
    Ok(out)
}

/// A close frame with status 1000.
pub fn close_frame() -> Result<Vec<u8>, FrameError> {
    encode(Opcode::Close, &NORMAL_CLOSURE)
}
