//! Envelope framing for binary RPC packets.
//!
//! ```text
//! "Bin" | type | [u32 header length | header] | u32 data length | data
//! ```
//!
//! Type bit `0x01` marks a response, bit `0x40` a header block. Lengths are
//! big-endian. The framer only finds packet boundaries; the payload grammar
//! belongs to the binary codec, which receives the whole packet.

use bytes::BytesMut;

use crate::rpc::codec::CodecError;

pub const SIGNATURE: &[u8] = b"Bin";
const RESPONSE_BIT: u8 = 0x01;
const HEADER_BIT: u8 = 0x40;
const MAX_PACKET: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryPacket {
    pub is_response: bool,
    pub has_header: bool,
    /// The complete packet, signature included.
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub struct BinaryRpcFramer {
    started: bool,
}

impl BinaryRpcFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processing_started(&self) -> bool {
        self.started
    }

    pub fn reset(&mut self) {
        self.started = false;
    }

    /// Split one packet off the front of `buf` once it is complete.
    pub fn feed(&mut self, buf: &mut BytesMut) -> Result<Option<BinaryPacket>, CodecError> {
        self.started = !buf.is_empty();
        let Some(len) = packet_len(buf)? else {
            return Ok(None);
        };

        let type_byte = buf[3];
        let bytes = buf.split_to(len).to_vec();
        self.started = false;
        Ok(Some(BinaryPacket {
            is_response: type_byte & RESPONSE_BIT != 0,
            has_header: type_byte & HEADER_BIT != 0,
            bytes,
        }))
    }
}

/// Total length of the packet at the front of `buf`, if all of it is there.
fn packet_len(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    if &buf[..3] != SIGNATURE {
        return Err(CodecError::Malformed("binary packet without \"Bin\" signature".into()));
    }

    let mut offset = 4;
    if buf[3] & HEADER_BIT != 0 {
        let Some(header_len) = read_len(buf, offset) else {
            return Ok(None);
        };
        offset = offset.saturating_add(4).saturating_add(header_len);
        if offset.saturating_add(4) > MAX_PACKET {
            return Err(too_large(offset));
        }
    }
    let Some(data_len) = read_len(buf, offset) else {
        return Ok(None);
    };
    let total = offset + 4 + data_len;
    if total > MAX_PACKET {
        return Err(too_large(total));
    }

    Ok((buf.len() >= total).then_some(total))
}

fn too_large(len: usize) -> CodecError {
    CodecError::Malformed(format!("binary packet of at least {} bytes is too large", len))
}

fn read_len(buf: &[u8], offset: usize) -> Option<usize> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
}
