use strum::FromRepr;

use crate::{
    constants::{HEADER_LEN, MAX_PACKET_LEN},
    error::ProtoError,
};

/// How a packet relates to request/response correlation.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
pub enum ProtocolKind {
    /// Fire-and-forget message; `rpc_index` is 0.
    Normal = 0,
    /// Expects exactly one `RpcResponse` carrying the same `rpc_index`.
    RpcRequest = 1,
    RpcResponse = 2,
}

/// Packet header (wire format).
///
/// Encoding rules:
/// - Fixed size: exactly `HEADER_LEN` bytes.
/// - Integer fields are little-endian.
/// - `total_len` counts the whole packet: header, msg id and body.
///
/// Decode rules:
/// - Requires `buf.len() >= HEADER_LEN`.
/// - Requires `HEADER_LEN <= total_len <= MAX_PACKET_LEN`.
/// - Requires `HEADER_LEN + msg_id_len <= total_len`.
/// - Requires a known `ProtocolKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub total_len: u32,
    pub msg_id_len: u8,
    pub kind: ProtocolKind,
    /// Correlation index. 0 for `Normal` packets.
    pub rpc_index: u32,
}

impl Header {
    /// Header size in bytes for the current wire layout.
    pub const LEN: usize = HEADER_LEN;

    /// Build a header for a packet carrying `msg_id_len` + `body_len` bytes.
    pub fn new(kind: ProtocolKind, rpc_index: u32, msg_id_len: u8, body_len: usize) -> Self {
        let total = HEADER_LEN + msg_id_len as usize + body_len;
        Self {
            total_len: total as u32,
            msg_id_len,
            kind,
            rpc_index,
        }
    }

    /// Encode this header into `out`.
    ///
    /// Offsets (bytes):
    /// - 0..4   total_len (u32 LE)
    /// - 4      msg_id_len
    /// - 5      protocol_kind
    /// - 6..10  rpc_index (u32 LE)
    pub fn encode_into(&self, out: &mut [u8; HEADER_LEN]) {
        out[0..4].copy_from_slice(&self.total_len.to_le_bytes());
        out[4] = self.msg_id_len;
        out[5] = self.kind as u8;
        out[6..10].copy_from_slice(&self.rpc_index.to_le_bytes());
    }

    /// Decode the header at the front of `buf`.
    ///
    /// Only the first `HEADER_LEN` bytes are inspected; the caller decides
    /// whether the rest of the packet has arrived yet.
    pub fn decode(buf: &[u8]) -> Result<Header, ProtoError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtoError::TooShort);
        }

        let total_len = read_u32_le(buf, 0)?;
        let total = total_len as usize;
        if total > MAX_PACKET_LEN {
            return Err(ProtoError::FrameTooLarge(total));
        }
        if total < HEADER_LEN {
            return Err(ProtoError::LengthTooSmall(total));
        }

        let msg_id_len = buf[4];
        if HEADER_LEN + msg_id_len as usize > total {
            return Err(ProtoError::LengthMismatch);
        }

        let kind = ProtocolKind::from_repr(buf[5]).ok_or(ProtoError::UnknownProtocolKind(buf[5]))?;
        let rpc_index = read_u32_le(buf, 6)?;

        Ok(Header {
            total_len,
            msg_id_len,
            kind,
            rpc_index,
        })
    }

    /// Number of body bytes following the msg id.
    pub fn body_len(&self) -> usize {
        self.total_len as usize - HEADER_LEN - self.msg_id_len as usize
    }
}

pub(crate) fn read_u32_le(buf: &[u8], start: usize) -> Result<u32, ProtoError> {
    let bytes: [u8; 4] = buf
        .get(start..start + 4)
        .ok_or(ProtoError::TooShort)?
        .try_into()
        .map_err(|_| ProtoError::TooShort)?;
    Ok(u32::from_le_bytes(bytes))
}
