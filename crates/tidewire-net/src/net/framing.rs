use bytes::{Buf, BytesMut};
use tidewire_proto::{
    Codec, MessageRegistry, Packet, ProtoError, constants::MAX_PACKET_LEN, frame::try_decode_frame,
};

/// Bytes reserved before each socket read.
pub const READ_CHUNK: usize = 16 * 1024;

/// A small TCP framing helper:
/// - keeps an internal receive buffer (`BytesMut`)
/// - slices complete packets off the front and decodes their bodies
/// - keeps the remaining bytes for the next read
pub struct PacketFramer {
    buf: BytesMut,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_PACKET_LEN),
        }
    }

    /// Get mutable access to the internal buffer for socket reads.
    ///
    /// Typical usage:
    /// - `framer.buf_mut().reserve(n)`
    /// - `socket.read_buf(framer.buf_mut()).await?`
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete packet, if one is buffered.
    pub fn next_packet(
        &mut self,
        registry: &MessageRegistry,
        codec: Codec,
    ) -> Result<Option<Packet>, ProtoError> {
        let Some((view, used)) = try_decode_frame(&self.buf)? else {
            return Ok(None);
        };
        let packet = Packet {
            kind: view.header.kind,
            rpc_index: view.header.rpc_index,
            msg: registry.decode(view.msg_id, codec, view.body)?,
        };
        self.buf.advance(used);
        Ok(Some(packet))
    }

    /// Decode every complete packet currently buffered.
    pub fn drain_packets(
        &mut self,
        registry: &MessageRegistry,
        codec: Codec,
    ) -> Result<Vec<Packet>, ProtoError> {
        let mut out = Vec::new();
        while let Some(packet) = self.next_packet(registry, codec)? {
            out.push(packet);
        }
        Ok(out)
    }
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new()
    }
}
