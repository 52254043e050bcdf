use crate::{
    header::{Header, ProtocolKind},
    message::AnyMessage,
};

/// A zero-copy view of one framed packet inside a receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    pub header: Header,
    pub msg_id: &'a str,
    pub body: &'a [u8],
}

/// A decoded packet that owns its message.
/// This is safe to move across tasks/channels.
#[derive(Debug)]
pub struct Packet {
    pub kind: ProtocolKind,
    pub rpc_index: u32,
    pub msg: Box<dyn AnyMessage>,
}

impl Packet {
    pub fn msg_id(&self) -> &'static str {
        self.msg.msg_id()
    }
}
