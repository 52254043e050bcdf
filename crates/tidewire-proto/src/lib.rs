pub mod codec;
pub mod constants;
pub mod error;
pub mod frame;
pub mod header;
pub mod message;
pub mod messages;
pub mod packet;
pub mod registry;

pub use codec::Codec;
pub use error::ProtoError;
pub use header::{Header, ProtocolKind};
pub use message::{AnyMessage, Message};
pub use packet::{Packet, PacketView};
pub use registry::MessageRegistry;
