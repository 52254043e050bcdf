use std::collections::HashMap;

use crate::{
    codec::Codec,
    error::ProtoError,
    message::{AnyMessage, Message},
    messages::base::{ErrorReply, Ping, Pong, Success},
};

type DecodeFn = fn(Codec, &[u8]) -> Result<Box<dyn AnyMessage>, ProtoError>;

/// Maps wire msg ids to decoders for their concrete message types.
#[derive(Clone, Default)]
pub struct MessageRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that already knows the heartbeat and RPC status messages.
    pub fn with_base_messages() -> Self {
        let mut registry = Self::new();
        registry
            .register::<Ping>()
            .register::<Pong>()
            .register::<Success>()
            .register::<ErrorReply>();
        registry
    }

    /// Register `T` under `T::MSG_ID`. Re-registering replaces the decoder.
    pub fn register<T: Message>(&mut self) -> &mut Self {
        self.decoders.insert(T::MSG_ID, decode_as::<T>);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<T: Message>(mut self) -> Self {
        self.register::<T>();
        self
    }

    pub fn contains(&self, msg_id: &str) -> bool {
        self.decoders.contains_key(msg_id)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode `body` as the type registered for `msg_id`.
    pub fn decode(
        &self,
        msg_id: &str,
        codec: Codec,
        body: &[u8],
    ) -> Result<Box<dyn AnyMessage>, ProtoError> {
        let decode = self
            .decoders
            .get(msg_id)
            .ok_or_else(|| ProtoError::UnknownMsgId(msg_id.to_owned()))?;
        decode(codec, body)
    }
}

fn decode_as<T: Message>(codec: Codec, body: &[u8]) -> Result<Box<dyn AnyMessage>, ProtoError> {
    // An empty body stands for the default value.
    if body.is_empty() {
        return Ok(Box::new(T::default()));
    }
    Ok(Box::new(codec.decode::<T>(body)?))
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.decoders.keys().collect();
        ids.sort();
        f.debug_struct("MessageRegistry")
            .field("msg_ids", &ids)
            .finish()
    }
}
