use std::{any::Any, fmt};

use serde::{Serialize, de::DeserializeOwned};

use crate::{codec::Codec, error::ProtoError};

/// A concrete message type that can travel in a packet body.
///
/// `MSG_ID` is the string written into the packet header; it must be unique
/// within a [`MessageRegistry`](crate::registry::MessageRegistry).
pub trait Message:
    Serialize + DeserializeOwned + Default + fmt::Debug + Send + Sync + 'static
{
    const MSG_ID: &'static str;
}

/// Type-erased message, as seen by the transport core.
pub trait AnyMessage: Any + fmt::Debug + Send + Sync {
    fn msg_id(&self) -> &'static str;
    fn encode(&self, codec: Codec) -> Result<Vec<u8>, ProtoError>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T: Message> AnyMessage for T {
    fn msg_id(&self) -> &'static str {
        T::MSG_ID
    }

    fn encode(&self, codec: Codec) -> Result<Vec<u8>, ProtoError> {
        codec.encode(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

impl dyn AnyMessage {
    pub fn is<T: Message>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Recover the concrete message, handing the box back on mismatch.
    pub fn downcast<T: Message>(self: Box<Self>) -> Result<Box<T>, Box<dyn AnyMessage>> {
        if !self.is::<T>() {
            return Err(self);
        }
        Ok(self
            .into_any()
            .downcast::<T>()
            .expect("type checked by is()"))
    }
}

/// Implement [`Message`] for one or more types.
///
/// ```ignore
/// impl_message!(Echo => "demo.Echo", Chat => "demo.Chat");
/// ```
#[macro_export]
macro_rules! impl_message {
    ($($ty:ty => $id:expr),* $(,)?) => {
        $(
            impl $crate::message::Message for $ty {
                const MSG_ID: &'static str = $id;
            }
        )*
    };
}
