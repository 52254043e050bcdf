//! Messages every connection understands: heartbeat and RPC status replies.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Ping {}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Pong {}

/// Empty acknowledgement for an RPC that has nothing to return.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Success {}

/// Failure reply for an RPC.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: i32,
    pub message: String,
}

crate::impl_message!(
    Ping => "base.Ping",
    Pong => "base.Pong",
    Success => "base.Success",
    ErrorReply => "base.Error",
);

/// Returns true for msg ids handled by the heartbeat path.
pub fn is_heartbeat(msg_id: &str) -> bool {
    msg_id == "base.Ping" || msg_id == "base.Pong"
}
