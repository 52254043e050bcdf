use std::time::Duration;

use thiserror::Error;
use tidewire_proto::ProtoError;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("session closed")]
    SessionClosed,
    #[error("connector not connected")]
    NotConnected,
    #[error("connection closed by peer")]
    Eof,
    #[error("heartbeat timeout after {0:?}")]
    HeartbeatTimeout(Duration),
    #[error("rpc response timeout after {0:?}")]
    RpcTimeout(Duration),
    #[error("write timeout after {0:?}")]
    WriteTimeout(Duration),
    #[error("dial {addr} timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },
    #[error("unexpected response {got}, expected {expected}")]
    UnexpectedResponse {
        got: &'static str,
        expected: &'static str,
    },
    #[error("closed: {0}")]
    Closed(String),
    #[error("panicked: {0}")]
    Panicked(String),
    #[error("event queue stopped")]
    QueueStopped,
    #[error("event queue full")]
    QueueFull,
    #[error("event queue already running")]
    AlreadyRunning,
    #[error("post_wait timed out after {0:?}")]
    PostWaitTimeout(Duration),
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
