use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("packet length {0} is smaller than the header")]
    LengthTooSmall(usize),
    #[error("packet length {0} exceeds the maximum")]
    FrameTooLarge(usize),
    #[error("packet too large: {0} bytes")]
    PacketTooLarge(usize),
    #[error("msg id length exceeds packet length")]
    LengthMismatch,
    #[error("buffer too short")]
    TooShort,
    #[error("empty msg id")]
    EmptyMsgId,
    #[error("msg id too long: {0} bytes")]
    MsgIdTooLong(usize),
    #[error("msg id is not valid utf-8")]
    InvalidMsgId,
    #[error("unknown msg id: {0}")]
    UnknownMsgId(String),
    #[error("unknown protocol kind: {0}")]
    UnknownProtocolKind(u8),
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
