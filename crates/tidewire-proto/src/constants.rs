/// Size of the `total_len` prefix (u32 LE).
pub const LEN_PREFIX: usize = 4;

/// Fixed header layout:
/// - total_len (u32 LE)
/// - msg_id_len (u8)
/// - protocol_kind (u8)
/// - rpc_index (u32 LE)
pub const HEADER_LEN: usize = LEN_PREFIX + 1 + 1 + 4;

/// Upper bound for a single packet, header included.
///
/// Outgoing packets must stay strictly below this; incoming packets may
/// reach it exactly.
pub const MAX_PACKET_LEN: usize = 256 * 1024;

/// `msg_id_len` is a single byte on the wire.
pub const MAX_MSG_ID_LEN: usize = u8::MAX as usize;
