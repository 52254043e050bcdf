use crate::{
    codec::Codec,
    constants::{HEADER_LEN, LEN_PREFIX, MAX_MSG_ID_LEN, MAX_PACKET_LEN},
    error::ProtoError,
    header::{Header, ProtocolKind, read_u32_le},
    message::AnyMessage,
    packet::PacketView,
};

/// Frame an already encoded body.
///
/// Rejects empty or oversized msg ids and any packet whose total length
/// would reach `MAX_PACKET_LEN`.
pub fn encode_frame(
    kind: ProtocolKind,
    rpc_index: u32,
    msg_id: &str,
    body: &[u8],
) -> Result<Vec<u8>, ProtoError> {
    if msg_id.is_empty() {
        return Err(ProtoError::EmptyMsgId);
    }
    if msg_id.len() > MAX_MSG_ID_LEN {
        return Err(ProtoError::MsgIdTooLong(msg_id.len()));
    }

    let total = HEADER_LEN + msg_id.len() + body.len();
    if total >= MAX_PACKET_LEN {
        return Err(ProtoError::PacketTooLarge(total));
    }

    let header = Header::new(kind, rpc_index, msg_id.len() as u8, body.len());
    let mut out = Vec::with_capacity(total);
    let mut hbuf = [0u8; HEADER_LEN];
    header.encode_into(&mut hbuf);
    out.extend_from_slice(&hbuf);
    out.extend_from_slice(msg_id.as_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Encode `msg` with `codec` and frame it.
pub fn encode_message(
    codec: Codec,
    kind: ProtocolKind,
    rpc_index: u32,
    msg: &dyn AnyMessage,
) -> Result<Vec<u8>, ProtoError> {
    let body = msg.encode(codec)?;
    encode_frame(kind, rpc_index, msg.msg_id(), &body)
}

/// Try to slice one complete packet off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. On success returns the
/// packet view and how many bytes it occupies.
pub fn try_decode_frame(buf: &[u8]) -> Result<Option<(PacketView<'_>, usize)>, ProtoError> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }
    // Reject garbage lengths as soon as the prefix is visible.
    let total = read_u32_le(buf, 0)? as usize;
    if total > MAX_PACKET_LEN {
        return Err(ProtoError::FrameTooLarge(total));
    }
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let header = Header::decode(buf)?;
    let total = header.total_len as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let id_end = HEADER_LEN + header.msg_id_len as usize;
    let msg_id = &buf[HEADER_LEN..id_end];
    if msg_id.is_empty() {
        return Err(ProtoError::EmptyMsgId);
    }
    let msg_id = std::str::from_utf8(msg_id).map_err(|_| ProtoError::InvalidMsgId)?;

    let view = PacketView {
        header,
        msg_id,
        body: &buf[id_end..total],
    };
    Ok(Some((view, total)))
}

/// Decode as many complete packets as possible from `buf`.
///
/// Returns the views and the number of bytes consumed; trailing partial
/// bytes stay for the next read.
pub fn try_decode_frames(buf: &[u8]) -> Result<(Vec<PacketView<'_>>, usize), ProtoError> {
    let mut out = Vec::new();
    let mut offset = 0;

    while let Some((view, used)) = try_decode_frame(&buf[offset..])? {
        out.push(view);
        offset += used;
    }

    Ok((out, offset))
}

#[cfg(test)]
mod tests {
    use super::{encode_frame, encode_message, try_decode_frame, try_decode_frames};
    use crate::{
        codec::Codec,
        constants::{HEADER_LEN, MAX_PACKET_LEN},
        error::ProtoError,
        header::ProtocolKind,
        messages::base::{ErrorReply, Ping},
    };

    #[test]
    fn total_len_matches_frame_size() {
        let frame = encode_frame(ProtocolKind::Normal, 0, "a.B", &[1, 2, 3]).unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 3 + 3);
        assert_eq!(
            u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize,
            frame.len()
        );
        assert_eq!(&frame[HEADER_LEN..HEADER_LEN + 3], b"a.B");
    }

    #[test]
    fn decodes_fields_back() {
        let msg = ErrorReply {
            code: 7,
            message: "nope".into(),
        };
        let frame = encode_message(Codec::Binary, ProtocolKind::RpcResponse, 42, &msg).unwrap();

        let (view, used) = try_decode_frame(&frame).unwrap().unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(view.header.kind, ProtocolKind::RpcResponse);
        assert_eq!(view.header.rpc_index, 42);
        assert_eq!(view.msg_id, "base.Error");
        assert_eq!(Codec::Binary.decode::<ErrorReply>(view.body).unwrap(), msg);
    }

    #[test]
    fn oversize_packets_are_rejected_on_send() {
        let id = "x.Big";
        let fits = MAX_PACKET_LEN - 1 - HEADER_LEN - id.len();
        assert!(encode_frame(ProtocolKind::Normal, 0, id, &vec![0; fits]).is_ok());

        let err = encode_frame(ProtocolKind::Normal, 0, id, &vec![0; fits + 1]).unwrap_err();
        assert!(matches!(err, ProtoError::PacketTooLarge(n) if n == MAX_PACKET_LEN));
    }

    #[test]
    fn msg_id_must_be_non_empty_and_short() {
        assert!(matches!(
            encode_frame(ProtocolKind::Normal, 0, "", &[]),
            Err(ProtoError::EmptyMsgId)
        ));
        let long = "m".repeat(256);
        assert!(matches!(
            encode_frame(ProtocolKind::Normal, 0, &long, &[]),
            Err(ProtoError::MsgIdTooLong(256))
        ));
    }

    #[test]
    fn partial_reads_reassemble_at_every_split() {
        let mut stream = Vec::new();
        stream.extend(encode_message(Codec::Binary, ProtocolKind::Normal, 0, &Ping {}).unwrap());
        stream.extend(
            encode_message(
                Codec::Binary,
                ProtocolKind::RpcRequest,
                9,
                &ErrorReply {
                    code: 1,
                    message: "abc".into(),
                },
            )
            .unwrap(),
        );

        for split in 0..=stream.len() {
            let mut buf = stream[..split].to_vec();
            let (first, used) = try_decode_frames(&buf).unwrap();
            let mut ids: Vec<String> = first.iter().map(|v| v.msg_id.to_owned()).collect();
            buf.drain(..used);

            buf.extend_from_slice(&stream[split..]);
            let (rest, used) = try_decode_frames(&buf).unwrap();
            ids.extend(rest.iter().map(|v| v.msg_id.to_owned()));
            assert_eq!(used, buf.len(), "split at {split}");

            assert_eq!(ids, ["base.Ping", "base.Error"], "split at {split}");
        }
    }

    #[test]
    fn oversize_length_prefix_fails_before_header_arrives() {
        let prefix = ((MAX_PACKET_LEN + 1) as u32).to_le_bytes();
        assert!(matches!(
            try_decode_frame(&prefix),
            Err(ProtoError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn non_utf8_msg_id_is_rejected() {
        let mut frame = encode_frame(ProtocolKind::Normal, 0, "ab", &[]).unwrap();
        frame[HEADER_LEN] = 0xFF;
        assert!(matches!(
            try_decode_frame(&frame),
            Err(ProtoError::InvalidMsgId)
        ));
    }
}
