//! Wire-level encode/decode for the Panda UDP protocol: handshake literals,
//! filter add/del control bytes, the fixed ACK packet, and the outbound
//! frame header.

use canserver_core::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

/// `0xFF` on the wire means "all buses"; there is no negative representation.
pub const ALL_BUSES: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    HelloV1,
    HelloV2,
    Bye,
    FilterAdd(Vec<(u8, u16)>),
    FilterDel(Vec<(u8, u16)>),
    SendAllOn,
    SendAllOff,
}

/// Parses one inbound datagram. Returns `None` for an unknown opcode or a
/// malformed filter payload — per §7 `PandaProtocolError`, the datagram is
/// simply ignored, the client is never disconnected for it.
pub fn parse_datagram(data: &[u8]) -> Option<ControlMessage> {
    match data {
        b"hello" => return Some(ControlMessage::HelloV1),
        b"ehllo" => return Some(ControlMessage::HelloV2),
        b"bye" => return Some(ControlMessage::Bye),
        _ => {}
    }
    match data.split_first() {
        Some((&0x0F, rest)) => parse_filter_triples(rest).map(ControlMessage::FilterAdd),
        Some((&0x0E, rest)) => parse_filter_triples(rest).map(ControlMessage::FilterDel),
        Some((&0x0C, _)) => Some(ControlMessage::SendAllOn),
        Some((&0x18, _)) => Some(ControlMessage::SendAllOff),
        _ => None,
    }
}

fn parse_filter_triples(data: &[u8]) -> Option<Vec<(u8, u16)>> {
    if data.is_empty() || data.len() % 3 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(3)
            .map(|triple| (triple[0], u16::from_be_bytes([triple[1], triple[2]])))
            .collect(),
    )
}

/// The fixed 16-byte handshake acknowledgement sent in reply to both v1
/// `hello` and v2 `ehllo`.
pub fn encode_ack() -> [u8; 16] {
    let mut ack = [0u8; 16];
    ack[4] = 15 << 4;
    ack
}

/// One outbound wire-frame: 8-byte header (arbitration id shifted into the
/// upper bits, then dlc/bus packed into a second LE u32) followed by the
/// frame's `dlc` payload bytes.
pub fn encode_wire_frame(bus: u8, frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + frame.dlc as usize);
    let arbitration = frame.id.wrapping_shl(21);
    out.extend_from_slice(&arbitration.to_le_bytes());
    let flags: u32 = u32::from(frame.dlc & 0x0F) | (u32::from(bus) << 4);
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(frame.payload());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_handshake_literals() {
        assert_eq!(parse_datagram(b"hello"), Some(ControlMessage::HelloV1));
        assert_eq!(parse_datagram(b"ehllo"), Some(ControlMessage::HelloV2));
        assert_eq!(parse_datagram(b"bye"), Some(ControlMessage::Bye));
    }

    #[test]
    fn parses_filter_add_triple() {
        // S6: 0x0F 00 01 32 -> bus 0x00, id 0x0132
        let msg = parse_datagram(&[0x0F, 0x00, 0x01, 0x32]).unwrap();
        assert_eq!(msg, ControlMessage::FilterAdd(vec![(0x00, 0x0132)]));
    }

    #[test]
    fn parses_multiple_filter_triples() {
        let msg = parse_datagram(&[0x0E, 0x00, 0x01, 0x32, 0xFF, 0x02, 0x00]).unwrap();
        assert_eq!(msg, ControlMessage::FilterDel(vec![(0x00, 0x0132), (0xFF, 0x0200)]));
    }

    #[test]
    fn rejects_malformed_filter_payload() {
        assert_eq!(parse_datagram(&[0x0F, 0x00, 0x01]), None);
    }

    #[test]
    fn rejects_unknown_opcode() {
        assert_eq!(parse_datagram(&[0xAA]), None);
    }

    #[test]
    fn ack_packet_matches_known_bytes() {
        // S5
        let ack = encode_ack();
        assert_eq!(ack, [0x00, 0x00, 0x00, 0x00, 0xF0, 0x00, 0x00, 0x00, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn wire_frame_header_packs_id_dlc_and_bus() {
        let frame = Frame::new(0, 0x132, false, true, &[1, 2, 3], 0.0);
        let wire = encode_wire_frame(1, &frame);
        assert_eq!(wire.len(), 8 + 3);
        assert_eq!(&wire[8..], &[1, 2, 3]);
        let flags = u32::from_le_bytes([wire[4], wire[5], wire[6], wire[7]]);
        assert_eq!(flags, 3 | (1 << 4));
    }
}
