//! Vector ASCII trace (.asc) codec.
//!
//! One line per frame:
//! `<timestamp> <channel_idx+1> <id_hex>[x] <Rx|Tx> d <dlc_hex> <byte_hex>{dlc}`
//!
//! e.g. `1234.567 1 132 Rx d 8 01 02 03 04 05 06 07 08`

use crate::frame::{Frame, MAX_DLC};
use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum AscError {
    TooFewFields,
    BadTimestamp(String),
    BadChannel(String),
    BadId(String),
    BadDirection(String),
    MissingDMarker,
    BadDlc(String),
    TruncatedPayload,
    BadByte(String),
}

impl fmt::Display for AscError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AscError::TooFewFields => write!(f, "line has too few fields"),
            AscError::BadTimestamp(s) => write!(f, "invalid timestamp '{s}'"),
            AscError::BadChannel(s) => write!(f, "invalid channel '{s}'"),
            AscError::BadId(s) => write!(f, "invalid arbitration id '{s}'"),
            AscError::BadDirection(s) => write!(f, "invalid direction '{s}' (expected Rx/Tx)"),
            AscError::MissingDMarker => write!(f, "missing 'd' length marker"),
            AscError::BadDlc(s) => write!(f, "invalid dlc '{s}'"),
            AscError::TruncatedPayload => write!(f, "payload shorter than declared dlc"),
            AscError::BadByte(s) => write!(f, "invalid payload byte '{s}'"),
        }
    }
}

impl std::error::Error for AscError {}

/// Format a frame as one ASC line (no trailing newline).
pub fn encode_line(frame: &Frame) -> String {
    let id_field = if frame.extended {
        format!("{:x}x", frame.id)
    } else {
        format!("{:x}", frame.id)
    };
    let dir = if frame.rx { "Rx" } else { "Tx" };
    let mut line = format!(
        "{:.6} {} {} {} d {:x}",
        frame.timestamp,
        frame.channel + 1,
        id_field,
        dir,
        frame.dlc
    );
    for b in frame.payload() {
        line.push_str(&format!(" {:02x}", b));
    }
    line
}

/// Parse one ASC line back into a `Frame`.
pub fn decode_line(line: &str) -> Result<Frame, AscError> {
    let mut fields = line.split_whitespace();

    let ts_str = fields.next().ok_or(AscError::TooFewFields)?;
    let timestamp: f64 = ts_str.parse().map_err(|_| AscError::BadTimestamp(ts_str.to_owned()))?;

    let chan_str = fields.next().ok_or(AscError::TooFewFields)?;
    let channel_1based: u16 = chan_str
        .parse()
        .map_err(|_| AscError::BadChannel(chan_str.to_owned()))?;
    if channel_1based == 0 {
        return Err(AscError::BadChannel(chan_str.to_owned()));
    }
    let channel = (channel_1based - 1) as u8;

    let id_str = fields.next().ok_or(AscError::TooFewFields)?;
    let (id_hex, extended) = match id_str.strip_suffix('x') {
        Some(stripped) => (stripped, true),
        None => (id_str, false),
    };
    let id = u32::from_str_radix(id_hex, 16).map_err(|_| AscError::BadId(id_str.to_owned()))?;

    let dir_str = fields.next().ok_or(AscError::TooFewFields)?;
    let rx = match dir_str {
        "Rx" => true,
        "Tx" => false,
        other => return Err(AscError::BadDirection(other.to_owned())),
    };

    let marker = fields.next().ok_or(AscError::TooFewFields)?;
    if marker != "d" {
        return Err(AscError::MissingDMarker);
    }

    let dlc_str = fields.next().ok_or(AscError::TooFewFields)?;
    let dlc = u8::from_str_radix(dlc_str, 16).map_err(|_| AscError::BadDlc(dlc_str.to_owned()))?;
    if dlc as usize > MAX_DLC {
        return Err(AscError::BadDlc(dlc_str.to_owned()));
    }

    let mut data = [0u8; MAX_DLC];
    for slot in data.iter_mut().take(dlc as usize) {
        let byte_str = fields.next().ok_or(AscError::TruncatedPayload)?;
        *slot = u8::from_str_radix(byte_str, 16).map_err(|_| AscError::BadByte(byte_str.to_owned()))?;
    }

    Ok(Frame {
        channel,
        id,
        extended,
        rx,
        dlc,
        data,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_frame_fields() {
        // P5
        let original = Frame::new(0, 0x132, false, true, &[1, 2, 3, 4, 5, 6, 7, 8], 1234.567);
        let line = encode_line(&original);
        let decoded = decode_line(&line).unwrap();
        assert_eq!(decoded.id, original.id);
        assert_eq!(decoded.extended, original.extended);
        assert_eq!(decoded.dlc, original.dlc);
        assert_eq!(decoded.data, original.data);
        assert_eq!(decoded.channel, original.channel);
    }

    #[test]
    fn round_trip_extended_id() {
        let original = Frame::new(1, 0x18FEF100, true, true, &[0xAA, 0xBB], 0.5);
        let line = encode_line(&original);
        assert!(line.contains("18fef100x"));
        let decoded = decode_line(&line).unwrap();
        assert_eq!(decoded.id, 0x18FEF100);
        assert!(decoded.extended);
        assert_eq!(decoded.channel, 1);
    }

    #[test]
    fn decode_known_line_matches_expected_frame() {
        // S4
        let line = "1234.567 1 132 Rx d 8 01 02 03 04 05 06 07 08";
        let frame = decode_line(line).unwrap();
        assert_eq!(frame.id, 0x132);
        assert_eq!(frame.dlc, 8);
        assert_eq!(frame.payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frame.channel, 0);
        assert!(!frame.extended);
        assert!(frame.rx);
        assert!((frame.timestamp - 1234.567).abs() < 1e-9);
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let line = "0.0 1 132 Rx d 8 01 02 03";
        assert_eq!(decode_line(line), Err(AscError::TruncatedPayload));
    }

    #[test]
    fn decode_rejects_bad_direction() {
        let line = "0.0 1 132 Fw d 0";
        assert_eq!(decode_line(line), Err(AscError::BadDirection("Fw".to_owned())));
    }

    #[test]
    fn decode_rejects_missing_d_marker() {
        let line = "0.0 1 132 Rx x 0";
        assert_eq!(decode_line(line), Err(AscError::MissingDMarker));
    }
}
