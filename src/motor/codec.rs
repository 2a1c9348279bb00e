// Wire format for the motor boards
//
// host -> board: '$'                                   poll, 1 byte
// board -> host: 2x [rpm, err, pid, p, i, d] as f32    48 bytes, slot 0 first
// host -> board: '&', u32 slot, f32 kp, ki, kd, f64 sp 25 bytes
//
// All numbers are little-endian. There is no checksum; the serial link's framing is trusted.

use crate::messages::{MotorParams, Telemetry};

/// Marker byte that requests a telemetry response
pub const POLL_MARKER: u8 = b'$';

/// Marker byte that starts a parameter-update request
pub const UPDATE_MARKER: u8 = b'&';

/// Telemetry bytes per motor (six f32)
pub const TELEMETRY_FRAME_LEN: usize = 24;

/// Full poll response: one telemetry frame per slot
pub const RESPONSE_LEN: usize = 2 * TELEMETRY_FRAME_LEN;

/// Marker + u32 + 3x f32 + f64
pub const UPDATE_FRAME_LEN: usize = 1 + 4 + 3 * 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Short frame: expected {expected} bytes, got {actual}")]
    ShortFrame { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Build a parameter-update request for `slot`
pub fn encode_update(slot: u32, params: &MotorParams) -> [u8; UPDATE_FRAME_LEN] {
    let mut frame = [0u8; UPDATE_FRAME_LEN];
    frame[0] = UPDATE_MARKER;
    frame[1..5].copy_from_slice(&slot.to_le_bytes());
    frame[5..9].copy_from_slice(&params.kp.to_le_bytes());
    frame[9..13].copy_from_slice(&params.ki.to_le_bytes());
    frame[13..17].copy_from_slice(&params.kd.to_le_bytes());
    frame[17..25].copy_from_slice(&params.setpoint.to_le_bytes());
    frame
}

/// Decode one motor's telemetry; the slice must be exactly 24 bytes
pub fn decode_telemetry(bytes: &[u8]) -> Result<Telemetry> {
    if bytes.len() != TELEMETRY_FRAME_LEN {
        return Err(DecodeError::ShortFrame {
            expected: TELEMETRY_FRAME_LEN,
            actual: bytes.len(),
        });
    }

    let mut values = [0f32; 6];
    for (value, chunk) in values.iter_mut().zip(bytes.chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(Telemetry::from_array(values))
}

/// Decode a full poll response into [slot 0, slot 1]
pub fn decode_response(bytes: &[u8]) -> Result<[Telemetry; 2]> {
    if bytes.len() != RESPONSE_LEN {
        return Err(DecodeError::ShortFrame {
            expected: RESPONSE_LEN,
            actual: bytes.len(),
        });
    }

    let (first, second) = bytes.split_at(TELEMETRY_FRAME_LEN);
    Ok([decode_telemetry(first)?, decode_telemetry(second)?])
}

/// Encode one motor's telemetry the way a board does (used by simulators and tests)
pub fn encode_telemetry(telemetry: &Telemetry) -> [u8; TELEMETRY_FRAME_LEN] {
    let mut frame = [0u8; TELEMETRY_FRAME_LEN];
    for (chunk, value) in frame.chunks_exact_mut(4).zip(telemetry.as_array()) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_frame_layout() {
        let params = MotorParams {
            setpoint: 120.0,
            kp: 2.0,
            ki: 0.5,
            kd: 0.25,
        };
        let frame = encode_update(1, &params);

        assert_eq!(frame.len(), 25);
        assert_eq!(UPDATE_FRAME_LEN, 25);
        assert_eq!(frame[0], b'&');
        assert_eq!(&frame[1..5], &[1u8, 0, 0, 0]);
        assert_eq!(&frame[5..9], &2.0f32.to_le_bytes());
        assert_eq!(&frame[9..13], &0.5f32.to_le_bytes());
        assert_eq!(&frame[13..17], &0.25f32.to_le_bytes());
        assert_eq!(&frame[17..25], &120.0f64.to_le_bytes());
    }

    #[test]
    fn test_telemetry_decodes_little_endian() {
        // 1.0f32 = 0x3F800000, little-endian on the wire
        let mut bytes = [0u8; 24];
        bytes[0..4].copy_from_slice(&[0x00, 0x00, 0x80, 0x3F]);
        bytes[20..24].copy_from_slice(&[0x00, 0x00, 0x00, 0xC0]); // -2.0

        let telemetry = decode_telemetry(&bytes).unwrap();
        assert_eq!(telemetry.rpm, 1.0);
        assert_eq!(telemetry.derivative, -2.0);
        assert_eq!(telemetry.error, 0.0);
    }

    #[test]
    fn test_telemetry_round_trip_is_exact() {
        let original = Telemetry::from_array([1523.25, -0.125, 3.5e-3, f32::MAX, -0.0, 42.0]);
        let decoded = decode_telemetry(&encode_telemetry(&original)).unwrap();
        assert_eq!(decoded.as_array(), original.as_array());
    }

    #[test]
    fn test_wrong_lengths_are_short_frames() {
        assert_eq!(
            decode_telemetry(&[0u8; 23]),
            Err(DecodeError::ShortFrame {
                expected: 24,
                actual: 23
            })
        );
        assert!(decode_telemetry(&[0u8; 25]).is_err());
        assert_eq!(
            decode_response(&[0u8; 47]),
            Err(DecodeError::ShortFrame {
                expected: 48,
                actual: 47
            })
        );
        assert!(decode_response(&[0u8; 49]).is_err());
        assert!(decode_response(&[]).is_err());
    }

    #[test]
    fn test_response_splits_slots_in_order() {
        let first = Telemetry {
            rpm: 100.0,
            ..Telemetry::default()
        };
        let second = Telemetry {
            rpm: 200.0,
            ..Telemetry::default()
        };
        let mut bytes = encode_telemetry(&first).to_vec();
        bytes.extend_from_slice(&encode_telemetry(&second));

        let [a, b] = decode_response(&bytes).unwrap();
        assert_eq!(a.rpm, 100.0);
        assert_eq!(b.rpm, 200.0);
    }
}
