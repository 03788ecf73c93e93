//! Serial frames for the balance / powder dispenser.
//!
//! Every command is a Modbus-style request addressed to slave `0x01`:
//! `[address, function, reg_hi, reg_lo, arg_hi, arg_lo]` followed by the
//! CRC16 from [`crate::crc`]. Weight registers answer with a 32-bit signed
//! big-endian count of micrograms.

use crate::crc::{append_checksum, verify};

pub const DEVICE_ADDRESS: u8 = 0x01;
pub const READ_HOLDING: u8 = 0x03;
pub const WRITE_SINGLE: u8 = 0x06;
pub const WRITE_MULTIPLE: u8 = 0x10;

/// Device registers.
pub mod register {
    pub const STATUS: u16 = 0x0000;
    pub const LIVE_WEIGHT: u16 = 0x0001;
    pub const FINAL_WEIGHT: u16 = 0x0003;
    pub const TARGET_WEIGHT: u16 = 0x0010;
    pub const MODE: u16 = 0x0012;
    pub const BOTTLE_HEIGHT: u16 = 0x0013;
    pub const SAMPLER_RESET: u16 = 0x0020;
    pub const DISPENSE: u16 = 0x0021;
    pub const BALANCE_RESET: u16 = 0x0022;
    pub const BAFFLE: u16 = 0x0024;
}

/// Value written to the reset registers.
pub const RESET_MAGIC: u16 = 0xAAAA;

/// Status reply reported once a dispense cycle has finished.
pub const DISPENSE_COMPLETE_STATUS: [u8; 7] = [0x01, 0x03, 0x02, 0x00, 0x01, 0x79, 0x84];

/// Why a device reply could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("reply too short: {len} bytes")]
    TooShort { len: usize },

    #[error("unexpected header {address:#04x} {function:#04x}")]
    HeaderMismatch { address: u8, function: u8 },

    #[error("checksum mismatch on reply {0}")]
    Checksum(String),
}

/// `[0x01, 0x03, reg, count]` + CRC.
pub fn read_registers(register: u16, count: u16) -> Vec<u8> {
    let [rh, rl] = register.to_be_bytes();
    let [ch, cl] = count.to_be_bytes();
    append_checksum(&[DEVICE_ADDRESS, READ_HOLDING, rh, rl, ch, cl])
}

/// `[0x01, 0x06, reg, value]` + CRC.
pub fn write_register(register: u16, value: u16) -> Vec<u8> {
    let [rh, rl] = register.to_be_bytes();
    let [vh, vl] = value.to_be_bytes();
    append_checksum(&[DEVICE_ADDRESS, WRITE_SINGLE, rh, rl, vh, vl])
}

/// Write a 32-bit value across two consecutive registers (function 0x10).
pub fn write_u32(register: u16, value: u32) -> Vec<u8> {
    let [rh, rl] = register.to_be_bytes();
    let mut body = vec![DEVICE_ADDRESS, WRITE_MULTIPLE, rh, rl, 0x00, 0x02, 0x04];
    body.extend_from_slice(&value.to_be_bytes());
    append_checksum(&body)
}

/// Decode a weight reply: header, checksum, then the big-endian i32 at bytes 3..7.
pub fn decode_i32_reply(reply: &[u8]) -> Result<i32, FrameError> {
    if reply.len() < 7 {
        return Err(FrameError::TooShort { len: reply.len() });
    }
    if reply[0] != DEVICE_ADDRESS || reply[1] != READ_HOLDING {
        return Err(FrameError::HeaderMismatch {
            address: reply[0],
            function: reply[1],
        });
    }
    if !verify(reply) {
        return Err(FrameError::Checksum(hex::encode(reply)));
    }
    Ok(i32::from_be_bytes([reply[3], reply[4], reply[5], reply[6]]))
}

/// Convert a microgram count to milligrams (three decimals).
pub fn micrograms_to_mg(raw: i32) -> f64 {
    f64::from(raw) / 1000.0
}

/// Convert milligrams to the integer microgram count written to the target register.
pub fn mg_to_micrograms(mg: f64) -> u32 {
    let raw = (mg * 1000.0).round();
    if raw <= 0.0 {
        0
    } else if raw >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        raw as u32
    }
}

/// A write-multiple acknowledgment echoes address and function code.
pub fn is_write_multiple_ack(reply: &[u8]) -> bool {
    reply.len() >= 6 && reply[0] == DEVICE_ADDRESS && reply[1] == WRITE_MULTIPLE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_frame_matches_device_manual() {
        assert_eq!(
            read_registers(register::STATUS, 1),
            vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]
        );
    }

    #[test]
    fn dispense_complete_status_carries_valid_checksum() {
        assert!(verify(&DISPENSE_COMPLETE_STATUS));
    }

    #[test]
    fn target_weight_frame_layout() {
        let frame = write_u32(register::TARGET_WEIGHT, mg_to_micrograms(12.5));
        assert_eq!(&frame[..7], &[0x01, 0x10, 0x00, 0x10, 0x00, 0x02, 0x04]);
        assert_eq!(&frame[7..11], &12_500u32.to_be_bytes());
        assert!(verify(&frame));
    }

    #[test]
    fn decodes_weight_reply() {
        let reply = append_checksum(&[0x01, 0x03, 0x04, 0x00, 0x01, 0x8C, 0xF4]);
        let raw = decode_i32_reply(&reply).unwrap();
        assert_eq!(raw, 101_620);
        assert_eq!(micrograms_to_mg(raw), 101.62);
    }

    #[test]
    fn negative_weight_is_signed() {
        let reply = append_checksum(&[0x01, 0x03, 0x04, 0xFF, 0xFF, 0xFF, 0x9C]);
        assert_eq!(decode_i32_reply(&reply).unwrap(), -100);
        assert_eq!(micrograms_to_mg(-100), -0.1);
    }

    #[test]
    fn rejects_wrong_header() {
        let reply = append_checksum(&[0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(
            decode_i32_reply(&reply),
            Err(FrameError::HeaderMismatch {
                address: 0x02,
                function: 0x03
            })
        );
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut reply = append_checksum(&[0x01, 0x03, 0x04, 0x00, 0x00, 0x00, 0x01]);
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;
        assert!(matches!(decode_i32_reply(&reply), Err(FrameError::Checksum(_))));
    }

    #[test]
    fn rejects_short_reply() {
        assert_eq!(
            decode_i32_reply(&[0x01, 0x03]),
            Err(FrameError::TooShort { len: 2 })
        );
    }
}
