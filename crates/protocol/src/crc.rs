//! Modbus CRC16 (polynomial 0x8005 reflected as 0xA001, init 0xFFFF,
//! no final XOR). The checksum goes on the wire low byte first.

const POLY_REFLECTED: u16 = 0xA001;
const INIT: u16 = 0xFFFF;

/// Compute the CRC16 of `data`, returned in wire order (low byte first).
pub fn crc16(data: &[u8]) -> [u8; 2] {
    crc16_value(data).to_le_bytes()
}

/// The CRC16 of `data` as an integer.
pub fn crc16_value(data: &[u8]) -> u16 {
    let mut crc = INIT;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY_REFLECTED;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Return `data` followed by its two checksum bytes.
pub fn append_checksum(data: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(data.len() + 2);
    framed.extend_from_slice(data);
    framed.extend_from_slice(&crc16(data));
    framed
}

/// Check that the last two bytes of `data` are the CRC16 of the rest.
///
/// Inputs shorter than two bytes cannot carry a checksum and are rejected.
pub fn verify(data: &[u8]) -> bool {
    if data.len() < 2 {
        return false;
    }
    let (body, received) = data.split_at(data.len() - 2);
    crc16(body) == received
}
