// SoundWatch - Modbus CRC16
//
// Table-free CRC-16/MODBUS: seed 0xFFFF, reflected polynomial 0xA001.
// The checksum travels low byte first.

const CRC_SEED: u16 = 0xFFFF;
const CRC_POLY: u16 = 0xA001;

/// Compute the Modbus checksum of `bytes`.
pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(CRC_SEED, |crc, &byte| {
        let mut crc = crc ^ u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 0x0001 != 0 {
                (crc >> 1) ^ CRC_POLY
            } else {
                crc >> 1
            };
        }
        crc
    })
}

/// Split a frame into its body and the little-endian checksum trailer.
/// Frames shorter than the trailer have no body.
pub fn split_trailer(frame: &[u8]) -> Option<(&[u8], u16)> {
    if frame.len() < 2 {
        return None;
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    Some((body, u16::from_le_bytes([trailer[0], trailer[1]])))
}

/// `true` when the last two bytes of `frame` are the checksum of the rest.
pub fn validate(frame: &[u8]) -> bool {
    match split_trailer(frame) {
        Some((body, received)) => crc16(body) == received,
        None => false,
    }
}
