//! Checksums shared by the wire protocol and the on-disk stores.

/// CRC16 used by the decoded-log records and the backlog spill files.
///
/// Polynomial 0x1021, initial value 0xFFFF, no reflection.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xffffu16, |crc, byte| {
        let x = ((crc >> 8) as u8 ^ *byte) as u16;
        let x = x ^ (x >> 4);
        (crc << 8) ^ (x << 12) ^ (x << 5) ^ x
    })
}

/// XOR checksum over a byte range, as used by the outer telemetry
/// packet and the MCU serial frame.
#[must_use]
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}
