//! Host-side equivalent of the STM32 hardware CRC unit.
//!
//! The CRC peripheral computes a big-endian CRC-32 (polynomial
//! `0x04C11DB7`, no reflection) over 32-bit words, but loads each word
//! from memory little-endian first. That byte swap rules out the usual
//! table-driven CRC-32 implementations, so this is the plain bit-serial
//! form; it only runs as a fallback when the bootloader lacks the CRC
//! command, and throughput is bounded by the serial link anyway.

/// CRC polynomial of the STM32 CRC unit (MSB-first).
const POLY: u32 = 0x04C1_1DB7;

/// Initial CRC register value.
pub const CRC_INIT: u32 = 0xFFFF_FFFF;

/// Feed `data` into a running CRC.
///
/// `data.len()` must be a multiple of four; bytes are consumed as
/// little-endian 32-bit words to match the hardware's load order.
#[must_use]
pub fn update(mut crc: u32, data: &[u8]) -> u32 {
    debug_assert!(data.len() % 4 == 0, "CRC data must be word aligned");

    for word in data.chunks_exact(4) {
        crc ^= u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        for _ in 0..32 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}
