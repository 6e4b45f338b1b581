//! CRC-64/ECMA-182: MSB-first, init 0, no reflection, no final xor.
//!
//! Peers compare checksums of serialized config blobs, so both sides must
//! agree bit for bit. [`crc64_bitwise`] is the reference; [`crc64`] is the
//! table-driven path and must always match it.

pub const CRC64_ECMA_POLY: u64 = 0x42F0_E1EB_A9EA_3693;

const TOP_BIT: u64 = 1 << 63;

const TABLE: [u64; 256] = build_table();

const fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u64) << 56;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & TOP_BIT != 0 {
                (crc << 1) ^ CRC64_ECMA_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Bit-at-a-time reference implementation.
pub fn crc64_bitwise(bytes: &[u8]) -> u64 {
    let mut crc = 0u64;
    for &b in bytes {
        crc ^= (b as u64) << 56;
        for _ in 0..8 {
            crc = if crc & TOP_BIT != 0 {
                (crc << 1) ^ CRC64_ECMA_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

pub fn crc64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |crc, &b| {
        let idx = ((crc >> 56) as u8 ^ b) as usize;
        TABLE[idx] ^ (crc << 8)
    })
}
