// crc.rs — 16-bit CCITT CRC (polynomial 0x1021)
//
// Used to fingerprint the field layout of a compiled gameplay program;
// the value is compared against the header CRC the engine was built for.

use crc::{Crc, CRC_16_IBM_3740};

const CRC_CALC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

#[inline]
pub fn crc_init() -> u16 {
    0xffff
}

/// Fold one byte into a running CRC.
#[inline]
pub fn crc_process_byte(crc: u16, data: u8) -> u16 {
    let mut digest = CRC_CALC.digest_with_initial(crc);
    digest.update(&[data]);
    digest.finalize()
}

/// Checksum of a whole block.
pub fn crc_block(data: &[u8]) -> u16 {
    CRC_CALC.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_empty_is_init() {
        assert_eq!(crc_block(&[]), crc_init());
    }

    #[test]
    fn test_crc_known_value() {
        // CRC-16/CCITT-FALSE check value
        assert_eq!(crc_block(b"123456789"), 0x29b1);
    }

    #[test]
    fn test_crc_byte_by_byte_matches_block() {
        let data = b"entvars_t";
        let crc = data.iter().fold(crc_init(), |c, &b| crc_process_byte(c, b));
        assert_eq!(crc, crc_block(data));
    }
}
