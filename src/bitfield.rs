//! The compact bit vector used to represent a peer's piece availability.
//!
//! This is a thin set of free functions around the crate's [`Bitfield`]
//! alias (`bitvec::BitVec<Msb0, u8>`) rather than a new type, since `bitvec`
//! already gives us everything else (indexing, `all()`, `resize()`, ...)
//! that `peer::session` needs.

use crate::{error::Error, Bitfield};

/// Parses a BITFIELD message payload into a [`Bitfield`] of exactly
/// `numpieces` bits.
///
/// The wire representation pads the last byte with zero bits up to a byte
/// boundary, so the payload's length in bytes must be
/// `ceil(numpieces / 8)`, and any padding bits in the final byte must be
/// zero — a peer that sets "phantom" pieces past `numpieces` is sending a
/// malformed bitfield.
pub fn from_bytes(numpieces: u32, bytes: &[u8]) -> Result<Bitfield, Error> {
    let expected_len = ((numpieces as usize) + 7) / 8;
    if bytes.len() != expected_len {
        return Err(Error::InvalidBitfieldLength);
    }

    let mut bitfield = Bitfield::from_slice(bytes);
    // bitvec gives us numpieces.div_ceil(8) * 8 bits; the trailing padding
    // bits (if any) must be zero.
    let padding_bits = bitfield.len() - numpieces as usize;
    if padding_bits > 0 {
        let tail_start = bitfield.len() - padding_bits;
        if bitfield[tail_start..].any() {
            return Err(Error::InvalidBitfieldLength);
        }
    }
    bitfield.resize(numpieces as usize, false);
    Ok(bitfield)
}

/// Serializes a [`Bitfield`] to its wire byte representation, zero-padding
/// the final byte as needed.
pub fn to_bytes(bitfield: &Bitfield) -> Vec<u8> {
    let mut padded = bitfield.clone();
    let padded_len = ((padded.len() + 7) / 8) * 8;
    padded.resize(padded_len, false);
    padded.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_byte_aligned_bitfield() {
        let numpieces = 16;
        let bytes = vec![0b1100_0001, 0b0000_0010];
        let bitfield = from_bytes(numpieces, &bytes).unwrap();
        assert_eq!(bitfield.len(), numpieces as usize);
        assert!(bitfield[0]);
        assert!(bitfield[1]);
        assert!(bitfield[7]);
        assert!(bitfield[14]);
        assert_eq!(to_bytes(&bitfield), bytes);
    }

    #[test]
    fn round_trips_non_byte_aligned_bitfield() {
        // 10 pieces needs 2 bytes on the wire, with 6 padding bits.
        let numpieces = 10;
        let bytes = vec![0b1010_1010, 0b1100_0000];
        let bitfield = from_bytes(numpieces, &bytes).unwrap();
        assert_eq!(bitfield.len(), numpieces as usize);
        assert_eq!(to_bytes(&bitfield), bytes);
    }

    #[test]
    fn rejects_wrong_byte_length() {
        assert!(from_bytes(16, &[0u8; 1]).is_err());
        assert!(from_bytes(16, &[0u8; 3]).is_err());
    }

    #[test]
    fn rejects_set_padding_bits() {
        // numpieces = 10 means bits 10..16 of the second byte are padding
        // and must be zero; bit 15 (the last bit) is set here, which isn't.
        let bytes = vec![0b0000_0000, 0b0000_0001];
        assert!(from_bytes(10, &bytes).is_err());
    }
}
