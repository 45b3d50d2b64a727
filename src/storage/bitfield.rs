//! Piece bitfields
//!
//! One bit per piece, most significant bit of the first byte is piece 0.

use anyhow::Result;
use bitvec::prelude::*;
use bytes::Bytes;

use crate::error::TorrentError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
}

impl Bitfield {
    /// An empty bitfield for `len` pieces
    pub fn new(len: usize) -> Self {
        Self {
            bits: bitvec![u8, Msb0; 0; len],
        }
    }

    /// Parse a bitfield message payload for a torrent with `len` pieces
    ///
    /// The payload must be exactly `ceil(len / 8)` bytes with zero spare bits.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        if bytes.len() != len.div_ceil(8) {
            return Err(TorrentError::protocol_with_detail(
                "Bitfield has wrong length",
                format!("{} bytes for {} pieces", bytes.len(), len),
            )
            .into());
        }
        let mut bits = BitVec::<u8, Msb0>::from_slice(bytes);
        if bits[len..].any() {
            return Err(TorrentError::protocol("Bitfield has spare bits set").into());
        }
        bits.truncate(len);
        Ok(Self { bits })
    }

    /// Accept a payload without knowing the piece count (magnet downloads)
    pub fn from_bytes_unsized(bytes: &[u8]) -> Self {
        Self {
            bits: BitVec::from_slice(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn has(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Set a bit; an unsized bitfield grows to fit
    pub fn set(&mut self, index: usize) {
        if index >= self.bits.len() {
            self.bits.resize(index + 1, false);
        }
        self.bits.set(index, true);
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.bits.len() {
            self.bits.set(index, false);
        }
    }

    /// Fit to a known piece count, dropping bits past the end
    pub fn resize(&mut self, len: usize) {
        self.bits.resize(len, false);
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    /// Every piece is set
    pub fn is_complete(&self) -> bool {
        self.bits.all()
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// Wire form with zeroed spare bits
    pub fn to_bytes(&self) -> Bytes {
        let mut bits = self.bits.clone();
        bits.set_uninitialized(false);
        Bytes::copy_from_slice(bits.as_raw_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_first_layout() {
        let mut bitfield = Bitfield::new(10);
        bitfield.set(0);
        bitfield.set(9);
        assert_eq!(bitfield.to_bytes().as_ref(), &[0b1000_0000, 0b0100_0000]);
        assert_eq!(bitfield.count(), 2);
    }

    #[test]
    fn test_from_bytes_validates_length() {
        assert!(Bitfield::from_bytes(&[0xff], 10).is_err());
        let bitfield = Bitfield::from_bytes(&[0xff, 0xc0], 10).unwrap();
        assert!(bitfield.is_complete());
        assert_eq!(bitfield.len(), 10);
    }

    #[test]
    fn test_from_bytes_rejects_spare_bits() {
        assert!(Bitfield::from_bytes(&[0xff, 0xe0], 10).is_err());
    }

    #[test]
    fn test_unsized_grows_and_resizes() {
        let mut bitfield = Bitfield::from_bytes_unsized(&[0b0010_0000]);
        assert!(bitfield.has(2));
        bitfield.set(12);
        assert!(bitfield.has(12));
        bitfield.resize(4);
        assert_eq!(bitfield.len(), 4);
        assert!(!bitfield.has(12));
        assert_eq!(bitfield.iter_set().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_has_out_of_range() {
        let bitfield = Bitfield::new(3);
        assert!(!bitfield.has(100));
    }
}
