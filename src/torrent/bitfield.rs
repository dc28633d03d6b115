//! Piece ownership bitfield with MSB-first bit layout

use bytes::Bytes;

use super::{PieceIndex, TorrentError};

/// Bitfield recording which pieces a party has, one bit per piece.
///
/// Bit layout matches the wire format: piece 0 is the most significant bit
/// of byte 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: u32,
}

impl Bitfield {
    /// Creates an all-zero bitfield for the given number of pieces.
    pub fn new(piece_count: u32) -> Self {
        let byte_count = piece_count.div_ceil(8);
        Self {
            bits: vec![0u8; byte_count as usize],
            piece_count,
        }
    }

    /// Creates an all-ones bitfield for the given number of pieces.
    pub fn new_full(piece_count: u32) -> Self {
        let byte_count = piece_count.div_ceil(8);
        let mut bits = vec![0xffu8; byte_count as usize];
        // zero the spare bits in the trailing byte
        if piece_count % 8 != 0 {
            if let Some(last) = bits.last_mut() {
                *last &= 0xffu8 << (8 - piece_count % 8);
            }
        }
        Self { bits, piece_count }
    }

    /// Creates a bitfield from raw wire bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidBitfieldSize` - Byte length disagrees with the piece count
    pub fn from_bytes(piece_data: Bytes, piece_count: u32) -> Result<Self, TorrentError> {
        let expected = piece_count.div_ceil(8) as usize;
        if piece_data.len() != expected {
            return Err(TorrentError::InvalidBitfieldSize {
                expected,
                actual: piece_data.len(),
            });
        }

        Ok(Self {
            bits: piece_data.to_vec(),
            piece_count,
        })
    }

    /// Checks whether the given piece bit is set.
    pub fn has_piece(&self, piece: PieceIndex) -> bool {
        let index = piece.as_u32();
        if index >= self.piece_count {
            return false;
        }

        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);

        byte_index < self.bits.len() && (self.bits[byte_index] & (1 << bit_index)) != 0
    }

    /// Sets the given piece bit.
    pub fn set_piece(&mut self, piece: PieceIndex) {
        let index = piece.as_u32();
        if index >= self.piece_count {
            return;
        }

        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);

        if byte_index < self.bits.len() {
            self.bits[byte_index] |= 1 << bit_index;
        }
    }

    /// Clears the given piece bit.
    pub fn clear_piece(&mut self, piece: PieceIndex) {
        let index = piece.as_u32();
        if index >= self.piece_count {
            return;
        }

        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);

        if byte_index < self.bits.len() {
            self.bits[byte_index] &= !(1 << bit_index);
        }
    }

    /// Raw bytes in wire layout.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Number of set bits.
    pub fn count_set(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    /// Number of pieces the bitfield covers.
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Whether every piece bit is set.
    pub fn has_all(&self) -> bool {
        self.count_set() == self.piece_count
    }

    /// Whether no piece bit is set.
    pub fn has_none(&self) -> bool {
        self.bits.iter().all(|byte| *byte == 0)
    }

    /// Unions another bitfield into this one.
    pub fn union_with(&mut self, other: &Bitfield) {
        for (dst, src) in self.bits.iter_mut().zip(other.bits.iter()) {
            *dst |= src;
        }
    }
}
