//! Torrent-side types consumed by the swarm layer

pub mod bitfield;
pub mod model;

use std::fmt;

pub use bitfield::Bitfield;
pub use model::{Torrent, TorrentBuilder, TorrentEvent};

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Session-unique torrent identifier.
///
/// Survives between pulses even if the torrent itself is removed, which makes
/// it a safer key than a reference for caches that outlive a single pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TorrentId(pub u32);

impl fmt::Display for TorrentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zero-based index of a block within a torrent.
///
/// Blocks are the 16 KiB transfer unit; pieces are divided into blocks for
/// requesting and are verified as a whole once every block has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIndex(pub u64);

impl BlockIndex {
    /// Creates BlockIndex from zero-based index.
    pub fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the underlying block index as u64.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open range of blocks `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    /// First block in the span.
    pub begin: BlockIndex,
    /// One past the last block in the span.
    pub end: BlockIndex,
}

impl BlockSpan {
    /// Creates a span covering `[begin, end)`.
    pub fn new(begin: BlockIndex, end: BlockIndex) -> Self {
        Self { begin, end }
    }

    /// Number of blocks in the span.
    pub fn len(&self) -> u64 {
        self.end.0.saturating_sub(self.begin.0)
    }

    /// Whether the span contains no blocks.
    pub fn is_empty(&self) -> bool {
        self.end.0 <= self.begin.0
    }

    /// Iterates the block indices in the span.
    pub fn iter(&self) -> impl Iterator<Item = BlockIndex> + use<> {
        (self.begin.0..self.end.0).map(BlockIndex)
    }
}

/// Torrent bandwidth priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Scheduled ahead of normal-priority torrents.
    High,
    /// The default.
    #[default]
    Normal,
    /// Scheduled after everything else.
    Low,
}

/// Transfer direction relative to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peer-to-client: bytes we download.
    Down,
    /// Client-to-peer: bytes we upload.
    Up,
}

impl Direction {
    /// Index usable for per-direction arrays.
    pub fn index(self) -> usize {
        match self {
            Direction::Down => 0,
            Direction::Up => 1,
        }
    }
}

/// Errors that can occur during torrent-level operations.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    /// Piece index past the end of the torrent.
    #[error("Piece {index} out of range")]
    PieceOutOfRange {
        /// The offending piece index.
        index: PieceIndex,
    },

    /// Block index past the end of the torrent.
    #[error("Block {index} out of range")]
    BlockOutOfRange {
        /// The offending block index.
        index: BlockIndex,
    },

    /// Bitfield byte length disagrees with the piece count.
    #[error("Invalid bitfield size: expected {expected} bytes, got {actual}")]
    InvalidBitfieldSize {
        /// Byte count implied by the piece count.
        expected: usize,
        /// Byte count actually supplied.
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_block_span_iteration() {
        let span = BlockSpan::new(BlockIndex(3), BlockIndex(6));
        assert_eq!(span.len(), 3);
        assert!(!span.is_empty());
        let blocks: Vec<u64> = span.iter().map(BlockIndex::as_u64).collect();
        assert_eq!(blocks, vec![3, 4, 5]);
    }

    #[test]
    fn test_empty_block_span() {
        let span = BlockSpan::new(BlockIndex(6), BlockIndex(6));
        assert!(span.is_empty());
        assert_eq!(span.iter().count(), 0);
    }

    #[test]
    fn test_direction_index() {
        assert_eq!(Direction::Down.index(), 0);
        assert_eq!(Direction::Up.index(), 1);
    }
}
