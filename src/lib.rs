//! Undertow - peer swarm management for BitTorrent clients

#![deny(missing_docs)]
#![deny(clippy::missing_errors_doc)]
#![warn(clippy::too_many_lines)]
//!
//! This crate is the scheduling brain of a BitTorrent client: per torrent it
//! maintains the population of connected peers and the address book behind
//! them, decides who to dial, who to disconnect, who to request blocks
//! from, and who to serve. The wire protocol, disk I/O, and trackers live
//! in the embedding client and talk to the manager through small seams.

pub mod clock;
pub mod config;
pub mod net;
pub mod peer;
pub mod torrent;
pub mod tracing_setup;
pub mod wishlist;

// Re-export main types for convenient access
pub use clock::SessionClock;
pub use config::UndertowConfig;
pub use net::{AddressFamily, Blocklist, EncryptionMode, PeerIo, Transport, TransportError};
pub use peer::{
    ActiveRequests, HandshakeOutcome, PeerChannel, PeerEvent, PeerListMode, PeerManager,
    PeerSource, PeerStats, Pex, PexFlags, PulseDriver, Swarm, SwarmStats, TransferId,
};
pub use torrent::{
    Bitfield, BlockIndex, BlockSpan, InfoHash, PieceIndex, Torrent, TorrentBuilder, TorrentError,
    TorrentEvent, TorrentId,
};
pub use tracing_setup::init_tracing;
pub use wishlist::{FirstFitWishlist, Wishlist, WishlistMediator};

/// Errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    /// Torrent-model errors (geometry, bitfields).
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    /// Transport-layer errors (socket creation, limits).
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using UndertowError as the error type.
pub type Result<T> = std::result::Result<T, UndertowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let torrent_error = TorrentError::InvalidBitfieldSize {
            expected: 2,
            actual: 1,
        };
        let error: UndertowError = torrent_error.into();
        assert!(matches!(error, UndertowError::Torrent(_)));
        assert!(error.to_string().contains("Torrent error"));
    }
}
