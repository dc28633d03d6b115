//! Events raised by the wire-protocol driver
//!
//! The driver owns the socket and the message framing; whenever something
//! the swarm cares about happens, it surfaces one of these events through
//! `PeerManager::peer_event`.

use bytes::Bytes;

use crate::torrent::PieceIndex;

/// One event on a live peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Piece payload arrived from the peer.
    GotPieceData {
        /// Payload length in bytes.
        length: u32,
    },
    /// Piece payload was written to the peer.
    SentPieceData {
        /// Payload length in bytes.
        length: u32,
    },
    /// The peer announced one piece.
    GotHave(PieceIndex),
    /// The peer announced it has every piece.
    GotHaveAll,
    /// The peer announced it has no pieces.
    GotHaveNone,
    /// The peer sent its full bitfield.
    GotBitfield(Bytes),
    /// The peer choked us.
    GotChoke,
    /// The peer advertised its listening port.
    GotPort {
        /// Advertised listening port; 0 means "none".
        port: u16,
    },
    /// The peer suggested a piece (BEP 6). Not currently acted on.
    GotSuggest(PieceIndex),
    /// The peer allowed a piece while choked (BEP 6). Not currently acted on.
    GotAllowedFast(PieceIndex),
    /// The peer rejected one of our requests.
    GotReject {
        /// Piece of the rejected request.
        piece: PieceIndex,
        /// Byte offset of the rejected request within the piece.
        offset: u32,
    },
    /// A requested block arrived in full.
    GotBlock {
        /// Piece the block belongs to.
        piece: PieceIndex,
        /// Byte offset of the block within the piece.
        offset: u32,
    },
    /// The connection reported an error.
    Error(PeerErrorCode),
}

/// Error classification from the wire driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerErrorCode {
    /// A message referenced data outside the torrent.
    OutOfRange,
    /// A message exceeded the framing limit.
    MessageTooBig,
    /// The socket turned out not to be connected.
    NotConnected,
    /// Anything else; logged but not acted on.
    Other,
}

impl PeerErrorCode {
    /// Whether this error is a protocol violation that warrants
    /// disconnecting the peer.
    pub fn is_protocol_fault(self) -> bool {
        matches!(
            self,
            PeerErrorCode::OutOfRange | PeerErrorCode::MessageTooBig | PeerErrorCode::NotConnected
        )
    }
}
