//! Pending handshakes
//!
//! The cryptographic handshake itself runs in its own driver; the manager
//! only tracks that one is in flight for a socket address, and consumes a
//! single completion callback carrying the [`HandshakeOutcome`].

use std::net::SocketAddr;

use crate::net::{EncryptionMode, PeerIo};
use crate::peer::clients::PeerId;
use crate::torrent::InfoHash;

/// One handshake in flight.
#[derive(Debug)]
pub struct Handshake {
    io: PeerIo,
    encryption: EncryptionMode,
    started_at: u64,
}

impl Handshake {
    /// Tracks a handshake over `io`, started at `now_secs`.
    pub fn new(io: PeerIo, encryption: EncryptionMode, now_secs: u64) -> Self {
        Self {
            io,
            encryption,
            started_at: now_secs,
        }
    }

    /// Remote endpoint of the socket.
    pub fn address(&self) -> SocketAddr {
        self.io.address()
    }

    /// Whether the remote side opened the connection.
    pub fn is_incoming(&self) -> bool {
        self.io.is_incoming()
    }

    /// Encryption policy the handshake runs under.
    pub fn encryption(&self) -> EncryptionMode {
        self.encryption
    }

    /// Wall second the handshake started. Timeouts are the transport's job;
    /// this is only for diagnostics.
    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    /// Consumes the record, yielding the transport handle.
    pub fn into_io(self) -> PeerIo {
        self.io
    }
}

/// Result of one completed handshake, success or failure.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// Whether the handshake completed and the connection is usable.
    pub ok: bool,
    /// Whether the remote side sent any bytes at all. `false` on failure
    /// means the address is likely unreachable, not merely unlucky.
    pub read_anything: bool,
    /// Whether the remote side opened the connection.
    pub is_incoming: bool,
    /// Whether the connection rides uTP.
    pub is_utp: bool,
    /// Remote peer id, when the handshake got that far.
    pub peer_id: Option<PeerId>,
    /// Endpoint of the socket.
    pub socket_address: SocketAddr,
    /// Torrent the handshake was for.
    pub info_hash: InfoHash,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_record() {
        let io = PeerIo::new_outgoing("10.0.0.1:6881".parse().unwrap(), true);
        let handshake = Handshake::new(io, EncryptionMode::Preferred, 500);

        assert_eq!(handshake.address(), "10.0.0.1:6881".parse().unwrap());
        assert!(!handshake.is_incoming());
        assert_eq!(handshake.started_at(), 500);
        assert!(handshake.into_io().is_utp());
    }
}
