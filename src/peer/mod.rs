//! Peer swarm management: live connections, peer address book, scheduling

pub mod candidates;
pub mod choke;
pub mod clients;
pub mod connection;
pub mod events;
pub mod handshake;
pub mod info;
pub mod manager;
pub mod pex;
pub mod requests;
pub mod salt;
pub mod swarm;

use std::fmt;

pub use connection::{PeerChannel, PeerConnection, Transfer, Webseed};
pub use events::PeerEvent;
pub use handshake::{Handshake, HandshakeOutcome};
pub use info::{PeerInfo, PeerInfoHandle};
pub use manager::{PeerListMode, PeerManager, PeerStats, PulseDriver};
pub use pex::Pex;
pub use requests::ActiveRequests;
pub use swarm::{Swarm, SwarmStats};

/// How a peer address was first learned.
///
/// Lower discriminants are more trusted; candidate scoring and the
/// usefulness comparator both prefer smaller ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PeerSource {
    /// The peer connected to us.
    Incoming = 0,
    /// A tracker announce response.
    Tracker = 1,
    /// The distributed hash table.
    Dht = 2,
    /// Peer exchange with another peer.
    Pex = 3,
    /// The LTEP extension handshake.
    Ltep = 4,
    /// Local peer discovery broadcast.
    Lpd = 5,
    /// A resume file from an earlier session.
    Resume = 6,
    /// Added by hand.
    Manual = 7,
}

impl PeerSource {
    /// Number of source variants, for per-source counters.
    pub const COUNT: usize = 8;

    /// Trust rank; lower is more trusted.
    pub fn rank(self) -> u8 {
        self as u8
    }

    /// Index usable for per-source arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for PeerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerSource::Incoming => "incoming",
            PeerSource::Tracker => "tracker",
            PeerSource::Dht => "dht",
            PeerSource::Pex => "pex",
            PeerSource::Ltep => "ltep",
            PeerSource::Lpd => "lpd",
            PeerSource::Resume => "resume",
            PeerSource::Manual => "manual",
        };
        write!(f, "{name}")
    }
}

/// PEX advertisement flag byte (the `added.f` bitset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PexFlags(u8);

impl PexFlags {
    /// Peer prefers encrypted connections.
    pub const ENCRYPTION: PexFlags = PexFlags(0x01);
    /// Peer is a seed.
    pub const SEED: PexFlags = PexFlags(0x02);
    /// Peer supports uTP.
    pub const UTP: PexFlags = PexFlags(0x04);
    /// Peer supports the holepunch extension.
    pub const HOLEPUNCH: PexFlags = PexFlags(0x08);
    /// Peer is reachable at the advertised address.
    pub const CONNECTABLE: PexFlags = PexFlags(0x10);

    /// Creates flags from a raw byte.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flag byte.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every flag in `other` is set.
    pub fn contains(self, other: PexFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the flags in `other`.
    pub fn insert(&mut self, other: PexFlags) {
        self.0 |= other.0;
    }

    /// Union of both flag sets.
    pub fn union(self, other: PexFlags) -> PexFlags {
        PexFlags(self.0 | other.0)
    }
}

/// Identity of one transfer (live peer or webseed) within a swarm.
///
/// Stable for the transfer's lifetime and never reused within a swarm, so it
/// can key [`ActiveRequests`] and survive in caches between pulses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_ranks_are_ordered() {
        assert!(PeerSource::Incoming.rank() < PeerSource::Tracker.rank());
        assert!(PeerSource::Tracker.rank() < PeerSource::Pex.rank());
        assert!(PeerSource::Resume.rank() < PeerSource::Manual.rank());
        assert_eq!(PeerSource::Manual.index(), PeerSource::COUNT - 1);
    }

    #[test]
    fn test_pex_flag_operations() {
        let mut flags = PexFlags::default();
        assert!(!flags.contains(PexFlags::SEED));

        flags.insert(PexFlags::SEED);
        flags.insert(PexFlags::UTP);
        assert!(flags.contains(PexFlags::SEED));
        assert!(flags.contains(PexFlags::UTP));
        assert!(!flags.contains(PexFlags::CONNECTABLE));
        assert_eq!(flags.bits(), 0x06);

        let merged = flags.union(PexFlags::CONNECTABLE);
        assert!(merged.contains(PexFlags::CONNECTABLE));
    }
}
