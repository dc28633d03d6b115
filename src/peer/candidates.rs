//! Outbound candidate selection
//!
//! Each bandwidth pulse may initiate a bounded number of outgoing
//! connections. Building the candidate list means scanning every
//! connectable pool, so the ranked result is cached and consumed tail-first
//! across a few pulses before being rebuilt.

use std::net::SocketAddr;

use crate::net::Blocklist;
use crate::peer::info::PeerInfo;
use crate::peer::swarm::Swarm;
use crate::torrent::{Priority, Torrent, TorrentId};

/// Arbitrary dial throttle to avoid overloading consumer routers.
pub(crate) const MAX_CONNECTIONS_PER_SECOND: usize = 18;

/// Dials initiated per 500 ms bandwidth pulse.
pub(crate) const MAX_CONNECTIONS_PER_PULSE: usize = MAX_CONNECTIONS_PER_SECOND / 2;

/// Bandwidth pulses a cached candidate list is allowed to feed.
pub(crate) const OUTBOUND_CANDIDATES_TTL_PULSES: usize = 4;

/// Entries kept when the candidate list is rebuilt.
pub(crate) const OUTBOUND_CANDIDATE_LIST_CAPACITY: usize =
    MAX_CONNECTIONS_PER_PULSE * OUTBOUND_CANDIDATES_TTL_PULSES;

/// Fraction of the session peer budget outbound dialing may consume,
/// leaving the rest for incoming connections.
pub(crate) const OUTBOUND_PEER_BUDGET_RATIO: f64 = 0.95;

/// Cached dial candidates, best at the tail for cheap popping.
///
/// Keys are (torrent id, listen address) rather than references: torrents
/// and records can disappear between pulses, and stale entries are simply
/// filtered at consumption time.
#[derive(Debug, Default)]
pub(crate) struct OutboundCandidates {
    entries: Vec<(TorrentId, SocketAddr)>,
}

impl OutboundCandidates {
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replaces the cache with a best-last ranked list.
    pub(crate) fn refill(&mut self, best_last: Vec<(TorrentId, SocketAddr)>) {
        self.entries = best_last;
    }

    /// Pops the best remaining candidate.
    pub(crate) fn pop(&mut self) -> Option<(TorrentId, SocketAddr)> {
        self.entries.pop()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Whether this record is someone we would dial right now.
pub(crate) fn is_peer_candidate(
    torrent: &Torrent,
    swarm: &Swarm,
    info: &mut PeerInfo,
    blocklist: &Blocklist,
    now_secs: u64,
) -> bool {
    // already tried and failed to connect
    if info.is_connectable() == Some(false) {
        return false;
    }

    // both seeds: nothing to trade
    if torrent.is_done() && info.is_seed() {
        return false;
    }

    // already connected or mid-handshake
    if swarm.peer_is_in_use(info) {
        return false;
    }

    // still inside the reconnect backoff
    if !info.reconnect_interval_has_passed(now_secs) {
        return false;
    }

    if info.is_blocklisted(blocklist) {
        return false;
    }

    if info.is_banned() {
        return false;
    }

    true
}

/// Packs one more field into the low bits of the score key.
const fn add_val_to_key(value: u64, width: u32, addme: u64) -> u64 {
    (value << width) | addme
}

/// Dial-priority score; smaller is better.
///
/// A 64-bit key packed most-significant-field first, so a full comparison
/// falls out of integer ordering.
pub(crate) fn candidate_score(
    torrent: &Torrent,
    info: &PeerInfo,
    salt: u8,
    now_secs: u64,
) -> u64 {
    let mut score = 0u64;

    // peers we connected to, or never tried, before peers that failed
    let failed = u64::from(info.connection_failure_count() != 0);
    score = add_val_to_key(score, 1, failed);

    // least recently attempted first, to cycle through the pool
    score = add_val_to_key(score, 32, u64::from(info.connection_attempt_time() as u32));

    // higher-priority torrents first
    let priority = match torrent.priority() {
        Priority::High => 0u64,
        Priority::Normal => 1,
        Priority::Low => 2,
    };
    score = add_val_to_key(score, 4, priority);

    // recently started torrents first
    score = add_val_to_key(score, 1, u64::from(!torrent.recently_started(now_secs)));

    // torrents still downloading first
    score = add_val_to_key(score, 1, u64::from(torrent.is_done()));

    // peers known to be reachable first
    score = add_val_to_key(score, 1, u64::from(info.is_connectable() != Some(true)));

    // leechers first: they are upload opportunities
    score = add_val_to_key(score, 1, u64::from(!info.is_seed()));

    // more trusted discovery sources first
    score = add_val_to_key(score, 4, u64::from(info.from_best().rank()));

    add_val_to_key(score, 8, u64::from(salt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerSource, PexFlags};
    use crate::torrent::{InfoHash, TorrentBuilder};

    fn test_torrent(done: bool) -> Torrent {
        let builder = TorrentBuilder::new(InfoHash::new([5u8; 20]), 64 * 1024, 32 * 1024);
        let builder = if done { builder.with_all_pieces() } else { builder };
        let mut torrent = builder.build(TorrentId(1));
        torrent.start(1_000);
        torrent
    }

    fn test_info(from: PeerSource) -> PeerInfo {
        PeerInfo::new("10.0.0.1".parse().unwrap(), Some(6881), PexFlags::default(), from)
    }

    #[test]
    fn test_score_prefers_never_failed() {
        let torrent = test_torrent(false);
        let clean = test_info(PeerSource::Tracker);
        let mut flaky = test_info(PeerSource::Tracker);
        flaky.on_connection_failed();

        assert!(
            candidate_score(&torrent, &clean, 0xff, 1_000)
                < candidate_score(&torrent, &flaky, 0x00, 1_000)
        );
    }

    #[test]
    fn test_score_prefers_older_attempts() {
        let torrent = test_torrent(false);
        let mut stale = test_info(PeerSource::Tracker);
        stale.set_connection_attempt_time(100);
        let mut fresh = test_info(PeerSource::Tracker);
        fresh.set_connection_attempt_time(900);

        assert!(
            candidate_score(&torrent, &stale, 0xff, 1_000)
                < candidate_score(&torrent, &fresh, 0x00, 1_000)
        );
    }

    #[test]
    fn test_score_prefers_leechers_and_trusted_sources() {
        let torrent = test_torrent(false);
        let leecher = test_info(PeerSource::Tracker);
        let mut seed = test_info(PeerSource::Tracker);
        seed.set_seed();

        assert!(
            candidate_score(&torrent, &leecher, 0xff, 1_000)
                < candidate_score(&torrent, &seed, 0x00, 1_000)
        );

        let tracker = test_info(PeerSource::Tracker);
        let pex = test_info(PeerSource::Pex);
        assert!(
            candidate_score(&torrent, &tracker, 0xff, 1_000)
                < candidate_score(&torrent, &pex, 0x00, 1_000)
        );
    }

    #[test]
    fn test_score_salt_breaks_ties() {
        let torrent = test_torrent(false);
        let a = test_info(PeerSource::Tracker);
        let b = test_info(PeerSource::Tracker);

        let score_a = candidate_score(&torrent, &a, 1, 1_000);
        let score_b = candidate_score(&torrent, &b, 2, 1_000);
        assert_ne!(score_a, score_b);
        assert!(score_a < score_b);
    }

    #[test]
    fn test_candidate_rejections() {
        let torrent = test_torrent(false);
        let swarm = Swarm::new(&torrent);
        let blocklist = Blocklist::new();
        let now = 1_000_000;

        let mut ok = test_info(PeerSource::Tracker);
        assert!(is_peer_candidate(&torrent, &swarm, &mut ok, &blocklist, now));

        let mut unreachable = test_info(PeerSource::Tracker);
        unreachable.set_connectable(false);
        assert!(!is_peer_candidate(&torrent, &swarm, &mut unreachable, &blocklist, now));

        let mut banned = test_info(PeerSource::Tracker);
        banned.ban();
        assert!(!is_peer_candidate(&torrent, &swarm, &mut banned, &blocklist, now));

        let mut connected = test_info(PeerSource::Tracker);
        connected.set_connected(true, now);
        assert!(!is_peer_candidate(&torrent, &swarm, &mut connected, &blocklist, now));

        let mut backing_off = test_info(PeerSource::Tracker);
        backing_off.on_connection_failed();
        backing_off.set_connection_attempt_time(now);
        assert!(!is_peer_candidate(&torrent, &swarm, &mut backing_off, &blocklist, now));
    }

    #[test]
    fn test_both_seeds_not_a_candidate() {
        let torrent = test_torrent(true);
        let swarm = Swarm::new(&torrent);
        let blocklist = Blocklist::new();

        let mut seed = test_info(PeerSource::Tracker);
        seed.set_seed();
        assert!(!is_peer_candidate(&torrent, &swarm, &mut seed, &blocklist, 1_000_000));

        let mut leecher = test_info(PeerSource::Tracker);
        assert!(is_peer_candidate(&torrent, &swarm, &mut leecher, &blocklist, 1_000_000));
    }

    #[test]
    fn test_candidate_cache_pops_from_tail() {
        let mut cache = OutboundCandidates::default();
        assert!(cache.is_empty());

        cache.refill(vec![
            (TorrentId(1), "10.0.0.2:1".parse().unwrap()),
            (TorrentId(1), "10.0.0.1:1".parse().unwrap()),
        ]);
        assert_eq!(cache.pop().unwrap().1, "10.0.0.1:1".parse().unwrap());
        assert_eq!(cache.pop().unwrap().1, "10.0.0.2:1".parse().unwrap());
        assert!(cache.pop().is_none());
    }

    #[test]
    fn test_constants_line_up() {
        assert_eq!(MAX_CONNECTIONS_PER_PULSE, 9);
        assert_eq!(OUTBOUND_CANDIDATE_LIST_CAPACITY, 36);
    }
}
