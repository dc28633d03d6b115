//! Long-lived per-peer records
//!
//! A [`PeerInfo`] describes one remote peer and outlives any single
//! connection to it. The swarm's pools hand out shared handles so a live
//! connection and the pool agree on one record even while entries migrate
//! between pools.

use std::cmp::Ordering;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::net::Blocklist;
use crate::peer::{PeerSource, PexFlags};

/// Shared handle to a pool-owned [`PeerInfo`].
pub type PeerInfoHandle = Arc<RwLock<PeerInfo>>;

/// Floor for the reconnect backoff when a peer was recently useful.
const MINIMUM_RECONNECT_INTERVAL_SECS: u64 = 5;

/// Metadata about one remote peer, keyed by its listening address.
#[derive(Debug)]
pub struct PeerInfo {
    listen_address: IpAddr,
    listen_port: Option<u16>,
    pex_flags: PexFlags,
    from_first: PeerSource,
    from_best: PeerSource,
    is_seed: bool,
    is_banned: bool,
    is_connected: bool,
    is_connectable: Option<bool>,
    supports_utp: Option<bool>,
    blocklisted: Option<(u64, bool)>,
    connection_failure_count: u32,
    connection_attempt_time: u64,
    connection_changed_time: u64,
    latest_piece_data_time: u64,
}

impl PeerInfo {
    /// Creates a record for a peer discovered at `from`.
    ///
    /// `listen_port` is `None` for incoming peers until they advertise one.
    pub fn new(
        listen_address: IpAddr,
        listen_port: Option<u16>,
        flags: PexFlags,
        from: PeerSource,
    ) -> Self {
        let mut info = Self {
            listen_address,
            listen_port,
            pex_flags: PexFlags::default(),
            from_first: from,
            from_best: from,
            is_seed: false,
            is_banned: false,
            is_connected: false,
            is_connectable: None,
            supports_utp: None,
            blocklisted: None,
            connection_failure_count: 0,
            connection_attempt_time: 0,
            connection_changed_time: 0,
            latest_piece_data_time: 0,
        };
        info.set_pex_flags(flags);
        info
    }

    /// Convenience constructor for a pool handle.
    pub fn new_handle(
        listen_address: IpAddr,
        listen_port: Option<u16>,
        flags: PexFlags,
        from: PeerSource,
    ) -> PeerInfoHandle {
        Arc::new(RwLock::new(Self::new(listen_address, listen_port, flags, from)))
    }

    /// IP the peer listens on (for incoming peers, the connecting IP).
    pub fn listen_address(&self) -> IpAddr {
        self.listen_address
    }

    /// Advertised listening port, if known.
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }

    /// Records the peer's advertised listening port.
    pub fn set_listen_port(&mut self, port: u16) {
        self.listen_port = Some(port);
    }

    /// Listening endpoint; port 0 when the port is still unknown.
    pub fn listen_socket_address(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.listen_port.unwrap_or(0))
    }

    /// Human-readable endpoint for log lines.
    pub fn display_name(&self) -> String {
        match self.listen_port {
            Some(port) => format!("{}:{port}", self.listen_address),
            None => format!("{}:?", self.listen_address),
        }
    }

    /// Most recent PEX advertisement bits.
    pub fn pex_flags(&self) -> PexFlags {
        self.pex_flags
    }

    /// Folds in PEX advertisement bits and the facts they imply.
    pub fn set_pex_flags(&mut self, flags: PexFlags) {
        self.pex_flags.insert(flags);
        if flags.contains(PexFlags::SEED) {
            self.is_seed = true;
        }
        if flags.contains(PexFlags::UTP) {
            self.supports_utp = Some(true);
        }
    }

    /// Source that first told us about this peer.
    pub fn from_first(&self) -> PeerSource {
        self.from_first
    }

    /// Most trusted source that has mentioned this peer.
    pub fn from_best(&self) -> PeerSource {
        self.from_best
    }

    /// Records a rediscovery from `from`.
    pub fn found_at(&mut self, from: PeerSource) {
        if from.rank() < self.from_best.rank() {
            self.from_best = from;
        }
    }

    /// Whether the peer has every piece.
    pub fn is_seed(&self) -> bool {
        self.is_seed
    }

    /// Marks the peer as a seed.
    pub fn set_seed(&mut self) {
        self.is_seed = true;
    }

    /// Whether the peer is banned for serving corrupt data.
    pub fn is_banned(&self) -> bool {
        self.is_banned
    }

    /// Bans the peer.
    pub fn ban(&mut self) {
        self.is_banned = true;
    }

    /// Whether a live connection currently uses this record.
    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    /// Tracks connection state transitions.
    ///
    /// A successful connect clears the consecutive-failure counter.
    pub fn set_connected(&mut self, connected: bool, now_secs: u64) {
        self.is_connected = connected;
        self.connection_changed_time = now_secs;
        if connected {
            self.connection_failure_count = 0;
        }
    }

    /// Whether the peer is known reachable (`Some(true)`), known
    /// unreachable (`Some(false)`), or untested (`None`).
    pub fn is_connectable(&self) -> Option<bool> {
        self.is_connectable
    }

    /// Records a reachability verdict.
    pub fn set_connectable(&mut self, connectable: bool) {
        self.is_connectable = Some(connectable);
    }

    /// Whether the peer is known to speak uTP.
    pub fn supports_utp(&self) -> Option<bool> {
        self.supports_utp
    }

    /// Records a uTP support verdict.
    pub fn set_utp_supported(&mut self, supported: bool) {
        self.supports_utp = Some(supported);
    }

    /// Consecutive failed connection attempts.
    pub fn connection_failure_count(&self) -> u32 {
        self.connection_failure_count
    }

    /// Records a failed connection attempt.
    pub fn on_connection_failed(&mut self) {
        self.connection_failure_count = self.connection_failure_count.saturating_add(1);
    }

    /// Wall second of the most recent dial attempt.
    pub fn connection_attempt_time(&self) -> u64 {
        self.connection_attempt_time
    }

    /// Records a dial attempt.
    pub fn set_connection_attempt_time(&mut self, now_secs: u64) {
        self.connection_attempt_time = now_secs;
    }

    /// Wall second piece data last moved on this peer's connection.
    pub fn latest_piece_data_time(&self) -> u64 {
        self.latest_piece_data_time
    }

    /// Records piece-data activity.
    pub fn set_latest_piece_data_time(&mut self, now_secs: u64) {
        self.latest_piece_data_time = now_secs;
    }

    /// Seconds since the connection last did anything useful.
    ///
    /// `None` when not connected. Freshly connected peers measure from the
    /// connect time so they are not culled before they get a chance.
    pub fn idle_secs(&self, now_secs: u64) -> Option<u64> {
        if !self.is_connected {
            return None;
        }
        let busy = self.latest_piece_data_time.max(self.connection_changed_time);
        Some(now_secs.saturating_sub(busy))
    }

    /// Reconnect backoff for the current failure streak.
    ///
    /// A peer that moved piece data recently gets the floor interval so
    /// transient network trouble does not sideline a good peer. Known
    /// unreachable peers are penalized two steps.
    pub fn reconnect_interval_secs(&self, now_secs: u64) -> u64 {
        let unreachable = self.is_connectable == Some(false);

        if !unreachable
            && self.latest_piece_data_time > 0
            && now_secs.saturating_sub(self.latest_piece_data_time)
                <= MINIMUM_RECONNECT_INTERVAL_SECS * 2
        {
            return MINIMUM_RECONNECT_INTERVAL_SECS;
        }

        let step = self.connection_failure_count + if unreachable { 2 } else { 0 };
        match step {
            0 => 0,
            1 => 5,
            2 => 60 * 2,
            3 => 60 * 15,
            4 => 60 * 30,
            5 => 60 * 60,
            _ => 60 * 120,
        }
    }

    /// Whether enough time has passed since the last dial attempt.
    pub fn reconnect_interval_has_passed(&self, now_secs: u64) -> bool {
        now_secs.saturating_sub(self.connection_attempt_time)
            >= self.reconnect_interval_secs(now_secs)
    }

    /// Whether the listen address is blocklisted, memoized per revision.
    pub fn is_blocklisted(&mut self, blocklist: &Blocklist) -> bool {
        if let Some((revision, verdict)) = self.blocklisted {
            if revision == blocklist.revision() {
                return verdict;
            }
        }
        let verdict = blocklist.contains(self.listen_address);
        self.blocklisted = Some((blocklist.revision(), verdict));
        verdict
    }

    /// Drops the memoized blocklist verdict.
    pub fn invalidate_blocklist_cache(&mut self) {
        self.blocklisted = None;
    }

    /// Absorbs the history of a displaced record for the same peer.
    ///
    /// Sticky facts (seed, banned) survive; counters keep whichever side
    /// saw more; discovery trust keeps the best source either side saw.
    pub fn merge(&mut self, other: &PeerInfo) {
        if other.is_seed {
            self.is_seed = true;
        }
        if other.is_banned {
            self.is_banned = true;
        }
        self.pex_flags.insert(other.pex_flags);
        self.found_at(other.from_best);

        self.connection_failure_count = self.connection_failure_count.max(other.connection_failure_count);
        self.connection_attempt_time = self.connection_attempt_time.max(other.connection_attempt_time);
        self.connection_changed_time = self.connection_changed_time.max(other.connection_changed_time);
        self.latest_piece_data_time = self.latest_piece_data_time.max(other.latest_piece_data_time);

        self.is_connectable = match (self.is_connectable, other.is_connectable) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        };
        if self.supports_utp.is_none() {
            self.supports_utp = other.supports_utp;
        } else if other.supports_utp == Some(true) {
            self.supports_utp = Some(true);
        }
    }
}

/// Orders two records by usefulness; `Less` means `a` is the better peer.
///
/// Recent piece data beats trust rank beats failure history.
pub fn compare_usefulness(a: &PeerInfo, b: &PeerInfo) -> Ordering {
    b.latest_piece_data_time
        .cmp(&a.latest_piece_data_time)
        .then_with(|| a.from_best.rank().cmp(&b.from_best.rank()))
        .then_with(|| a.connection_failure_count.cmp(&b.connection_failure_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::AddressRange;

    fn info(from: PeerSource) -> PeerInfo {
        PeerInfo::new("1.2.3.4".parse().unwrap(), Some(6881), PexFlags::default(), from)
    }

    #[test]
    fn test_pex_flags_imply_facts() {
        let mut seed_flags = PexFlags::default();
        seed_flags.insert(PexFlags::SEED);
        seed_flags.insert(PexFlags::UTP);

        let peer = PeerInfo::new("1.2.3.4".parse().unwrap(), Some(1), seed_flags, PeerSource::Pex);
        assert!(peer.is_seed());
        assert_eq!(peer.supports_utp(), Some(true));
    }

    #[test]
    fn test_found_at_keeps_best_source() {
        let mut peer = info(PeerSource::Pex);
        assert_eq!(peer.from_best(), PeerSource::Pex);

        peer.found_at(PeerSource::Tracker);
        assert_eq!(peer.from_best(), PeerSource::Tracker);
        assert_eq!(peer.from_first(), PeerSource::Pex);

        peer.found_at(PeerSource::Lpd);
        assert_eq!(peer.from_best(), PeerSource::Tracker);
    }

    #[test]
    fn test_successful_connect_clears_failures() {
        let mut peer = info(PeerSource::Tracker);
        peer.on_connection_failed();
        peer.on_connection_failed();
        assert_eq!(peer.connection_failure_count(), 2);

        peer.set_connected(true, 100);
        assert_eq!(peer.connection_failure_count(), 0);
        assert!(peer.is_connected());
    }

    #[test]
    fn test_reconnect_backoff_ladder() {
        let mut peer = info(PeerSource::Tracker);
        assert_eq!(peer.reconnect_interval_secs(1_000), 0);

        peer.on_connection_failed();
        assert_eq!(peer.reconnect_interval_secs(1_000), 5);

        peer.on_connection_failed();
        assert_eq!(peer.reconnect_interval_secs(1_000), 120);

        // unreachable peers skip two steps up the ladder
        peer.set_connectable(false);
        assert_eq!(peer.reconnect_interval_secs(1_000), 1_800);
    }

    #[test]
    fn test_recent_piece_data_shortens_backoff() {
        let mut peer = info(PeerSource::Tracker);
        peer.on_connection_failed();
        peer.on_connection_failed();
        peer.set_latest_piece_data_time(995);
        assert_eq!(peer.reconnect_interval_secs(1_000), 5);
    }

    #[test]
    fn test_reconnect_interval_gate() {
        let mut peer = info(PeerSource::Tracker);
        peer.on_connection_failed();
        peer.set_connection_attempt_time(1_000);

        assert!(!peer.reconnect_interval_has_passed(1_002));
        assert!(peer.reconnect_interval_has_passed(1_005));
    }

    #[test]
    fn test_blocklist_memoization_tracks_revision() {
        let mut blocklist = Blocklist::new();
        let mut peer = info(PeerSource::Tracker);

        assert!(!peer.is_blocklisted(&blocklist));

        blocklist.add_range(AddressRange::new(
            "1.2.3.0".parse().unwrap(),
            "1.2.3.255".parse().unwrap(),
        ));
        // revision changed, memo is refreshed automatically
        assert!(peer.is_blocklisted(&blocklist));

        peer.invalidate_blocklist_cache();
        assert!(peer.is_blocklisted(&blocklist));
    }

    #[test]
    fn test_merge_absorbs_history() {
        let mut winner = info(PeerSource::Pex);
        winner.set_latest_piece_data_time(500);

        let mut loser = info(PeerSource::Tracker);
        loser.set_seed();
        loser.ban();
        loser.on_connection_failed();
        loser.on_connection_failed();
        loser.set_latest_piece_data_time(300);
        loser.set_utp_supported(true);

        winner.merge(&loser);
        assert!(winner.is_seed());
        assert!(winner.is_banned());
        assert_eq!(winner.from_best(), PeerSource::Tracker);
        assert_eq!(winner.from_first(), PeerSource::Pex);
        assert_eq!(winner.connection_failure_count(), 2);
        assert_eq!(winner.latest_piece_data_time(), 500);
        assert_eq!(winner.supports_utp(), Some(true));
    }

    #[test]
    fn test_usefulness_ordering() {
        let mut active = info(PeerSource::Pex);
        active.set_latest_piece_data_time(900);

        let mut idle_trusted = info(PeerSource::Tracker);
        idle_trusted.set_latest_piece_data_time(100);

        // recent piece data wins over source trust
        assert_eq!(compare_usefulness(&active, &idle_trusted), Ordering::Less);

        // equal activity: source trust decides
        let tracker_peer = info(PeerSource::Tracker);
        let pex_peer = info(PeerSource::Pex);
        assert_eq!(compare_usefulness(&tracker_peer, &pex_peer), Ordering::Less);

        // equal activity and trust: failure count decides
        let clean = info(PeerSource::Tracker);
        let mut flaky = info(PeerSource::Tracker);
        flaky.on_connection_failed();
        assert_eq!(compare_usefulness(&clean, &flaky), Ordering::Less);
    }

    #[test]
    fn test_idle_secs_requires_connection() {
        let mut peer = info(PeerSource::Tracker);
        assert_eq!(peer.idle_secs(1_000), None);

        peer.set_connected(true, 900);
        assert_eq!(peer.idle_secs(1_000), Some(100));

        peer.set_latest_piece_data_time(980);
        assert_eq!(peer.idle_secs(1_000), Some(20));
    }
}
