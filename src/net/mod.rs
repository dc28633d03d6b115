//! Network-side collaborators: transport seam, blocklist, bandwidth accounting

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};

use crate::torrent::{Direction, InfoHash};

/// Window over which transfer rates are measured, in milliseconds.
const SPEED_WINDOW_MSEC: u64 = 5_000;

/// IP address family selector for peer listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4 addresses only.
    V4,
    /// IPv6 addresses only.
    V6,
}

impl AddressFamily {
    /// Whether `address` belongs to this family.
    pub fn matches(self, address: IpAddr) -> bool {
        match self {
            AddressFamily::V4 => address.is_ipv4(),
            AddressFamily::V6 => address.is_ipv6(),
        }
    }
}

/// Peer-connection encryption policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionMode {
    /// Try encrypted first, fall back to plaintext.
    #[default]
    Preferred,
    /// Refuse plaintext connections.
    Required,
    /// Accept whatever the peer offers.
    Tolerated,
}

/// Errors raised by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The process-wide open socket budget is exhausted.
    #[error("Open socket limit reached")]
    SocketLimitReached,

    /// Neither TCP nor uTP is available for this dial.
    #[error("No usable transport for {address}")]
    NoUsableTransport {
        /// The address we tried to dial.
        address: SocketAddr,
    },

    /// Socket creation failed.
    #[error("Failed to open socket to {address}: {reason}")]
    SocketCreation {
        /// The address we tried to dial.
        address: SocketAddr,
        /// Operating-system failure description.
        reason: String,
    },
}

/// Handle to one open peer transport.
///
/// The manager never performs I/O through this handle; it only records which
/// kind of socket the connection rides on. The wire-protocol driver owns the
/// actual stream.
#[derive(Debug, Clone)]
pub struct PeerIo {
    address: SocketAddr,
    is_utp: bool,
    is_incoming: bool,
}

impl PeerIo {
    /// Creates a handle for an outgoing connection.
    pub fn new_outgoing(address: SocketAddr, is_utp: bool) -> Self {
        Self {
            address,
            is_utp,
            is_incoming: false,
        }
    }

    /// Creates a handle for an accepted incoming connection.
    pub fn new_incoming(address: SocketAddr, is_utp: bool) -> Self {
        Self {
            address,
            is_utp,
            is_incoming: true,
        }
    }

    /// Remote endpoint of the socket.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Whether the socket is uTP rather than TCP.
    pub fn is_utp(&self) -> bool {
        self.is_utp
    }

    /// Whether the connection was initiated by the remote side.
    pub fn is_incoming(&self) -> bool {
        self.is_incoming
    }
}

/// Parameters for one outgoing dial.
#[derive(Debug, Clone)]
pub struct DialRequest {
    /// Listening endpoint of the remote peer.
    pub address: SocketAddr,
    /// Torrent the connection is for.
    pub info_hash: InfoHash,
    /// Whether we already have every piece (affects handshake hints).
    pub client_is_seed: bool,
    /// Whether to dial over uTP instead of TCP.
    pub use_utp: bool,
    /// Encryption policy for the handshake.
    pub encryption: EncryptionMode,
}

/// Socket factory seam.
///
/// Production implementations create TCP or uTP sockets; tests substitute a
/// recording fake. Dialing is fire-and-forget from the manager's point of
/// view: completion arrives later through the handshake path.
pub trait Transport: Send {
    /// Opens an outgoing socket toward a peer.
    ///
    /// # Errors
    /// - `TransportError::SocketLimitReached` - Process-wide socket budget exhausted
    /// - `TransportError::SocketCreation` - Underlying socket call failed
    fn dial(&mut self, request: DialRequest) -> Result<PeerIo, TransportError>;

    /// Number of sockets currently open.
    fn open_socket_count(&self) -> usize;

    /// Process-wide open socket budget.
    fn socket_limit(&self) -> usize;
}

/// Inclusive IP address range for the blocklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    begin: IpAddr,
    end: IpAddr,
}

impl AddressRange {
    /// Creates a range covering `[begin, end]`. A single address is
    /// expressed as `new(addr, addr)`.
    pub fn new(begin: IpAddr, end: IpAddr) -> Self {
        Self { begin, end }
    }

    fn contains(&self, address: IpAddr) -> bool {
        match (self.begin, self.end, address) {
            (IpAddr::V4(lo), IpAddr::V4(hi), IpAddr::V4(addr)) => {
                (u32::from(lo)..=u32::from(hi)).contains(&u32::from(addr))
            }
            (IpAddr::V6(lo), IpAddr::V6(hi), IpAddr::V6(addr)) => {
                (u128::from(lo)..=u128::from(hi)).contains(&u128::from(addr))
            }
            _ => false,
        }
    }
}

/// Session address blocklist.
///
/// Lookups are cheap but peers memoize their verdict anyway; the `revision`
/// counter lets holders detect that their cached verdict went stale.
#[derive(Debug, Default)]
pub struct Blocklist {
    ranges: Vec<AddressRange>,
    revision: u64,
}

impl Blocklist {
    /// Creates an empty blocklist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a range and bumps the revision.
    pub fn add_range(&mut self, range: AddressRange) {
        self.ranges.push(range);
        self.revision += 1;
    }

    /// Drops every rule and bumps the revision.
    pub fn clear(&mut self) {
        self.ranges.clear();
        self.revision += 1;
    }

    /// Whether the address is blocked.
    pub fn contains(&self, address: IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(address))
    }

    /// Monotonic revision counter, bumped on every rule change.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

/// Rolling-window byte rate tracker.
///
/// Byte counts land in coarse buckets; the rate is the windowed sum divided
/// by the window length. Stale buckets are pruned on both read and write.
#[derive(Debug, Default, Clone)]
pub struct SpeedTracker {
    buckets: VecDeque<(u64, u64)>,
}

impl SpeedTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `bytes` transferred at `now_msec`.
    pub fn add(&mut self, now_msec: u64, bytes: u64) {
        self.prune(now_msec);
        match self.buckets.back_mut() {
            Some((stamp, count)) if *stamp == now_msec => *count += bytes,
            _ => self.buckets.push_back((now_msec, bytes)),
        }
    }

    /// Current rate in bytes per second.
    pub fn rate_bytes_per_second(&mut self, now_msec: u64) -> u64 {
        self.prune(now_msec);
        let total: u64 = self.buckets.iter().map(|(_, bytes)| bytes).sum();
        total * 1_000 / SPEED_WINDOW_MSEC
    }

    /// Whether any bytes moved inside the window.
    pub fn is_transferring(&mut self, now_msec: u64) -> bool {
        self.prune(now_msec);
        !self.buckets.is_empty()
    }

    fn prune(&mut self, now_msec: u64) {
        let horizon = now_msec.saturating_sub(SPEED_WINDOW_MSEC);
        while let Some((stamp, _)) = self.buckets.front() {
            if *stamp < horizon {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Windowed event counter for per-peer statistics.
///
/// Tracks how many events (blocks, cancels) happened within the last
/// `window_secs` seconds.
#[derive(Debug, Default, Clone)]
pub struct RecentHistory {
    entries: VecDeque<(u64, u32)>,
}

impl RecentHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `count` events at `now_secs`.
    pub fn add(&mut self, now_secs: u64, count: u32) {
        match self.entries.back_mut() {
            Some((stamp, total)) if *stamp == now_secs => *total += count,
            _ => self.entries.push_back((now_secs, count)),
        }
    }

    /// Number of events within the trailing `window_secs` window.
    pub fn count(&mut self, now_secs: u64, window_secs: u64) -> u32 {
        let horizon = now_secs.saturating_sub(window_secs);
        while let Some((stamp, _)) = self.entries.front() {
            if *stamp < horizon {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        self.entries.iter().map(|(_, count)| count).sum()
    }
}

/// Per-direction bandwidth accounting and limits.
///
/// One instance sits at session scope, one per torrent. Each pulse the
/// session instance gets an `allocate` call covering the pulse window; the
/// manager only reads `is_maxed_out` to avoid opening upload slots that
/// cannot be serviced.
#[derive(Debug, Default)]
pub struct Bandwidth {
    limits: [Option<u64>; 2],
    used: [SpeedTracker; 2],
}

impl Bandwidth {
    /// Creates an unlimited bandwidth ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the byte-per-second limit for a direction; `None` is unlimited.
    pub fn set_limit(&mut self, direction: Direction, limit: Option<u64>) {
        self.limits[direction.index()] = limit;
    }

    /// Configured limit for a direction.
    pub fn limit(&self, direction: Direction) -> Option<u64> {
        self.limits[direction.index()]
    }

    /// Records piece-data bytes moved in a direction.
    pub fn notify_bytes(&mut self, direction: Direction, now_msec: u64, bytes: u64) {
        self.used[direction.index()].add(now_msec, bytes);
    }

    /// Observed rate for a direction in bytes per second.
    pub fn rate_bytes_per_second(&mut self, direction: Direction, now_msec: u64) -> u64 {
        self.used[direction.index()].rate_bytes_per_second(now_msec)
    }

    /// Whether the observed rate has reached the configured limit.
    pub fn is_maxed_out(&mut self, direction: Direction, now_msec: u64) -> bool {
        match self.limits[direction.index()] {
            Some(limit) => self.used[direction.index()].rate_bytes_per_second(now_msec) >= limit,
            None => false,
        }
    }

    /// Distributes the pulse window to child ledgers.
    ///
    /// Allocation proper happens in the transport layer; the manager-side
    /// ledger only prunes its windows so rates stay honest across idle gaps.
    pub fn allocate(&mut self, now_msec: u64, _period_msec: u64) {
        for tracker in &mut self.used {
            tracker.is_transferring(now_msec);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_blocklist_range_membership() {
        let mut blocklist = Blocklist::new();
        blocklist.add_range(AddressRange::new(addr("10.0.0.0"), addr("10.0.0.255")));

        assert!(blocklist.contains(addr("10.0.0.5")));
        assert!(!blocklist.contains(addr("10.0.1.5")));
        assert!(!blocklist.contains(addr("::1")));
    }

    #[test]
    fn test_blocklist_revision_bumps() {
        let mut blocklist = Blocklist::new();
        assert_eq!(blocklist.revision(), 0);
        blocklist.add_range(AddressRange::new(addr("::1"), addr("::1")));
        assert_eq!(blocklist.revision(), 1);
        assert!(blocklist.contains(addr("::1")));
        blocklist.clear();
        assert_eq!(blocklist.revision(), 2);
        assert!(!blocklist.contains(addr("::1")));
    }

    #[test]
    fn test_speed_tracker_windowed_rate() {
        let mut tracker = SpeedTracker::new();
        tracker.add(1_000, 5_000);
        tracker.add(2_000, 5_000);

        assert_eq!(tracker.rate_bytes_per_second(2_000), 2_000);
        assert!(tracker.is_transferring(2_000));

        // everything ages out of the window
        assert_eq!(tracker.rate_bytes_per_second(60_000), 0);
        assert!(!tracker.is_transferring(60_000));
    }

    #[test]
    fn test_recent_history_window() {
        let mut history = RecentHistory::new();
        history.add(10, 2);
        history.add(40, 1);

        assert_eq!(history.count(40, 60), 3);
        assert_eq!(history.count(100, 60), 1);
        assert_eq!(history.count(200, 60), 0);
    }

    #[test]
    fn test_bandwidth_maxed_out() {
        let mut bandwidth = Bandwidth::new();
        assert!(!bandwidth.is_maxed_out(Direction::Up, 1_000));

        bandwidth.set_limit(Direction::Up, Some(1_000));
        bandwidth.notify_bytes(Direction::Up, 1_000, 50_000);
        assert!(bandwidth.is_maxed_out(Direction::Up, 1_000));
        assert!(!bandwidth.is_maxed_out(Direction::Down, 1_000));
    }
}
