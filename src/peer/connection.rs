//! Live transfers: wire peers and webseeds
//!
//! A [`PeerConnection`] is the manager-side bookkeeping for one open wire
//! connection; the message framing itself lives behind the [`PeerChannel`]
//! seam. A [`Webseed`] is the far smaller bookkeeping for one HTTP piece
//! fetcher. Both expose the [`Transfer`] surface the swarm schedules by.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::net::{PeerIo, RecentHistory, SpeedTracker};
use crate::peer::info::PeerInfoHandle;
use crate::peer::TransferId;
use crate::torrent::{Bitfield, BlockIndex, Direction, PieceIndex, TorrentError};

/// Wire-protocol driver seam for one peer connection.
///
/// The driver owns the socket and the BitTorrent message framing. The
/// manager calls down through this trait; state owned by the remote side
/// (their interest, their choke of us) is queried rather than mirrored.
pub trait PeerChannel: Send {
    /// Drives protocol progress for one bandwidth pulse.
    fn pulse(&mut self);

    /// Sends Choke or Unchoke. Called only on state changes.
    fn send_choke(&mut self, choked: bool);

    /// Sends Interested or NotInterested. Called only on state changes.
    fn send_interested(&mut self, interested: bool);

    /// Sends Cancel for an in-flight request.
    fn send_cancel(&mut self, block: BlockIndex);

    /// Whether the remote peer is interested in our pieces.
    fn peer_is_interested(&self) -> bool;

    /// Whether the remote peer is choking us.
    fn client_is_choked(&self) -> bool;

    /// Whether the connection negotiated encryption.
    fn is_encrypted(&self) -> bool;
}

/// Remote piece ownership as learned from the wire.
#[derive(Debug, Clone)]
enum RemotePieces {
    /// Nothing announced yet.
    Unknown,
    /// HaveAll (or a full bitfield).
    All,
    /// Partial ownership.
    Some(Bitfield),
}

/// Common surface of everything a swarm transfers with.
pub trait Transfer {
    /// Swarm-unique transfer identity.
    fn transfer_id(&self) -> TransferId;

    /// Whether the transfer can provide the piece.
    fn has_piece(&self, piece: PieceIndex) -> bool;

    /// Whether piece data moved recently in the given direction.
    fn is_transferring(&mut self, now_msec: u64, direction: Direction) -> bool;

    /// Endpoint or URL for log lines.
    fn display_name(&self) -> String;
}

/// Manager-side state for one live wire peer.
pub struct PeerConnection {
    transfer_id: TransferId,
    info: PeerInfoHandle,
    socket_address: SocketAddr,
    io: PeerIo,
    channel: Box<dyn PeerChannel>,
    client: String,
    piece_count: u32,
    have: RemotePieces,
    blame: Bitfield,
    strikes: u8,
    do_purge: bool,
    client_is_interested: bool,
    peer_is_choked: bool,
    speed: [SpeedTracker; 2],
    blocks_sent_to_peer: RecentHistory,
    blocks_sent_to_client: RecentHistory,
    cancels_sent_to_peer: RecentHistory,
    cancels_sent_to_client: RecentHistory,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("transfer_id", &self.transfer_id)
            .field("socket_address", &self.socket_address)
            .field("client", &self.client)
            .field("strikes", &self.strikes)
            .field("do_purge", &self.do_purge)
            .finish_non_exhaustive()
    }
}

impl PeerConnection {
    /// Wraps a freshly handshaken connection.
    pub fn new(
        transfer_id: TransferId,
        info: PeerInfoHandle,
        io: PeerIo,
        channel: Box<dyn PeerChannel>,
        client: String,
        piece_count: u32,
    ) -> Self {
        let socket_address = io.address();
        Self {
            transfer_id,
            info,
            socket_address,
            io,
            channel,
            client,
            piece_count,
            have: RemotePieces::Unknown,
            blame: Bitfield::new(piece_count),
            strikes: 0,
            do_purge: false,
            client_is_interested: false,
            peer_is_choked: true,
            speed: [SpeedTracker::new(), SpeedTracker::new()],
            blocks_sent_to_peer: RecentHistory::new(),
            blocks_sent_to_client: RecentHistory::new(),
            cancels_sent_to_peer: RecentHistory::new(),
            cancels_sent_to_client: RecentHistory::new(),
        }
    }

    /// Shared handle to the peer's long-lived record.
    pub fn info(&self) -> &PeerInfoHandle {
        &self.info
    }

    /// Endpoint of the underlying socket.
    pub fn socket_address(&self) -> SocketAddr {
        self.socket_address
    }

    /// Whether the remote side opened the connection.
    pub fn is_incoming(&self) -> bool {
        self.io.is_incoming()
    }

    /// Whether the connection rides uTP.
    pub fn is_utp(&self) -> bool {
        self.io.is_utp()
    }

    /// Whether the connection negotiated encryption.
    pub fn is_encrypted(&self) -> bool {
        self.channel.is_encrypted()
    }

    /// Client agent derived from the handshake peer id.
    pub fn client(&self) -> &str {
        &self.client
    }

    /// Drives wire-protocol progress for one pulse.
    pub fn pulse(&mut self) {
        self.channel.pulse();
    }

    /// Chokes or unchokes the peer, sending only on change.
    pub fn set_choke(&mut self, choked: bool) {
        if self.peer_is_choked != choked {
            self.peer_is_choked = choked;
            self.channel.send_choke(choked);
        }
    }

    /// Declares or retracts our interest, sending only on change.
    pub fn set_interested(&mut self, interested: bool) {
        if self.client_is_interested != interested {
            self.client_is_interested = interested;
            self.channel.send_interested(interested);
        }
    }

    /// Cancels an in-flight request and counts the cancel.
    pub fn cancel_block_request(&mut self, block: BlockIndex, now_secs: u64) {
        self.cancels_sent_to_peer.add(now_secs, 1);
        self.channel.send_cancel(block);
    }

    /// Whether we choke the peer.
    pub fn peer_is_choked(&self) -> bool {
        self.peer_is_choked
    }

    /// Whether we are interested in the peer.
    pub fn client_is_interested(&self) -> bool {
        self.client_is_interested
    }

    /// Whether the peer is interested in us.
    pub fn peer_is_interested(&self) -> bool {
        self.channel.peer_is_interested()
    }

    /// Whether the peer chokes us.
    pub fn client_is_choked(&self) -> bool {
        self.channel.client_is_choked()
    }

    /// Records a Have announcement.
    pub fn on_got_have(&mut self, piece: PieceIndex) {
        match &mut self.have {
            RemotePieces::Unknown => {
                let mut bits = Bitfield::new(self.piece_count);
                bits.set_piece(piece);
                self.have = RemotePieces::Some(bits);
            }
            RemotePieces::All => {}
            RemotePieces::Some(bits) => bits.set_piece(piece),
        }
        self.normalize_have();
    }

    /// Records a HaveAll announcement.
    pub fn on_got_have_all(&mut self) {
        self.have = RemotePieces::All;
    }

    /// Records a HaveNone announcement.
    pub fn on_got_have_none(&mut self) {
        self.have = RemotePieces::Some(Bitfield::new(self.piece_count));
    }

    /// Records a full bitfield announcement.
    ///
    /// # Errors
    /// - `TorrentError::InvalidBitfieldSize` - Bitfield length disagrees with the piece count
    pub fn on_got_bitfield(&mut self, bits: Bytes) -> Result<(), TorrentError> {
        let bits = Bitfield::from_bytes(bits, self.piece_count)?;
        self.have = RemotePieces::Some(bits);
        self.normalize_have();
        Ok(())
    }

    fn normalize_have(&mut self) {
        if let RemotePieces::Some(bits) = &self.have {
            if self.piece_count > 0 && bits.has_all() {
                self.have = RemotePieces::All;
            }
        }
    }

    /// Whether the peer claims every piece.
    pub fn is_seed(&self) -> bool {
        match &self.have {
            RemotePieces::Unknown => false,
            RemotePieces::All => true,
            RemotePieces::Some(bits) => self.piece_count > 0 && bits.has_all(),
        }
    }

    /// Number of pieces the peer claims.
    pub fn count_have(&self) -> u32 {
        match &self.have {
            RemotePieces::Unknown => 0,
            RemotePieces::All => self.piece_count,
            RemotePieces::Some(bits) => bits.count_set(),
        }
    }

    /// Fraction of the torrent the peer claims, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.piece_count == 0 {
            return 0.0;
        }
        f64::from(self.count_have()) / f64::from(self.piece_count)
    }

    /// Resizes piece-indexed state after metainfo arrives.
    pub fn on_torrent_got_metainfo(&mut self, piece_count: u32) {
        self.piece_count = piece_count;
        self.blame = Bitfield::new(piece_count);
        if let RemotePieces::Some(bits) = &self.have {
            if bits.piece_count() != piece_count {
                self.have = RemotePieces::Unknown;
            }
        }
    }

    /// Marks that this peer contributed a block to `piece`.
    pub fn blame_piece(&mut self, piece: PieceIndex) {
        self.blame.set_piece(piece);
    }

    /// Whether this peer contributed to `piece`.
    pub fn is_blamed_for(&self, piece: PieceIndex) -> bool {
        self.blame.has_piece(piece)
    }

    /// Strike count for corrupt-piece contributions.
    pub fn strikes(&self) -> u8 {
        self.strikes
    }

    /// Adds a strike, returning the new count.
    pub fn add_strike(&mut self) -> u8 {
        self.strikes = self.strikes.saturating_add(1);
        self.strikes
    }

    /// Whether the peer is marked for disconnection.
    pub fn do_purge(&self) -> bool {
        self.do_purge
    }

    /// Marks the peer for disconnection at the next reconnect pulse.
    pub fn set_do_purge(&mut self) {
        self.do_purge = true;
    }

    /// Records piece payload movement.
    pub fn record_piece_data(&mut self, direction: Direction, now_msec: u64, bytes: u64) {
        self.speed[direction.index()].add(now_msec, bytes);
    }

    /// Piece payload rate in bytes per second.
    pub fn piece_data_rate(&mut self, direction: Direction, now_msec: u64) -> u64 {
        self.speed[direction.index()].rate_bytes_per_second(now_msec)
    }

    /// Whether the connection is actively moving payload in a direction.
    ///
    /// Upload activity requires an open slot and an interested peer;
    /// download activity requires our interest and an open slot from them.
    pub fn is_active(&self, direction: Direction) -> bool {
        match direction {
            Direction::Up => !self.peer_is_choked && self.peer_is_interested(),
            Direction::Down => self.client_is_interested && !self.client_is_choked(),
        }
    }

    /// Counts a block we served.
    pub fn record_block_sent_to_peer(&mut self, now_secs: u64) {
        self.blocks_sent_to_peer.add(now_secs, 1);
    }

    /// Counts a block the peer served us.
    pub fn record_block_sent_to_client(&mut self, now_secs: u64) {
        self.blocks_sent_to_client.add(now_secs, 1);
    }

    /// Counts a Cancel the peer sent us.
    pub fn record_cancel_sent_to_client(&mut self, now_secs: u64) {
        self.cancels_sent_to_client.add(now_secs, 1);
    }

    /// Windowed count of blocks we served.
    pub fn blocks_to_peer(&mut self, now_secs: u64, window_secs: u64) -> u32 {
        self.blocks_sent_to_peer.count(now_secs, window_secs)
    }

    /// Windowed count of blocks served to us.
    pub fn blocks_to_client(&mut self, now_secs: u64, window_secs: u64) -> u32 {
        self.blocks_sent_to_client.count(now_secs, window_secs)
    }

    /// Windowed count of Cancels we sent.
    pub fn cancels_to_peer(&mut self, now_secs: u64, window_secs: u64) -> u32 {
        self.cancels_sent_to_peer.count(now_secs, window_secs)
    }

    /// Windowed count of Cancels sent to us.
    pub fn cancels_to_client(&mut self, now_secs: u64, window_secs: u64) -> u32 {
        self.cancels_sent_to_client.count(now_secs, window_secs)
    }
}

impl Transfer for PeerConnection {
    fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    fn has_piece(&self, piece: PieceIndex) -> bool {
        match &self.have {
            RemotePieces::Unknown => false,
            RemotePieces::All => piece.as_u32() < self.piece_count,
            RemotePieces::Some(bits) => bits.has_piece(piece),
        }
    }

    fn is_transferring(&mut self, now_msec: u64, direction: Direction) -> bool {
        self.speed[direction.index()].is_transferring(now_msec)
    }

    fn display_name(&self) -> String {
        self.socket_address.to_string()
    }
}

/// Manager-side state for one HTTP webseed fetcher.
///
/// The fetcher itself is an external collaborator; the swarm only needs its
/// identity, its request slots in the ledger, and its download activity.
/// Webseeds have every piece by definition and never receive Cancels.
#[derive(Debug)]
pub struct Webseed {
    transfer_id: TransferId,
    url: String,
    download: SpeedTracker,
}

impl Webseed {
    /// Creates the bookkeeping for one webseed URL.
    pub fn new(transfer_id: TransferId, url: String) -> Self {
        Self {
            transfer_id,
            url,
            download: SpeedTracker::new(),
        }
    }

    /// The webseed URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Records downloaded payload bytes.
    pub fn record_piece_data(&mut self, now_msec: u64, bytes: u64) {
        self.download.add(now_msec, bytes);
    }
}

impl Transfer for Webseed {
    fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    fn has_piece(&self, _piece: PieceIndex) -> bool {
        true
    }

    fn is_transferring(&mut self, now_msec: u64, direction: Direction) -> bool {
        direction == Direction::Down && self.download.is_transferring(now_msec)
    }

    fn display_name(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
pub(crate) mod test_channel {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::PeerChannel;
    use crate::torrent::BlockIndex;

    /// Recording channel fake shared by unit and integration tests.
    #[derive(Debug, Default)]
    pub struct ChannelLog {
        pub chokes: Vec<bool>,
        pub interests: Vec<bool>,
        pub cancels: Vec<BlockIndex>,
        pub pulses: usize,
    }

    #[derive(Debug, Default)]
    pub struct FakeChannel {
        pub log: Arc<Mutex<ChannelLog>>,
        pub peer_is_interested: bool,
        pub client_is_choked: bool,
        pub encrypted: bool,
    }

    impl FakeChannel {
        pub fn new() -> (Self, Arc<Mutex<ChannelLog>>) {
            let channel = Self::default();
            let log = channel.log.clone();
            (channel, log)
        }
    }

    impl PeerChannel for FakeChannel {
        fn pulse(&mut self) {
            self.log.lock().pulses += 1;
        }

        fn send_choke(&mut self, choked: bool) {
            self.log.lock().chokes.push(choked);
        }

        fn send_interested(&mut self, interested: bool) {
            self.log.lock().interests.push(interested);
        }

        fn send_cancel(&mut self, block: BlockIndex) {
            self.log.lock().cancels.push(block);
        }

        fn peer_is_interested(&self) -> bool {
            self.peer_is_interested
        }

        fn client_is_choked(&self) -> bool {
            self.client_is_choked
        }

        fn is_encrypted(&self) -> bool {
            self.encrypted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_channel::FakeChannel;
    use super::*;
    use crate::peer::info::PeerInfo;
    use crate::peer::{PeerSource, PexFlags};

    fn test_peer() -> (PeerConnection, std::sync::Arc<parking_lot::Mutex<test_channel::ChannelLog>>)
    {
        let (channel, log) = FakeChannel::new();
        let info = PeerInfo::new_handle(
            "1.2.3.4".parse().unwrap(),
            Some(6881),
            PexFlags::default(),
            PeerSource::Tracker,
        );
        let io = PeerIo::new_outgoing("1.2.3.4:6881".parse().unwrap(), false);
        let peer = PeerConnection::new(
            TransferId(1),
            info,
            io,
            Box::new(channel),
            "Transmission 4.0.5".to_string(),
            8,
        );
        (peer, log)
    }

    #[test]
    fn test_choke_sends_only_on_change() {
        let (mut peer, log) = test_peer();
        assert!(peer.peer_is_choked());

        peer.set_choke(true); // already choked, no wire traffic
        peer.set_choke(false);
        peer.set_choke(false);
        peer.set_choke(true);

        assert_eq!(log.lock().chokes, vec![false, true]);
    }

    #[test]
    fn test_interest_sends_only_on_change() {
        let (mut peer, log) = test_peer();
        peer.set_interested(true);
        peer.set_interested(true);
        peer.set_interested(false);
        assert_eq!(log.lock().interests, vec![true, false]);
    }

    #[test]
    fn test_have_tracking() {
        let (mut peer, _) = test_peer();
        assert!(!peer.has_piece(PieceIndex(3)));
        assert!(!peer.is_seed());

        peer.on_got_have(PieceIndex(3));
        assert!(peer.has_piece(PieceIndex(3)));
        assert_eq!(peer.count_have(), 1);

        peer.on_got_have_all();
        assert!(peer.is_seed());
        assert!(peer.has_piece(PieceIndex(7)));
        assert!(!peer.has_piece(PieceIndex(8)));

        peer.on_got_have_none();
        assert!(!peer.is_seed());
        assert_eq!(peer.count_have(), 0);
    }

    #[test]
    fn test_full_bitfield_promotes_to_seed() {
        let (mut peer, _) = test_peer();
        peer.on_got_bitfield(Bytes::from(vec![0xffu8])).unwrap();
        assert!(peer.is_seed());
    }

    #[test]
    fn test_bad_bitfield_rejected() {
        let (mut peer, _) = test_peer();
        assert!(peer.on_got_bitfield(Bytes::from(vec![0xff, 0xff])).is_err());
    }

    #[test]
    fn test_cancel_counts() {
        let (mut peer, log) = test_peer();
        peer.cancel_block_request(BlockIndex(9), 100);
        assert_eq!(log.lock().cancels, vec![BlockIndex(9)]);
        assert_eq!(peer.cancels_to_peer(100, 60), 1);
        assert_eq!(peer.cancels_to_peer(1_000, 60), 0);
    }

    #[test]
    fn test_blame_and_strikes() {
        let (mut peer, _) = test_peer();
        peer.blame_piece(PieceIndex(2));
        assert!(peer.is_blamed_for(PieceIndex(2)));
        assert!(!peer.is_blamed_for(PieceIndex(3)));

        assert_eq!(peer.add_strike(), 1);
        assert_eq!(peer.add_strike(), 2);
        assert_eq!(peer.strikes(), 2);
    }

    #[test]
    fn test_webseed_has_everything() {
        let mut webseed = Webseed::new(TransferId(9), "http://example.com/seed".to_string());
        assert!(webseed.has_piece(PieceIndex(1_000)));
        assert!(!webseed.is_transferring(0, Direction::Down));

        webseed.record_piece_data(10, 16 * 1024);
        assert!(webseed.is_transferring(10, Direction::Down));
        assert!(!webseed.is_transferring(10, Direction::Up));
    }

    #[test]
    fn test_metainfo_resizes_state() {
        let (mut peer, _) = test_peer();
        peer.on_got_have(PieceIndex(1));
        peer.on_torrent_got_metainfo(16);
        // stale partial knowledge is dropped rather than misread
        assert!(!peer.has_piece(PieceIndex(1)));
        assert!(!peer.is_blamed_for(PieceIndex(1)));
    }
}
