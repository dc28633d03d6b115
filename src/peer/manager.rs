//! The peer manager
//!
//! One manager per session. It owns a swarm per torrent, the incoming
//! handshake table, and the cached outbound candidate list, and it drives
//! the three periodic pulses. Everything mutating lives behind one session
//! lock; the tokio pulse driver and every public entry point lock first,
//! so all work in here is plain synchronous code.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::clock::SessionClock;
use crate::config::UndertowConfig;
use crate::net::{AddressFamily, AddressRange, Bandwidth, Blocklist, DialRequest, PeerIo, Transport};
use crate::peer::candidates::{
    candidate_score, is_peer_candidate, OutboundCandidates, MAX_CONNECTIONS_PER_PULSE,
    OUTBOUND_CANDIDATE_LIST_CAPACITY, OUTBOUND_PEER_BUDGET_RATIO,
};
use crate::peer::choke;
use crate::peer::clients::client_for_id;
use crate::peer::connection::{PeerChannel, Transfer};
use crate::peer::events::PeerEvent;
use crate::peer::handshake::{Handshake, HandshakeOutcome};
use crate::peer::info::{compare_usefulness, PeerInfoHandle};
use crate::peer::pex::Pex;
use crate::peer::salt::SaltShaker;
use crate::peer::swarm::{Swarm, SwarmStats};
use crate::peer::{PeerSource, PexFlags, TransferId};
use crate::torrent::{
    BlockIndex, BlockSpan, Direction, InfoHash, PieceIndex, Torrent, TorrentBuilder, TorrentEvent,
    TorrentId,
};
use crate::wishlist::{FirstFitWishlist, Wishlist, WishlistMediator};

/// When many peers are available, idle connections are kept this long.
const MIN_UPLOAD_IDLE_SECS: u64 = 60;

/// When few peers are available, idle connections are kept this long.
const MAX_UPLOAD_IDLE_SECS: u64 = 60 * 5;

/// Window for the block/cancel counters reported in peer stats.
const CANCEL_HISTORY_SECS: u64 = 60;

/// Which peers a [`PeerManager::get_peers`] listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerListMode {
    /// Currently connected peers.
    Connected,
    /// Dialable pool entries worth sharing or persisting.
    Interesting,
}

/// Snapshot of one live peer for display.
#[derive(Debug, Clone)]
pub struct PeerStats {
    /// Socket endpoint as text.
    pub address: String,
    /// Client agent from the handshake peer id.
    pub client: String,
    /// How the peer was first discovered.
    pub from: PeerSource,
    /// Fraction of the torrent the peer claims, in `[0, 1]`.
    pub progress: f64,
    /// Upload rate to the peer in KiB/s.
    pub rate_to_peer_kibps: f64,
    /// Download rate from the peer in KiB/s.
    pub rate_to_client_kibps: f64,
    /// One-letter status flags in the classic order.
    pub flags: String,
    /// Whether the connection rides uTP.
    pub is_utp: bool,
    /// Whether the connection negotiated encryption.
    pub is_encrypted: bool,
    /// Whether the remote side opened the connection.
    pub is_incoming: bool,
    /// Whether we choke the peer.
    pub peer_is_choked: bool,
    /// Whether the peer is interested in us.
    pub peer_is_interested: bool,
    /// Whether the peer chokes us.
    pub client_is_choked: bool,
    /// Whether we are interested in the peer.
    pub client_is_interested: bool,
    /// Whether payload is flowing from the peer.
    pub is_downloading_from: bool,
    /// Whether payload is flowing to the peer.
    pub is_uploading_to: bool,
    /// Whether the peer claims every piece.
    pub is_seed: bool,
    /// Blocks we served within the stats window.
    pub blocks_to_peer: u32,
    /// Blocks served to us within the stats window.
    pub blocks_to_client: u32,
    /// Cancels we sent within the stats window.
    pub cancels_to_peer: u32,
    /// Cancels sent to us within the stats window.
    pub cancels_to_client: u32,
    /// Outstanding block requests to the peer.
    pub active_requests_to_peer: usize,
}

struct TorrentEntry {
    torrent: Torrent,
    swarm: Swarm,
}

/// Session-wide peer scheduling.
pub struct PeerManager {
    config: UndertowConfig,
    clock: SessionClock,
    transport: Box<dyn Transport>,
    wishlist: Box<dyn Wishlist>,
    blocklist: Blocklist,
    bandwidth: Bandwidth,
    torrents: BTreeMap<TorrentId, TorrentEntry>,
    incoming_handshakes: HashMap<SocketAddr, Handshake>,
    outbound_candidates: OutboundCandidates,
    rng: StdRng,
    rechoke_soon: bool,
    next_torrent_id: u32,
}

impl PeerManager {
    /// Creates a manager over the given transport.
    pub fn new(config: UndertowConfig, clock: SessionClock, transport: Box<dyn Transport>) -> Self {
        let rng = match config.simulation.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            clock,
            transport,
            wishlist: Box::new(FirstFitWishlist::new()),
            blocklist: Blocklist::new(),
            bandwidth: Bandwidth::new(),
            torrents: BTreeMap::new(),
            incoming_handshakes: HashMap::new(),
            outbound_candidates: OutboundCandidates::default(),
            rng,
            rechoke_soon: false,
            next_torrent_id: 0,
        }
    }

    /// Swaps in a piece-selection policy.
    pub fn set_wishlist(&mut self, wishlist: Box<dyn Wishlist>) {
        self.wishlist = wishlist;
    }

    /// Session configuration.
    pub fn config(&self) -> &UndertowConfig {
        &self.config
    }

    /// Session clock handle.
    pub fn clock(&self) -> SessionClock {
        self.clock.clone()
    }

    /// Session bandwidth ledger.
    pub fn bandwidth_mut(&mut self) -> &mut Bandwidth {
        &mut self.bandwidth
    }

    // --- torrents and lifecycle

    /// Adds a torrent and creates its swarm.
    pub fn add_torrent(&mut self, builder: TorrentBuilder) -> TorrentId {
        let id = TorrentId(self.next_torrent_id);
        self.next_torrent_id += 1;

        let mut torrent = builder.build(id);
        torrent.set_pex_enabled(self.config.network.allows_pex);
        let swarm = Swarm::new(&torrent);
        info!(torrent = %id, info_hash = %torrent.info_hash(), "torrent added");
        self.torrents.insert(id, TorrentEntry { torrent, swarm });
        id
    }

    /// The torrent model, for the embedding torrent layer.
    pub fn torrent(&self, id: TorrentId) -> Option<&Torrent> {
        self.torrents.get(&id).map(|entry| &entry.torrent)
    }

    /// Mutable torrent model access for the embedding torrent layer.
    pub fn torrent_mut(&mut self, id: TorrentId) -> Option<&mut Torrent> {
        self.torrents.get_mut(&id).map(|entry| &mut entry.torrent)
    }

    /// The swarm for a torrent.
    pub fn swarm(&self, id: TorrentId) -> Option<&Swarm> {
        self.torrents.get(&id).map(|entry| &entry.swarm)
    }

    /// Torrent ids in pulse-processing order.
    pub fn torrent_ids(&self) -> Vec<TorrentId> {
        self.torrents.keys().copied().collect()
    }

    /// Applies a torrent lifecycle event to its swarm.
    pub fn torrent_event(&mut self, id: TorrentId, event: TorrentEvent) {
        let now_secs = self.clock.now_secs();

        if event == TorrentEvent::Doomed {
            if let Some(mut entry) = self.torrents.remove(&id) {
                entry.swarm.stop(now_secs);
                info!(torrent = %id, "torrent doomed; swarm destroyed");
            }
            return;
        }

        let Some(entry) = self.torrents.get_mut(&id) else {
            return;
        };

        match event {
            TorrentEvent::Started => {
                entry.torrent.start(now_secs);
                entry
                    .swarm
                    .handle_torrent_event(&mut entry.torrent, event, now_secs);
                self.rechoke_soon = true;
            }
            TorrentEvent::Stopped => {
                entry.torrent.stop();
                entry
                    .swarm
                    .handle_torrent_event(&mut entry.torrent, event, now_secs);
            }
            _ => {
                entry
                    .swarm
                    .handle_torrent_event(&mut entry.torrent, event, now_secs);
            }
        }
    }

    // --- incoming connections and handshakes

    /// Accepts or refuses a fresh incoming connection.
    ///
    /// Blocklisted addresses and duplicate handshakes are dropped on the
    /// floor; everything else gets a handshake enrolled.
    pub fn add_incoming(&mut self, io: PeerIo) {
        let socket_address = io.address();

        if self.blocklist.contains(socket_address.ip()) {
            debug!(peer = %socket_address, "blocklisted address tried to connect");
            return;
        }
        if self.incoming_handshakes.contains_key(&socket_address) {
            return;
        }

        let handshake = Handshake::new(
            io,
            self.config.network.encryption_mode,
            self.clock.now_secs(),
        );
        self.incoming_handshakes.insert(socket_address, handshake);
    }

    /// Number of incoming handshakes in flight.
    pub fn incoming_handshake_count(&self) -> usize {
        self.incoming_handshakes.len()
    }

    /// Consumes a handshake completion.
    ///
    /// On success `channel` is the wire driver for the connection; it is
    /// dropped when the peer is refused. Returns whether the peer was
    /// admitted.
    pub fn handshake_done(
        &mut self,
        outcome: HandshakeOutcome,
        channel: Option<Box<dyn PeerChannel>>,
    ) -> bool {
        let now_secs = self.clock.now_secs();

        if outcome.is_incoming {
            self.incoming_handshakes.remove(&outcome.socket_address);
        }

        let Some(entry) = self
            .torrents
            .values_mut()
            .find(|entry| entry.torrent.info_hash() == outcome.info_hash)
        else {
            return false;
        };

        if !outcome.is_incoming {
            entry.swarm.outgoing_handshakes.remove(&outcome.socket_address);
        }

        if !outcome.ok || !entry.swarm.is_running {
            if let Some(info) = entry.swarm.existing_peer_info(outcome.socket_address) {
                let mut record = info.write();
                if !record.is_connected() {
                    record.on_connection_failed();
                    if !outcome.read_anything {
                        trace!(
                            peer = %record.display_name(),
                            failures = record.connection_failure_count(),
                            "marking peer unreachable"
                        );
                        record.set_connectable(false);
                    }
                }
            }
            return false;
        }

        let info = if outcome.is_incoming {
            entry.swarm.ensure_info_exists(
                outcome.socket_address,
                PexFlags::default(),
                PeerSource::Incoming,
                false,
            )
        } else {
            match entry.swarm.existing_peer_info(outcome.socket_address) {
                Some(info) => info,
                None => return false,
            }
        };

        {
            let mut record = info.write();
            if !outcome.is_incoming {
                record.set_connectable(true);
            }
            if outcome.is_utp {
                record.set_utp_supported(true);
            }
        }

        let (banned, connected) = {
            let record = info.read();
            (record.is_banned(), record.is_connected())
        };
        if banned {
            trace!(peer = %outcome.socket_address, "banned peer tried to reconnect");
            return false;
        }
        if entry.swarm.peer_count() >= entry.torrent.peer_limit() {
            return false;
        }
        if connected {
            return false;
        }
        let Some(channel) = channel else {
            return false;
        };

        let client = outcome
            .peer_id
            .as_ref()
            .map(client_for_id)
            .unwrap_or_default();
        let io = if outcome.is_incoming {
            PeerIo::new_incoming(outcome.socket_address, outcome.is_utp)
        } else {
            PeerIo::new_outgoing(outcome.socket_address, outcome.is_utp)
        };

        let piece_count = entry.torrent.piece_count();
        entry
            .swarm
            .add_peer(info, io, channel, client, piece_count, now_secs);
        true
    }

    /// Clears a peer's uTP verdict after a failed uTP dial, so the next
    /// attempt falls back to TCP.
    pub fn utp_failed(&mut self, info_hash: InfoHash, socket_address: SocketAddr) {
        if let Some(entry) = self
            .torrents
            .values_mut()
            .find(|entry| entry.torrent.info_hash() == info_hash)
        {
            if let Some(info) = entry.swarm.existing_peer_info(socket_address) {
                info.write().set_utp_supported(false);
            }
        }
    }

    // --- peer discovery

    /// Folds peer-exchange entries into a torrent's dialable pool.
    ///
    /// Returns how many entries were used. PEX-sourced entries must carry
    /// the connectable flag; incoming is never a valid discovery source
    /// here.
    pub fn add_pex(&mut self, id: TorrentId, from: PeerSource, pex: &[Pex]) -> usize {
        let Some(entry) = self.torrents.get_mut(&id) else {
            return 0;
        };

        let mut used = 0;
        for item in pex {
            if !item.is_valid_for_peers() {
                continue;
            }
            if from == PeerSource::Incoming {
                continue;
            }
            if from == PeerSource::Pex && !item.flags.contains(PexFlags::CONNECTABLE) {
                continue;
            }
            if self.blocklist.contains(item.addr) {
                continue;
            }
            entry
                .swarm
                .ensure_info_exists(item.socket_address(), item.flags, from, true);
            used += 1;
        }
        used
    }

    /// Lists peers for announce responses, PEX export, or persistence.
    ///
    /// The most useful `max` peers are chosen, then sorted by address for
    /// stable output.
    pub fn get_peers(
        &mut self,
        id: TorrentId,
        family: AddressFamily,
        mode: PeerListMode,
        max: usize,
    ) -> Vec<Pex> {
        let Some(entry) = self.torrents.get_mut(&id) else {
            return Vec::new();
        };
        let torrent = &entry.torrent;
        let swarm = &entry.swarm;

        let mut handles: Vec<PeerInfoHandle> = match mode {
            PeerListMode::Connected => swarm
                .peers
                .iter()
                .filter(|peer| family.matches(peer.socket_address().ip()))
                .map(|peer| peer.info().clone())
                .collect(),
            PeerListMode::Interesting => swarm
                .connectable_pool
                .iter()
                .filter(|(address, _)| family.matches(address.ip()))
                .filter(|(_, handle)| {
                    is_peer_interesting(torrent, swarm, handle, &self.blocklist)
                })
                .map(|(_, handle)| handle.clone())
                .collect(),
        };

        handles.sort_by(|a, b| compare_usefulness(&a.read(), &b.read()));
        handles.truncate(max);

        let mut pex: Vec<Pex> = handles
            .iter()
            .map(|handle| {
                let record = handle.read();
                Pex::new(
                    record.listen_address(),
                    record.listen_port().unwrap_or(0),
                    record.pex_flags(),
                )
            })
            .collect();
        pex.sort();
        pex
    }

    /// Rebuilds blocklist state and drops every memoized verdict.
    pub fn add_blocklist_range(&mut self, range: AddressRange) {
        self.blocklist.add_range(range);
        self.on_blocklist_changed();
    }

    /// Session blocklist, read-only.
    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    fn on_blocklist_changed(&mut self) {
        for entry in self.torrents.values_mut() {
            for pool in [&entry.swarm.connectable_pool, &entry.swarm.incoming_pool] {
                for handle in pool.values() {
                    handle.write().invalidate_blocklist_cache();
                }
            }
        }
    }

    // --- requests

    /// Asks the wishlist which blocks to request from a transfer.
    pub fn get_next_requests(
        &mut self,
        id: TorrentId,
        transfer: TransferId,
        numwant: usize,
    ) -> Vec<BlockSpan> {
        let Some(entry) = self.torrents.get_mut(&id) else {
            return Vec::new();
        };
        entry.swarm.update_endgame(&entry.torrent);

        let mediator = SwarmMediator {
            torrent: &entry.torrent,
            swarm: &entry.swarm,
            transfer,
        };
        self.wishlist.next(&mediator, numwant)
    }

    /// Records that requests for a block span went out to a transfer.
    pub fn client_sent_requests(&mut self, id: TorrentId, transfer: TransferId, span: BlockSpan) {
        let now_secs = self.clock.now_secs();
        if let Some(entry) = self.torrents.get_mut(&id) {
            for block in span.iter() {
                entry.swarm.active_requests.add(block, transfer, now_secs);
            }
        }
    }

    /// Whether a specific request is outstanding.
    pub fn did_peer_request(&self, id: TorrentId, transfer: TransferId, block: BlockIndex) -> bool {
        self.torrents
            .get(&id)
            .is_some_and(|entry| entry.swarm.active_requests.has(block, transfer))
    }

    /// Outstanding request count toward one transfer.
    pub fn count_active_requests_to_peer(&self, id: TorrentId, transfer: TransferId) -> usize {
        self.torrents
            .get(&id)
            .map_or(0, |entry| entry.swarm.active_requests.count_for_transfer(transfer))
    }

    // --- availability and stats

    /// Peers able to provide a piece; −1 when we already have it.
    pub fn piece_availability(&self, id: TorrentId, piece: PieceIndex) -> i32 {
        let Some(entry) = self.torrents.get(&id) else {
            return 0;
        };
        if !entry.torrent.has_metainfo() {
            return 0;
        }
        if entry.torrent.is_seed() || entry.torrent.has_piece(piece) {
            return -1;
        }
        entry
            .swarm
            .peers
            .iter()
            .filter(|peer| peer.has_piece(piece))
            .count() as i32
    }

    /// Piece availability sampled into `buckets` histogram slots.
    pub fn torrent_availability(&self, id: TorrentId, buckets: usize) -> Vec<i32> {
        let Some(entry) = self.torrents.get(&id) else {
            return vec![0; buckets];
        };
        if buckets == 0 || entry.torrent.piece_count() == 0 {
            return vec![0; buckets];
        }

        let interval = f64::from(entry.torrent.piece_count()) / buckets as f64;
        (0..buckets)
            .map(|bucket| {
                let piece = PieceIndex((bucket as f64 * interval) as u32);
                self.piece_availability(id, piece)
            })
            .collect()
    }

    /// Wanted bytes that at least one connected peer could provide.
    pub fn desired_available(&self, id: TorrentId) -> u64 {
        let Some(entry) = self.torrents.get(&id) else {
            return 0;
        };
        let torrent = &entry.torrent;
        if !torrent.is_running() || torrent.is_done() || !torrent.has_metainfo() {
            return 0;
        }
        if entry.swarm.peers.is_empty() {
            return 0;
        }
        if entry.swarm.peers.iter().any(|peer| peer.is_seed()) {
            return torrent.left_until_done();
        }

        (0..torrent.piece_count())
            .map(PieceIndex)
            .filter(|piece| torrent.piece_is_wanted(*piece) && !torrent.has_piece(*piece))
            .filter(|piece| entry.swarm.peers.iter().any(|peer| peer.has_piece(*piece)))
            .map(|piece| torrent.count_missing_bytes_in_piece(piece))
            .sum()
    }

    /// Swarm counters with the active-transfer tallies refreshed.
    pub fn swarm_stats(&mut self, id: TorrentId) -> SwarmStats {
        let now_msec = self.clock.now_msec();
        let Some(entry) = self.torrents.get_mut(&id) else {
            return SwarmStats::default();
        };

        let mut up = 0;
        let mut down = 0;
        for peer in &entry.swarm.peers {
            if peer.is_active(Direction::Up) {
                up += 1;
            }
            if peer.is_active(Direction::Down) {
                down += 1;
            }
        }
        entry.swarm.stats.active_peer_count[Direction::Up.index()] = up;
        entry.swarm.stats.active_peer_count[Direction::Down.index()] = down;
        entry.swarm.stats.active_webseed_count = {
            let torrent = &entry.torrent;
            let swarm = &mut entry.swarm;
            swarm.count_active_webseeds(torrent, now_msec)
        };
        entry.swarm.stats.clone()
    }

    /// Display snapshot of every live peer in a swarm.
    pub fn peer_stats(&mut self, id: TorrentId) -> Vec<PeerStats> {
        let now_secs = self.clock.now_secs();
        let now_msec = self.clock.now_msec();
        let Some(entry) = self.torrents.get_mut(&id) else {
            return Vec::new();
        };
        let optimistic = entry.swarm.optimistic;

        let mut stats = Vec::with_capacity(entry.swarm.peers.len());
        for index in 0..entry.swarm.peers.len() {
            let active_requests = entry
                .swarm
                .active_requests
                .count_for_transfer(entry.swarm.peers[index].transfer_id());
            let peer = &mut entry.swarm.peers[index];

            let rate_up = peer.piece_data_rate(Direction::Up, now_msec);
            let rate_down = peer.piece_data_rate(Direction::Down, now_msec);
            let is_downloading_from = peer.is_active(Direction::Down);
            let is_uploading_to = peer.is_active(Direction::Up);
            let peer_is_interested = peer.peer_is_interested();
            let client_is_choked = peer.client_is_choked();
            let from = peer.info().read().from_first();
            let is_optimistic = optimistic == Some(peer.transfer_id());

            let mut flags = String::new();
            if peer.is_utp() {
                flags.push('T');
            }
            if is_optimistic {
                flags.push('O');
            }
            if is_downloading_from {
                flags.push('D');
            } else if peer.client_is_interested() {
                flags.push('d');
            }
            if is_uploading_to {
                flags.push('U');
            } else if peer_is_interested {
                flags.push('u');
            }
            if !client_is_choked && !peer.client_is_interested() {
                flags.push('K');
            }
            if !peer.peer_is_choked() && !peer_is_interested {
                flags.push('?');
            }
            if peer.is_encrypted() {
                flags.push('E');
            }
            if from == PeerSource::Dht {
                flags.push('H');
            } else if from == PeerSource::Pex {
                flags.push('X');
            }
            if peer.is_incoming() {
                flags.push('I');
            }

            stats.push(PeerStats {
                address: peer.socket_address().to_string(),
                client: peer.client().to_string(),
                from,
                progress: peer.progress(),
                rate_to_peer_kibps: rate_up as f64 / 1024.0,
                rate_to_client_kibps: rate_down as f64 / 1024.0,
                flags,
                is_utp: peer.is_utp(),
                is_encrypted: peer.is_encrypted(),
                is_incoming: peer.is_incoming(),
                peer_is_choked: peer.peer_is_choked(),
                peer_is_interested,
                client_is_choked,
                client_is_interested: peer.client_is_interested(),
                is_downloading_from,
                is_uploading_to,
                is_seed: peer.is_seed(),
                blocks_to_peer: peer.blocks_to_peer(now_secs, CANCEL_HISTORY_SECS),
                blocks_to_client: peer.blocks_to_client(now_secs, CANCEL_HISTORY_SECS),
                cancels_to_peer: peer.cancels_to_peer(now_secs, CANCEL_HISTORY_SECS),
                cancels_to_client: peer.cancels_to_client(now_secs, CANCEL_HISTORY_SECS),
                active_requests_to_peer: active_requests,
            });
        }
        stats
    }

    // --- wire events

    /// Applies a wire-driver event for one live peer.
    pub fn peer_event(&mut self, id: TorrentId, socket_address: SocketAddr, event: PeerEvent) {
        let now_secs = self.clock.now_secs();
        let now_msec = self.clock.now_msec();
        let Some(entry) = self.torrents.get_mut(&id) else {
            return;
        };
        let Some(index) = entry.swarm.peer_index_by_address(socket_address) else {
            return;
        };
        let torrent = &mut entry.torrent;
        let swarm = &mut entry.swarm;

        match event {
            PeerEvent::GotPieceData { length } => {
                torrent.add_downloaded(now_secs, u64::from(length));
                torrent
                    .bandwidth_mut()
                    .notify_bytes(Direction::Down, now_msec, u64::from(length));
                self.bandwidth
                    .notify_bytes(Direction::Down, now_msec, u64::from(length));
                let peer = &mut swarm.peers[index];
                peer.record_piece_data(Direction::Down, now_msec, u64::from(length));
                peer.info().write().set_latest_piece_data_time(now_secs);
            }
            PeerEvent::SentPieceData { length } => {
                torrent.add_uploaded(now_secs, u64::from(length));
                torrent
                    .bandwidth_mut()
                    .notify_bytes(Direction::Up, now_msec, u64::from(length));
                self.bandwidth
                    .notify_bytes(Direction::Up, now_msec, u64::from(length));
                let peer = &mut swarm.peers[index];
                peer.record_piece_data(Direction::Up, now_msec, u64::from(length));
                peer.record_block_sent_to_peer(now_secs);
                peer.info().write().set_latest_piece_data_time(now_secs);
            }
            PeerEvent::GotHave(piece) => {
                swarm.peers[index].on_got_have(piece);
                self.note_seed_if_complete(id, index);
            }
            PeerEvent::GotHaveAll => {
                swarm.peers[index].on_got_have_all();
                self.note_seed_if_complete(id, index);
            }
            PeerEvent::GotHaveNone => {
                swarm.peers[index].on_got_have_none();
            }
            PeerEvent::GotBitfield(bits) => {
                if swarm.peers[index].on_got_bitfield(bits).is_err() {
                    debug!(
                        peer = %socket_address,
                        "malformed bitfield; marking peer for purge"
                    );
                    swarm.peers[index].set_do_purge();
                } else {
                    self.note_seed_if_complete(id, index);
                }
            }
            PeerEvent::GotChoke => {
                let transfer = swarm.peers[index].transfer_id();
                swarm.active_requests.remove_transfer(transfer);
            }
            PeerEvent::GotPort { port } => {
                if port != 0 {
                    swarm.handle_port_advertised(index, port, now_secs);
                }
            }
            PeerEvent::GotSuggest(_) | PeerEvent::GotAllowedFast(_) => {
                // not currently supported
            }
            PeerEvent::GotReject { piece, offset } => {
                let block = torrent.block_at(piece, offset);
                let transfer = swarm.peers[index].transfer_id();
                swarm.active_requests.remove(block, transfer);
            }
            PeerEvent::GotBlock { piece, offset } => {
                let block = torrent.block_at(piece, offset);
                let transfer = swarm.peers[index].transfer_id();
                swarm.peers[index].blame_piece(piece);
                swarm.peers[index].record_block_sent_to_client(now_secs);
                swarm.active_requests.remove(block, transfer);
                swarm.cancel_all_requests_for_block(block, Some(transfer), now_secs);
                if torrent.got_block(block).is_some() {
                    swarm.update_endgame(torrent);
                }
            }
            PeerEvent::Error(code) => {
                if code.is_protocol_fault() {
                    debug!(
                        peer = %socket_address,
                        ?code,
                        "protocol fault; marking peer for purge"
                    );
                    swarm.peers[index].set_do_purge();
                } else {
                    trace!(peer = %socket_address, ?code, "unhandled peer error");
                }
            }
        }
    }

    fn note_seed_if_complete(&mut self, id: TorrentId, index: usize) {
        if let Some(entry) = self.torrents.get_mut(&id) {
            if entry.swarm.peers[index].is_seed() {
                let info = entry.swarm.peers[index].info().clone();
                entry.swarm.mark_peer_as_seed(&info);
            }
        }
    }

    // --- pulses

    /// Wants the next rechoke pulse promptly rather than on schedule.
    pub fn rechoke_soon(&mut self) {
        self.rechoke_soon = true;
    }

    /// Delay until the next rechoke pulse; consumes the soon flag.
    pub fn next_rechoke_delay(&mut self) -> Duration {
        if std::mem::take(&mut self.rechoke_soon) {
            self.config.timing.rechoke_soon_period
        } else {
            self.config.timing.rechoke_period
        }
    }

    /// The 500 ms pulse: drive peers, allocate bandwidth, promote queued
    /// torrents, then run the reconnect sweep.
    pub fn bandwidth_pulse(&mut self) {
        let now_msec = self.clock.now_msec();

        for entry in self.torrents.values_mut() {
            for peer in &mut entry.swarm.peers {
                peer.pulse();
            }
        }

        let period_msec = self.config.timing.bandwidth_period.as_millis() as u64;
        self.bandwidth.allocate(now_msec, period_msec);

        for entry in self.torrents.values_mut() {
            entry.torrent.do_idle_work(now_msec);
        }

        self.queue_pulse(Direction::Up);
        self.queue_pulse(Direction::Down);

        self.reconnect_pulse();
    }

    /// The rechoke pulse: seed-limit checks, choke scheduling, interest.
    pub fn rechoke_pulse(&mut self) {
        let now_secs = self.clock.now_secs();
        let now_msec = self.clock.now_msec();
        let upload_slots = self.config.peers.upload_slots_per_torrent;
        let ids = self.torrent_ids();

        for id in ids {
            let Some(entry) = self.torrents.get_mut(&id) else {
                continue;
            };

            if entry.torrent.is_running() && entry.torrent.seed_limit_reached() {
                info!(torrent = %id, "seed ratio reached; stopping");
                entry.torrent.stop();
                entry.swarm.handle_torrent_event(
                    &mut entry.torrent,
                    TorrentEvent::Stopped,
                    now_secs,
                );
                continue;
            }

            if entry.torrent.is_running() && entry.swarm.stats.peer_count > 0 {
                let is_maxed_out = entry
                    .torrent
                    .bandwidth_mut()
                    .is_maxed_out(Direction::Up, now_msec);
                let mut salter = SaltShaker::new(self.rng.next_u64());
                choke::rechoke_uploads(
                    &entry.torrent,
                    &mut entry.swarm,
                    upload_slots,
                    is_maxed_out,
                    &mut salter,
                    now_msec,
                );
                choke::update_interest(&entry.torrent, &mut entry.swarm);
            }
        }
    }

    /// The 10 s upkeep pulse: cancel requests past their TTL.
    pub fn refill_upkeep(&mut self) {
        let now_secs = self.clock.now_secs();
        for entry in self.torrents.values_mut() {
            entry.swarm.cancel_old_requests(now_secs);
        }
    }

    /// Closes bad peers, enforces peer limits, and dials new candidates.
    pub fn reconnect_pulse(&mut self) {
        let now_secs = self.clock.now_secs();

        // close peers that want closing
        for entry in self.torrents.values_mut() {
            let torrent = &entry.torrent;
            let swarm = &mut entry.swarm;

            if !swarm.is_running {
                swarm.remove_all_peers(now_secs);
                continue;
            }

            let peer_count = swarm.peer_count();
            let doomed: Vec<TransferId> = (0..peer_count)
                .filter(|index| {
                    swarm.should_peer_be_closed(
                        *index,
                        torrent,
                        peer_count,
                        now_secs,
                        MIN_UPLOAD_IDLE_SECS,
                        MAX_UPLOAD_IDLE_SECS,
                    )
                })
                .map(|index| swarm.peers[index].transfer_id())
                .collect();
            for id in doomed {
                swarm.remove_peer_by_id(id, now_secs);
            }
        }

        // per-torrent peer limits
        for entry in self.torrents.values_mut() {
            if entry.torrent.is_running() {
                enforce_swarm_peer_limit(&mut entry.swarm, entry.torrent.peer_limit(), now_secs);
            }
        }

        self.enforce_session_peer_limit(now_secs);
        self.make_new_peer_connections();
    }

    /// Live peers across every swarm.
    pub fn connected_peer_count(&self) -> usize {
        self.torrents
            .values()
            .map(|entry| entry.swarm.peer_count())
            .sum()
    }

    fn enforce_session_peer_limit(&mut self, now_secs: u64) {
        let max = self.config.peers.peer_limit_global;
        if self.connected_peer_count() <= max {
            return;
        }

        // rank every peer in the session, most active first
        let mut ranked: Vec<(TorrentId, TransferId, bool, u64)> = self
            .torrents
            .iter()
            .flat_map(|(id, entry)| {
                entry.swarm.peers.iter().map(move |peer| {
                    (
                        *id,
                        peer.transfer_id(),
                        peer.do_purge(),
                        peer.info().read().latest_piece_data_time(),
                    )
                })
            })
            .collect();
        ranked.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| b.3.cmp(&a.3)));

        let victims: Vec<(TorrentId, TransferId)> = ranked
            .into_iter()
            .skip(max)
            .map(|(torrent, transfer, _, _)| (torrent, transfer))
            .collect();
        for (torrent, transfer) in victims {
            if let Some(entry) = self.torrents.get_mut(&torrent) {
                entry.swarm.remove_peer_by_id(transfer, now_secs);
            }
        }
    }

    fn queue_pulse(&mut self, direction: Direction) {
        let (enabled, size) = match direction {
            Direction::Down => (
                self.config.network.download_queue_enabled,
                self.config.network.download_queue_size,
            ),
            Direction::Up => (
                self.config.network.seed_queue_enabled,
                self.config.network.seed_queue_size,
            ),
        };
        if !enabled {
            return;
        }

        let matches_direction = |torrent: &Torrent| match direction {
            Direction::Down => !torrent.is_done(),
            Direction::Up => torrent.is_done(),
        };

        let running = self
            .torrents
            .values()
            .filter(|entry| entry.torrent.is_running() && matches_direction(&entry.torrent))
            .count();
        let free = size.saturating_sub(running);
        if free == 0 {
            return;
        }

        let promote: Vec<TorrentId> = self
            .torrents
            .values()
            .filter(|entry| {
                entry.torrent.is_queued()
                    && !entry.torrent.is_running()
                    && matches_direction(&entry.torrent)
            })
            .take(free)
            .map(|entry| entry.torrent.id())
            .collect();

        for id in promote {
            debug!(torrent = %id, "promoting queued torrent");
            self.torrent_event(id, TorrentEvent::Started);
        }
    }

    // --- outbound dialing

    fn make_new_peer_connections(&mut self) {
        if self.outbound_candidates.is_empty() {
            let candidates = self.get_peer_candidates();
            self.outbound_candidates.refill(candidates);
        }

        for _ in 0..MAX_CONNECTIONS_PER_PULSE {
            let Some((torrent, address)) = self.outbound_candidates.pop() else {
                break;
            };
            self.initiate_connection(torrent, address);
        }
    }

    /// Builds the ranked candidate list, best last.
    fn get_peer_candidates(&mut self) -> Vec<(TorrentId, SocketAddr)> {
        let now_secs = self.clock.now_secs();
        let now_msec = self.clock.now_msec();

        // leave a slice of the peer budget for incoming connections
        let max_outbound =
            (self.config.peers.peer_limit_global as f64 * OUTBOUND_PEER_BUDGET_RATIO) as usize;
        if self.connected_peer_count() >= max_outbound {
            return Vec::new();
        }

        let mut salter = SaltShaker::new(self.rng.next_u64());
        let mut candidates: Vec<(u64, TorrentId, SocketAddr)> = Vec::new();

        for entry in self.torrents.values_mut() {
            if !entry.swarm.is_running {
                continue;
            }

            let seeding = entry.torrent.is_done();
            if seeding && entry.swarm.is_all_seeds() && !entry.torrent.allows_pex() {
                continue;
            }
            if entry.swarm.peer_count() >= entry.torrent.peer_limit() {
                continue;
            }
            if seeding
                && entry
                    .torrent
                    .bandwidth_mut()
                    .is_maxed_out(Direction::Up, now_msec)
            {
                continue;
            }

            let torrent = &entry.torrent;
            let swarm = &entry.swarm;
            for (address, handle) in &swarm.connectable_pool {
                let mut record = handle.write();
                if is_peer_candidate(torrent, swarm, &mut record, &self.blocklist, now_secs) {
                    candidates.push((
                        candidate_score(torrent, &record, salter.next_salt(), now_secs),
                        torrent.id(),
                        *address,
                    ));
                }
            }
        }

        candidates.sort_unstable_by_key(|(score, _, _)| *score);
        candidates.truncate(OUTBOUND_CANDIDATE_LIST_CAPACITY);
        candidates.reverse();
        candidates
            .into_iter()
            .map(|(_, torrent, address)| (torrent, address))
            .collect()
    }

    /// Dials one candidate, enrolling an outgoing handshake on success.
    fn initiate_connection(&mut self, id: TorrentId, address: SocketAddr) {
        let now_secs = self.clock.now_secs();

        // the cache may outlive the torrent or the record; skip stale keys
        let Some(entry) = self.torrents.get_mut(&id) else {
            return;
        };
        let Some(info) = entry.swarm.existing_peer_info(address) else {
            return;
        };

        let use_utp =
            self.config.network.allows_utp && info.read().supports_utp().unwrap_or(true);
        if !use_utp && !self.config.network.allows_tcp {
            return;
        }
        if self.transport.open_socket_count() >= self.transport.socket_limit() {
            return;
        }

        let transport = if use_utp { "utp" } else { "tcp" };
        debug!(peer = %address, transport, "starting an outgoing connection");

        let request = DialRequest {
            address,
            info_hash: entry.torrent.info_hash(),
            client_is_seed: entry.torrent.is_seed(),
            use_utp,
            encryption: self.config.network.encryption_mode,
        };

        match self.transport.dial(request) {
            Ok(io) => {
                entry.swarm.outgoing_handshakes.insert(
                    address,
                    Handshake::new(io, self.config.network.encryption_mode, now_secs),
                );
            }
            Err(error) => {
                debug!(peer = %address, %error, "dial failed; marking peer unreachable");
                let mut record = info.write();
                record.set_connectable(false);
                record.on_connection_failed();
            }
        }

        info.write().set_connection_attempt_time(now_secs);
    }
}

/// Whether a pool record is worth handing out in a peer listing.
fn is_peer_interesting(
    torrent: &Torrent,
    swarm: &Swarm,
    handle: &PeerInfoHandle,
    blocklist: &Blocklist,
) -> bool {
    let mut record = handle.write();
    if torrent.is_done() && record.is_seed() {
        return false;
    }
    if swarm.peer_is_in_use(&record) {
        return true;
    }
    if record.is_blocklisted(blocklist) {
        return false;
    }
    !record.is_banned()
}

/// Closes the least active peers until the swarm is back under its cap.
fn enforce_swarm_peer_limit(swarm: &mut Swarm, max: usize, now_secs: u64) {
    let count = swarm.peer_count();
    if count <= max {
        return;
    }

    // least active first: purge-marked peers, then stale piece data
    let mut ranked: Vec<(TransferId, bool, u64)> = swarm
        .peers
        .iter()
        .map(|peer| {
            (
                peer.transfer_id(),
                peer.do_purge(),
                peer.info().read().latest_piece_data_time(),
            )
        })
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.2.cmp(&b.2)));

    for (transfer, _, _) in ranked.into_iter().take(count - max) {
        swarm.remove_peer_by_id(transfer, now_secs);
    }
}

/// Wishlist view of one (torrent, transfer) pair.
struct SwarmMediator<'a> {
    torrent: &'a Torrent,
    swarm: &'a Swarm,
    transfer: TransferId,
}

impl SwarmMediator<'_> {
    fn transfer_has_piece(&self, piece: PieceIndex) -> bool {
        if let Some(index) = self.swarm.peer_index_by_id(self.transfer) {
            return self.swarm.peers[index].has_piece(piece);
        }
        self.swarm
            .webseeds
            .iter()
            .any(|webseed| webseed.transfer_id() == self.transfer)
    }
}

impl WishlistMediator for SwarmMediator<'_> {
    fn client_can_request_block(&self, block: BlockIndex) -> bool {
        !self.torrent.has_block(block) && !self.swarm.active_requests.has(block, self.transfer)
    }

    fn client_can_request_piece(&self, piece: PieceIndex) -> bool {
        self.torrent.piece_is_wanted(piece) && self.transfer_has_piece(piece)
    }

    fn is_endgame(&self) -> bool {
        self.swarm.is_endgame()
    }

    fn count_active_requests(&self, block: BlockIndex) -> usize {
        self.swarm.active_requests.count_for_block(block)
    }

    fn count_missing_blocks(&self, piece: PieceIndex) -> u64 {
        self.torrent.count_missing_blocks_in_piece(piece)
    }

    fn block_span(&self, piece: PieceIndex) -> BlockSpan {
        self.torrent.block_span_for_piece(piece)
    }

    fn piece_count(&self) -> u32 {
        self.torrent.piece_count()
    }

    fn priority(&self, piece: PieceIndex) -> crate::torrent::Priority {
        self.torrent.piece_priority(piece)
    }

    fn is_sequential_download(&self) -> bool {
        self.torrent.sequential_download()
    }
}

/// Background pulse timers for a shared manager.
///
/// Three tasks lock the manager and fire its pulses on the configured
/// periods; the rechoke task re-reads its delay every round so
/// [`PeerManager::rechoke_soon`] takes effect. Tasks stop when the driver
/// is dropped or shut down.
pub struct PulseDriver {
    tasks: Vec<JoinHandle<()>>,
}

impl PulseDriver {
    /// Spawns the three pulse tasks on the current tokio runtime.
    pub fn spawn(manager: Arc<tokio::sync::Mutex<PeerManager>>) -> Self {
        let bandwidth = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let period = manager.lock().await.config().timing.bandwidth_period;
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    manager.lock().await.bandwidth_pulse();
                }
            })
        };

        let rechoke = {
            let manager = manager.clone();
            tokio::spawn(async move {
                loop {
                    let delay = manager.lock().await.next_rechoke_delay();
                    tokio::time::sleep(delay).await;
                    manager.lock().await.rechoke_pulse();
                }
            })
        };

        let refill = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let period = manager.lock().await.config().timing.refill_upkeep_period;
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    manager.lock().await.refill_upkeep();
                }
            })
        };

        Self {
            tasks: vec![bandwidth, rechoke, refill],
        }
    }

    /// Stops the pulse tasks.
    pub fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for PulseDriver {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
