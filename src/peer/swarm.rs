//! Per-torrent swarm state
//!
//! A swarm owns everything peer-shaped for one torrent: the live
//! connections, the three address-keyed pools behind them, the pending
//! outgoing handshakes, and the outstanding-request ledger. The manager
//! drives it; nothing here talks to the network directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::net::PeerIo;
use crate::peer::connection::{PeerChannel, PeerConnection, Transfer, Webseed};
use crate::peer::handshake::Handshake;
use crate::peer::info::{compare_usefulness, PeerInfo, PeerInfoHandle};
use crate::peer::requests::ActiveRequests;
use crate::peer::{PeerSource, PexFlags, TransferId};
use crate::torrent::model::BLOCK_SIZE;
use crate::torrent::{BlockIndex, Direction, Torrent, TorrentEvent, TorrentId};

/// Corrupt pieces a peer may contribute to before being banned.
pub(crate) const MAX_BAD_PIECES_PER_PEER: u8 = 5;

/// Seconds an outstanding block request may linger before it is cancelled.
pub(crate) const REQUEST_TTL_SECS: u64 = 90;

/// Seconds a both-seeds connection lingers so PEX can finish.
const SEED_LINGER_SECS: u64 = 30;

/// Aggregate counters for one swarm.
#[derive(Debug, Clone, Default)]
pub struct SwarmStats {
    /// Live peer connections.
    pub peer_count: usize,
    /// Live peers by first-discovery source.
    pub peer_from_count: [usize; PeerSource::COUNT],
    /// Peers actively moving payload, indexed by [`Direction::index`].
    pub active_peer_count: [usize; 2],
    /// Webseeds currently downloading.
    pub active_webseed_count: usize,
}

/// Peer state for one torrent.
pub struct Swarm {
    pub(crate) torrent_id: TorrentId,
    /// Peers we believe we can dial, keyed by listening address.
    pub(crate) connectable_pool: HashMap<SocketAddr, PeerInfoHandle>,
    /// Connected incoming peers with unknown listen port, keyed by socket
    /// address.
    pub(crate) incoming_pool: HashMap<SocketAddr, PeerInfoHandle>,
    /// Records displaced by merge collisions, kept for their counters.
    pub(crate) graveyard_pool: HashMap<SocketAddr, PeerInfoHandle>,
    pub(crate) peers: Vec<PeerConnection>,
    pub(crate) webseeds: Vec<Webseed>,
    pub(crate) outgoing_handshakes: HashMap<SocketAddr, Handshake>,
    pub(crate) active_requests: ActiveRequests,
    pub(crate) stats: SwarmStats,
    pub(crate) is_running: bool,
    pub(crate) optimistic: Option<TransferId>,
    pub(crate) optimistic_unchoke_time_scaler: u8,
    pub(crate) last_cancel: u64,
    is_endgame: bool,
    pool_is_all_seeds: Option<bool>,
    next_transfer_id: u64,
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("torrent_id", &self.torrent_id)
            .field("peer_count", &self.stats.peer_count)
            .field("connectable", &self.connectable_pool.len())
            .field("incoming", &self.incoming_pool.len())
            .field("is_running", &self.is_running)
            .finish_non_exhaustive()
    }
}

impl Swarm {
    /// Creates the swarm for a freshly added torrent.
    pub fn new(torrent: &Torrent) -> Self {
        let mut swarm = Self {
            torrent_id: torrent.id(),
            connectable_pool: HashMap::new(),
            incoming_pool: HashMap::new(),
            graveyard_pool: HashMap::new(),
            peers: Vec::new(),
            webseeds: Vec::new(),
            outgoing_handshakes: HashMap::new(),
            active_requests: ActiveRequests::new(),
            stats: SwarmStats::default(),
            is_running: false,
            optimistic: None,
            optimistic_unchoke_time_scaler: 0,
            last_cancel: 0,
            is_endgame: false,
            pool_is_all_seeds: None,
            next_transfer_id: 0,
        };
        swarm.rebuild_webseeds(torrent);
        swarm
    }

    /// Live peer connection count.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Aggregate counters.
    pub fn stats(&self) -> &SwarmStats {
        &self.stats
    }

    /// Whether the torrent behind this swarm is running.
    pub fn is_running(&self) -> bool {
        self.is_running
    }

    fn next_transfer_id(&mut self) -> TransferId {
        let id = TransferId(self.next_transfer_id);
        self.next_transfer_id += 1;
        id
    }

    /// Recreates webseed bookkeeping from the torrent's metainfo.
    pub(crate) fn rebuild_webseeds(&mut self, torrent: &Torrent) {
        for webseed in self.webseeds.drain(..) {
            self.active_requests.remove_transfer(webseed.transfer_id());
        }
        let urls: Vec<String> = torrent.webseed_urls().to_vec();
        for url in urls {
            let id = self.next_transfer_id();
            self.webseeds.push(Webseed::new(id, url));
        }
        self.stats.active_webseed_count = 0;
    }

    /// Webseeds currently pulling piece data.
    pub(crate) fn count_active_webseeds(&mut self, torrent: &Torrent, now_msec: u64) -> usize {
        if !torrent.is_running() || torrent.is_done() {
            return 0;
        }
        let mut count = 0;
        for webseed in self.webseeds.iter_mut() {
            if webseed.is_transferring(now_msec, Direction::Down) {
                count += 1;
            }
        }
        count
    }

    /// Finds or creates the record for a peer address.
    ///
    /// Rediscoveries fold their source and flags into the existing record.
    pub(crate) fn ensure_info_exists(
        &mut self,
        socket_address: SocketAddr,
        flags: PexFlags,
        from: PeerSource,
        connectable: bool,
    ) -> PeerInfoHandle {
        let pool = if connectable {
            &mut self.connectable_pool
        } else {
            &mut self.incoming_pool
        };

        let handle = match pool.get(&socket_address) {
            Some(handle) => {
                let handle = handle.clone();
                {
                    let mut info = handle.write();
                    info.found_at(from);
                    info.set_pex_flags(flags);
                }
                handle
            }
            None => {
                let listen_port = connectable.then_some(socket_address.port());
                let handle =
                    PeerInfo::new_handle(socket_address.ip(), listen_port, flags, from);
                pool.insert(socket_address, handle.clone());
                handle
            }
        };

        self.mark_all_seeds_dirty();
        handle
    }

    /// Record for a dialable peer, if we know it.
    pub fn existing_peer_info(&self, socket_address: SocketAddr) -> Option<PeerInfoHandle> {
        self.connectable_pool.get(&socket_address).cloned()
    }

    /// Number of dialable records.
    pub fn connectable_count(&self) -> usize {
        self.connectable_pool.len()
    }

    /// Number of connected incoming records with unknown listen port.
    pub fn incoming_count(&self) -> usize {
        self.incoming_pool.len()
    }

    /// Number of records displaced by merge collisions.
    pub fn graveyard_count(&self) -> usize {
        self.graveyard_pool.len()
    }

    /// Number of outgoing handshakes in flight.
    pub fn outgoing_handshake_count(&self) -> usize {
        self.outgoing_handshakes.len()
    }

    /// Transfer id of the live peer on a socket, for request bookkeeping.
    pub fn transfer_for_address(&self, socket_address: SocketAddr) -> Option<TransferId> {
        self.peer_index_by_address(socket_address)
            .map(|index| self.peers[index].transfer_id())
    }

    /// Whether a record is backed by a connection or a pending dial.
    pub(crate) fn peer_is_in_use(&self, info: &PeerInfo) -> bool {
        info.is_connected()
            || self
                .outgoing_handshakes
                .contains_key(&info.listen_socket_address())
    }

    /// Whether every known dialable peer is a seed. Cached; invalidated on
    /// pool changes.
    pub(crate) fn is_all_seeds(&mut self) -> bool {
        if self.pool_is_all_seeds.is_none() {
            let verdict = self
                .connectable_pool
                .values()
                .all(|handle| handle.read().is_seed());
            self.pool_is_all_seeds = Some(verdict);
        }
        self.pool_is_all_seeds.unwrap_or(true)
    }

    pub(crate) fn mark_all_seeds_dirty(&mut self) {
        self.pool_is_all_seeds = None;
    }

    /// Marks a record as a seed and invalidates the all-seeds cache.
    pub(crate) fn mark_peer_as_seed(&mut self, info: &PeerInfoHandle) {
        trace!(peer = %info.read().display_name(), "marking peer as a seed");
        info.write().set_seed();
        self.mark_all_seeds_dirty();
    }

    /// Admits a handshaken connection into the swarm.
    pub(crate) fn add_peer(
        &mut self,
        info: PeerInfoHandle,
        io: PeerIo,
        channel: Box<dyn PeerChannel>,
        client: String,
        piece_count: u32,
        now_secs: u64,
    ) -> TransferId {
        let id = self.next_transfer_id();
        let from_first = {
            let mut record = info.write();
            record.set_connected(true, now_secs);
            record.from_first()
        };

        self.peers.push(PeerConnection::new(
            id,
            info,
            io,
            channel,
            client,
            piece_count,
        ));

        self.stats.peer_count += 1;
        self.stats.peer_from_count[from_first.index()] += 1;
        debug_assert_eq!(self.stats.peer_count, self.peers.len());
        id
    }

    /// Index of a live peer by socket address.
    pub(crate) fn peer_index_by_address(&self, socket_address: SocketAddr) -> Option<usize> {
        self.peers
            .iter()
            .position(|peer| peer.socket_address() == socket_address)
    }

    /// Index of a live peer by transfer id.
    pub(crate) fn peer_index_by_id(&self, id: TransferId) -> Option<usize> {
        self.peers.iter().position(|peer| peer.transfer_id() == id)
    }

    fn peer_index_by_info(&self, info: &PeerInfoHandle) -> Option<usize> {
        self.peers
            .iter()
            .position(|peer| Arc::ptr_eq(peer.info(), info))
    }

    /// Closes one peer connection and cleans up its pool entries.
    pub(crate) fn remove_peer(&mut self, index: usize, now_secs: u64) {
        let peer = self.peers.remove(index);
        let id = peer.transfer_id();
        let info = peer.info().clone();
        let was_incoming = peer.is_incoming();
        let socket_address = peer.socket_address();

        self.active_requests.remove_transfer(id);
        if self.optimistic == Some(id) {
            self.optimistic = None;
        }

        let (from_first, listen_key, port_known) = {
            let mut record = info.write();
            record.set_connected(false, now_secs);
            (
                record.from_first(),
                record.listen_socket_address(),
                record.listen_port().is_some(),
            )
        };

        self.stats.peer_count -= 1;
        self.stats.peer_from_count[from_first.index()] -= 1;
        debug_assert_eq!(self.stats.peer_count, self.peers.len());

        // incoming records with no learned port die with their connection;
        // displaced records have no further use once the loser disconnects
        if was_incoming && !port_known {
            self.incoming_pool.remove(&socket_address);
        }
        if port_known {
            self.graveyard_pool.remove(&listen_key);
        }
        self.mark_all_seeds_dirty();
    }

    /// Closes one peer connection by transfer id.
    pub(crate) fn remove_peer_by_id(&mut self, id: TransferId, now_secs: u64) {
        if let Some(index) = self.peer_index_by_id(id) {
            self.remove_peer(index, now_secs);
        }
    }

    /// Closes every peer connection.
    pub(crate) fn remove_all_peers(&mut self, now_secs: u64) {
        while !self.peers.is_empty() {
            self.remove_peer(self.peers.len() - 1, now_secs);
        }
        debug_assert_eq!(self.stats.peer_count, 0);
    }

    /// Stops the swarm: closes peers and abandons pending dials.
    pub(crate) fn stop(&mut self, now_secs: u64) {
        self.is_running = false;
        self.remove_all_peers(now_secs);
        self.outgoing_handshakes.clear();
    }

    /// Adds a corrupt-piece strike, banning at the threshold.
    pub(crate) fn add_strike(&mut self, index: usize) {
        let peer = &mut self.peers[index];
        let strikes = peer.add_strike();
        trace!(peer = %peer.display_name(), strikes, "increasing strike count");

        if strikes >= MAX_BAD_PIECES_PER_PEER {
            peer.info().write().ban();
            peer.set_do_purge();
            debug!(peer = %peer.display_name(), "banning peer");
        }
    }

    /// Recomputes the endgame flag from outstanding requests.
    pub(crate) fn update_endgame(&mut self, torrent: &Torrent) {
        let requested_bytes = self.active_requests.len() as u64 * u64::from(BLOCK_SIZE);
        self.is_endgame = requested_bytes >= torrent.left_until_done();
    }

    /// Whether outstanding requests cover everything still missing.
    pub fn is_endgame(&self) -> bool {
        self.is_endgame
    }

    /// Cancels requests older than the TTL.
    pub(crate) fn cancel_old_requests(&mut self, now_secs: u64) {
        let cutoff = now_secs.saturating_sub(REQUEST_TTL_SECS);
        for (block, transfer) in self.active_requests.sent_before(cutoff) {
            self.active_requests.remove(block, transfer);
            self.send_cancel(transfer, block, now_secs);
        }
    }

    /// Cancels every other request for a block that just arrived.
    pub(crate) fn cancel_all_requests_for_block(
        &mut self,
        block: BlockIndex,
        no_notify: Option<TransferId>,
        now_secs: u64,
    ) {
        for transfer in self.active_requests.remove_block(block) {
            if Some(transfer) != no_notify {
                self.send_cancel(transfer, block, now_secs);
            }
        }
        self.last_cancel = now_secs;
    }

    /// Sends Cancel when the holder is a wire peer; webseeds are skipped.
    fn send_cancel(&mut self, transfer: TransferId, block: BlockIndex, now_secs: u64) {
        if let Some(index) = self.peer_index_by_id(transfer) {
            self.peers[index].cancel_block_request(block, now_secs);
        }
    }

    /// Handles a Port advertisement from a live peer.
    ///
    /// Migrates the record under its listening address, resolving a
    /// collision with an existing record for the same endpoint by keeping
    /// the better peer and merging the loser's history. Runs to completion
    /// under the session lock, so the intermediate state is unobservable.
    pub(crate) fn handle_port_advertised(&mut self, index: usize, port: u16, _now_secs: u64) {
        if port == 0 {
            return;
        }

        let info = self.peers[index].info().clone();
        let socket_address = self.peers[index].socket_address();
        let (listen_address, old_port) = {
            let record = info.read();
            (record.listen_address(), record.listen_port())
        };
        if old_port == Some(port) {
            return;
        }
        let was_connectable = old_port.is_some();
        let new_key = SocketAddr::new(listen_address, port);

        let collision = self
            .connectable_pool
            .get(&new_key)
            .filter(|other| !Arc::ptr_eq(other, &info))
            .cloned();

        if let Some(other) = collision {
            if other.read().is_connected() {
                if self.resolve_port_collision(index, &info, &other, new_key, was_connectable) {
                    return;
                }
            } else {
                info.write().merge(&other.read());
                self.connectable_pool.remove(&new_key);
            }
        }

        if !was_connectable {
            info.write().set_connectable(true);
        }

        // migrate the record under its listening endpoint
        if let Some(old) = old_port {
            self.connectable_pool
                .remove(&SocketAddr::new(listen_address, old));
        } else {
            self.incoming_pool.remove(&socket_address);
        }
        info.write().set_listen_port(port);
        self.connectable_pool.insert(new_key, info);
        self.mark_all_seeds_dirty();
    }

    /// Resolves a port collision against a connected record.
    ///
    /// Returns true when this peer lost and the migration must stop.
    fn resolve_port_collision(
        &mut self,
        index: usize,
        info: &PeerInfoHandle,
        other: &PeerInfoHandle,
        new_key: SocketAddr,
        was_connectable: bool,
    ) -> bool {
        let this_wins = {
            let this = info.read();
            let that = other.read();
            compare_usefulness(&this, &that).is_lt()
        };

        if this_wins {
            if let Some(loser_index) = self.peer_index_by_info(other) {
                debug!(
                    peer = %self.peers[loser_index].display_name(),
                    "closing duplicate connection in favor of a better peer"
                );
                self.peers[loser_index].set_do_purge();
            }
            if let Some(displaced) = self.connectable_pool.remove(&new_key) {
                self.graveyard_pool.insert(new_key, displaced);
            }
            info.write().merge(&other.read());
            false
        } else {
            other.write().merge(&info.read());
            debug!(
                peer = %self.peers[index].display_name(),
                "closing duplicate connection; existing peer is better"
            );
            self.peers[index].set_do_purge();

            if was_connectable {
                let old_key = info.read().listen_socket_address();
                if let Some(displaced) = self.connectable_pool.remove(&old_key) {
                    self.graveyard_pool.insert(old_key, displaced);
                }
            }
            self.mark_all_seeds_dirty();
            true
        }
    }

    /// Applies a torrent lifecycle event.
    ///
    /// `Doomed` is handled by the manager, which destroys the swarm.
    pub(crate) fn handle_torrent_event(
        &mut self,
        torrent: &mut Torrent,
        event: TorrentEvent,
        now_secs: u64,
    ) {
        match event {
            TorrentEvent::Started => {
                self.is_running = true;
            }
            TorrentEvent::Stopped => {
                self.stop(now_secs);
            }
            TorrentEvent::Doomed => {
                self.stop(now_secs);
            }
            TorrentEvent::Done => {
                for peer in &mut self.peers {
                    peer.set_interested(false);
                }
            }
            TorrentEvent::GotMetainfo => {
                self.rebuild_webseeds(torrent);
                let piece_count = torrent.piece_count();
                let mut new_seeds = Vec::new();
                for peer in &mut self.peers {
                    peer.on_torrent_got_metainfo(piece_count);
                    if peer.is_seed() {
                        new_seeds.push(peer.info().clone());
                    }
                }
                for info in new_seeds {
                    self.mark_peer_as_seed(&info);
                }
            }
            TorrentEvent::PieceCompleted(_piece) => {
                self.update_endgame(torrent);
            }
            TorrentEvent::GotBadPiece(piece) => {
                torrent.add_corrupt(u64::from(torrent.piece_size_bytes(piece)));
                let blamed: Vec<usize> = self
                    .peers
                    .iter()
                    .enumerate()
                    .filter(|(_, peer)| peer.is_blamed_for(piece))
                    .map(|(index, _)| index)
                    .collect();
                for index in blamed {
                    debug!(
                        peer = %self.peers[index].display_name(),
                        piece = piece.as_u32(),
                        "peer contributed to corrupt piece"
                    );
                    self.add_strike(index);
                }
            }
            TorrentEvent::AllSeeds => {
                let infos: Vec<PeerInfoHandle> = self.connectable_pool.values().cloned().collect();
                for info in infos {
                    self.mark_peer_as_seed(&info);
                }
                self.mark_all_seeds_dirty();
            }
        }
    }

    /// Whether a peer should be closed at the reconnect pulse.
    pub(crate) fn should_peer_be_closed(
        &self,
        index: usize,
        torrent: &Torrent,
        peer_count: usize,
        now_secs: u64,
        min_idle_secs: u64,
        max_idle_secs: u64,
    ) -> bool {
        let peer = &self.peers[index];
        if peer.do_purge() {
            trace!(peer = %peer.display_name(), "purging peer: do_purge flag is set");
            return true;
        }

        let info = peer.info().read();

        // both seeds: nothing left to trade once PEX has had its window
        if torrent.is_done() && peer.is_seed() {
            return !torrent.allows_pex() || info.idle_secs(now_secs).unwrap_or(0) >= SEED_LINGER_SECS;
        }

        // idle limit slides from lax to strict as the swarm fills up
        let relax_below = (torrent.peer_limit() as f64 * 0.9).round() as usize;
        let strictness = if relax_below == 0 || peer_count >= relax_below {
            1.0
        } else {
            peer_count as f64 / relax_below as f64
        };
        let limit =
            max_idle_secs - ((max_idle_secs - min_idle_secs) as f64 * strictness).round() as u64;

        if let Some(idle_secs) = info.idle_secs(now_secs) {
            if idle_secs > limit {
                trace!(
                    peer = %peer.display_name(),
                    idle_secs,
                    "purging peer: idle too long"
                );
                return true;
            }
        }

        false
    }
}
