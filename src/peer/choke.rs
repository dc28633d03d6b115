//! Choke scheduling and interest updates

use tracing::trace;

use crate::peer::connection::Transfer;
use crate::peer::salt::SaltShaker;
use crate::peer::swarm::Swarm;
use crate::torrent::{Direction, PieceIndex, Torrent};

/// Rechoke pulses an optimistic unchoke survives before it can rotate.
pub(crate) const OPTIMISTIC_UNCHOKE_MULTIPLIER: u8 = 4;

#[derive(Debug)]
struct ChokeCandidate {
    index: usize,
    rate: u64,
    salt: u8,
    is_interested: bool,
    was_choked: bool,
    is_choked: bool,
}

impl ChokeCandidate {
    /// Better goes first: higher rate, then already-unchoked, then salt.
    fn sort_key(&self) -> (std::cmp::Reverse<u64>, bool, u8) {
        (std::cmp::Reverse(self.rate), self.was_choked, self.salt)
    }
}

/// Rate used to rank a peer for unchoking.
///
/// Seeding ranks by what we push to the peer. Private torrents count both
/// directions because the trading window may be short. Everything else
/// ranks by what the peer gives us.
fn choke_rate(
    torrent: &Torrent,
    swarm: &mut Swarm,
    index: usize,
    now_msec: u64,
) -> u64 {
    let peer = &mut swarm.peers[index];
    if torrent.is_done() {
        peer.piece_data_rate(Direction::Up, now_msec)
    } else if torrent.is_private() {
        peer.piece_data_rate(Direction::Down, now_msec)
            + peer.piece_data_rate(Direction::Up, now_msec)
    } else {
        peer.piece_data_rate(Direction::Down, now_msec)
    }
}

/// Recomputes choke state for every peer in the swarm.
///
/// Unchokes the fastest interested peers up to the slot budget, holds the
/// optimistic peer open while its countdown runs, and — when upload
/// bandwidth is saturated — keeps existing slots without opening new ones.
pub(crate) fn rechoke_uploads(
    torrent: &Torrent,
    swarm: &mut Swarm,
    upload_slots: usize,
    is_maxed_out: bool,
    salter: &mut SaltShaker,
    now_msec: u64,
) {
    // the optimistic state survives a fixed number of pulses
    if swarm.optimistic_unchoke_time_scaler > 0 {
        swarm.optimistic_unchoke_time_scaler -= 1;
    } else {
        swarm.optimistic = None;
    }
    let optimistic = swarm.optimistic;
    let choke_all = !torrent.client_can_upload();

    let mut candidates: Vec<ChokeCandidate> = Vec::with_capacity(swarm.peers.len());
    for index in 0..swarm.peers.len() {
        let rate = choke_rate(torrent, swarm, index, now_msec);
        let peer = &mut swarm.peers[index];

        if peer.is_seed() || choke_all {
            // seeds want nothing from us; choke_all means we cannot serve
            peer.set_choke(true);
        } else if Some(peer.transfer_id()) != optimistic {
            candidates.push(ChokeCandidate {
                index,
                rate,
                salt: salter.next_salt(),
                is_interested: peer.peer_is_interested(),
                was_choked: peer.peer_is_choked(),
                is_choked: true,
            });
        }
    }

    candidates.sort_by_key(ChokeCandidate::sort_key);

    // grant slots down the ranking until enough interested peers hold one;
    // faster-but-uninterested peers ride along unchoked so they can start
    let mut checked_count = 0usize;
    let mut unchoked_interested = 0usize;
    for candidate in &mut candidates {
        if unchoked_interested >= upload_slots {
            break;
        }
        candidate.is_choked = if is_maxed_out {
            candidate.was_choked
        } else {
            false
        };
        checked_count += 1;
        if candidate.is_interested {
            unchoked_interested += 1;
        }
    }

    // optimistic unchoke from the leftovers
    if swarm.optimistic.is_none() && !is_maxed_out && checked_count < candidates.len() {
        let pool: Vec<usize> = (checked_count..candidates.len())
            .filter(|slot| candidates[*slot].is_interested)
            .collect();
        if !pool.is_empty() {
            let slot = pool[salter.next_index(pool.len())];
            candidates[slot].is_choked = false;
            let peer_index = candidates[slot].index;
            swarm.optimistic = Some(swarm.peers[peer_index].transfer_id());
            swarm.optimistic_unchoke_time_scaler = OPTIMISTIC_UNCHOKE_MULTIPLIER;
            trace!(peer = %swarm.peers[peer_index].socket_address(), "optimistic unchoke");
        }
    }

    for candidate in &candidates {
        swarm.peers[candidate.index].set_choke(candidate.is_choked);
    }
}

/// Recomputes the interested flag for every peer in the swarm.
pub(crate) fn update_interest(torrent: &Torrent, swarm: &mut Swarm) {
    if torrent.is_done() || !torrent.client_can_download() {
        return;
    }
    if swarm.peers.is_empty() {
        return;
    }

    let piece_count = torrent.piece_count();
    let interesting: Vec<bool> = (0..piece_count)
        .map(PieceIndex)
        .map(|piece| torrent.piece_is_wanted(piece) && !torrent.has_piece(piece))
        .collect();

    for peer in &mut swarm.peers {
        let wanted = peer.is_seed()
            || (0..piece_count)
                .map(PieceIndex)
                .any(|piece| interesting[piece.as_u32() as usize] && peer.has_piece(piece));
        peer.set_interested(wanted);
    }
}
