//! Torrent collaborator model
//!
//! The swarm layer treats a torrent as a bag of geometry, ownership state,
//! limits, and accounting. Metainfo parsing, disk I/O, and verification live
//! elsewhere; hash verdicts and lifecycle changes reach the swarm as
//! [`TorrentEvent`] values.

use crate::net::Bandwidth;
use crate::torrent::{Bitfield, BlockIndex, BlockSpan, InfoHash, PieceIndex, Priority, TorrentId};

/// Transfer unit: torrents are requested in 16 KiB blocks.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Torrents started within this many seconds count as recently started.
const RECENTLY_STARTED_SECS: u64 = 120;

/// Lifecycle notifications from the torrent layer to its swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentEvent {
    /// The torrent began running.
    Started,
    /// The torrent stopped.
    Stopped,
    /// The torrent is being removed; the swarm must tear down.
    Doomed,
    /// The torrent finished downloading everything it wants.
    Done,
    /// Metainfo arrived for a magnet-born torrent.
    GotMetainfo,
    /// A piece completed and passed verification.
    PieceCompleted(PieceIndex),
    /// A completed piece failed hash verification.
    GotBadPiece(PieceIndex),
    /// A tracker reported that every peer in the swarm is a seed.
    AllSeeds,
}

/// One active torrent as seen by the peer manager.
#[derive(Debug)]
pub struct Torrent {
    id: TorrentId,
    info_hash: InfoHash,
    total_size: u64,
    piece_size: u32,
    piece_count: u32,
    block_count: u64,
    have_pieces: Bitfield,
    have_blocks: Vec<bool>,
    wanted: Vec<bool>,
    piece_priorities: Vec<Priority>,
    sequential_download: bool,
    is_private: bool,
    pex_enabled: bool,
    has_metainfo: bool,
    peer_limit: usize,
    priority: Priority,
    is_running: bool,
    is_queued: bool,
    upload_enabled: bool,
    download_enabled: bool,
    start_date: u64,
    date_active: u64,
    downloaded: u64,
    uploaded: u64,
    corrupt: u64,
    seed_ratio_limit: Option<f64>,
    webseed_urls: Vec<String>,
    bandwidth: Bandwidth,
}

impl Torrent {
    /// Session-unique identifier.
    pub fn id(&self) -> TorrentId {
        self.id
    }

    /// Info hash identifying the torrent on the network.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Total payload size in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of pieces.
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Number of blocks.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Size of one piece in bytes; the final piece may be shorter.
    pub fn piece_size_bytes(&self, piece: PieceIndex) -> u32 {
        let offset = u64::from(piece.as_u32()) * u64::from(self.piece_size);
        let remaining = self.total_size.saturating_sub(offset);
        remaining.min(u64::from(self.piece_size)) as u32
    }

    /// Size of one block in bytes; the final block may be shorter.
    pub fn block_size_bytes(&self, block: BlockIndex) -> u32 {
        let offset = block.as_u64() * u64::from(BLOCK_SIZE);
        let remaining = self.total_size.saturating_sub(offset);
        remaining.min(u64::from(BLOCK_SIZE)) as u32
    }

    /// Blocks covering the given piece.
    pub fn block_span_for_piece(&self, piece: PieceIndex) -> BlockSpan {
        let offset = u64::from(piece.as_u32()) * u64::from(self.piece_size);
        let length = u64::from(self.piece_size_bytes(piece));
        let begin = offset / u64::from(BLOCK_SIZE);
        let end = (offset + length).div_ceil(u64::from(BLOCK_SIZE));
        BlockSpan::new(BlockIndex(begin), BlockIndex(end.min(self.block_count)))
    }

    /// Block containing byte `offset` within `piece`.
    pub fn block_at(&self, piece: PieceIndex, offset: u32) -> BlockIndex {
        let byte = u64::from(piece.as_u32()) * u64::from(self.piece_size) + u64::from(offset);
        BlockIndex(byte / u64::from(BLOCK_SIZE))
    }

    /// Whether we have the complete, verified piece.
    pub fn has_piece(&self, piece: PieceIndex) -> bool {
        self.have_pieces.has_piece(piece)
    }

    /// Whether we have the block.
    pub fn has_block(&self, block: BlockIndex) -> bool {
        self.have_blocks
            .get(block.as_u64() as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Our piece ownership bitfield.
    pub fn have_pieces(&self) -> &Bitfield {
        &self.have_pieces
    }

    /// Records a completed block.
    ///
    /// Returns the containing piece when this block was the last one missing
    /// from it. Hash verification is the storage layer's business; callers
    /// feed the verdict back as [`TorrentEvent::PieceCompleted`] or
    /// [`TorrentEvent::GotBadPiece`].
    pub fn got_block(&mut self, block: BlockIndex) -> Option<PieceIndex> {
        let index = block.as_u64() as usize;
        if index >= self.have_blocks.len() || self.have_blocks[index] {
            return None;
        }
        self.have_blocks[index] = true;

        let piece = self.piece_for_block(block);
        let span = self.block_span_for_piece(piece);
        if span.iter().all(|b| self.have_blocks[b.as_u64() as usize]) {
            self.have_pieces.set_piece(piece);
            Some(piece)
        } else {
            None
        }
    }

    /// Drops a piece that failed verification so its blocks get re-fetched.
    pub fn invalidate_piece(&mut self, piece: PieceIndex) {
        self.have_pieces.clear_piece(piece);
        for block in self.block_span_for_piece(piece).iter() {
            if let Some(slot) = self.have_blocks.get_mut(block.as_u64() as usize) {
                *slot = false;
            }
        }
    }

    /// Piece containing the given block.
    pub fn piece_for_block(&self, block: BlockIndex) -> PieceIndex {
        let byte = block.as_u64() * u64::from(BLOCK_SIZE);
        PieceIndex((byte / u64::from(self.piece_size)) as u32)
    }

    /// Whether the user wants this piece downloaded.
    pub fn piece_is_wanted(&self, piece: PieceIndex) -> bool {
        self.wanted
            .get(piece.as_u32() as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Marks a piece wanted or unwanted.
    pub fn set_piece_wanted(&mut self, piece: PieceIndex, wanted: bool) {
        if let Some(slot) = self.wanted.get_mut(piece.as_u32() as usize) {
            *slot = wanted;
        }
    }

    /// Download priority of one piece.
    pub fn piece_priority(&self, piece: PieceIndex) -> Priority {
        self.piece_priorities
            .get(piece.as_u32() as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Missing blocks in one piece.
    pub fn count_missing_blocks_in_piece(&self, piece: PieceIndex) -> u64 {
        self.block_span_for_piece(piece)
            .iter()
            .filter(|block| !self.has_block(*block))
            .count() as u64
    }

    /// Missing bytes in one piece.
    pub fn count_missing_bytes_in_piece(&self, piece: PieceIndex) -> u64 {
        self.block_span_for_piece(piece)
            .iter()
            .filter(|block| !self.has_block(*block))
            .map(|block| u64::from(self.block_size_bytes(block)))
            .sum()
    }

    /// Bytes still needed before every wanted piece is complete.
    pub fn left_until_done(&self) -> u64 {
        (0..self.piece_count)
            .map(PieceIndex)
            .filter(|piece| self.piece_is_wanted(*piece) && !self.has_piece(*piece))
            .map(|piece| self.count_missing_bytes_in_piece(piece))
            .sum()
    }

    /// Whether every wanted piece is complete.
    pub fn is_done(&self) -> bool {
        self.left_until_done() == 0
    }

    /// Whether we have every piece, wanted or not.
    pub fn is_seed(&self) -> bool {
        self.have_pieces.has_all()
    }

    /// Whether metainfo is available (false for magnet links until fetched).
    pub fn has_metainfo(&self) -> bool {
        self.has_metainfo
    }

    /// Marks metainfo as available.
    pub fn set_has_metainfo(&mut self, has_metainfo: bool) {
        self.has_metainfo = has_metainfo;
    }

    /// Whether the torrent is running.
    pub fn is_running(&self) -> bool {
        self.is_running
    }

    /// Whether the torrent waits in the start queue.
    pub fn is_queued(&self) -> bool {
        self.is_queued
    }

    /// Puts the torrent in the start queue.
    pub fn set_queued(&mut self, queued: bool) {
        self.is_queued = queued;
    }

    /// Starts the torrent, leaving any queue.
    pub fn start(&mut self, now_secs: u64) {
        self.is_running = true;
        self.is_queued = false;
        self.start_date = now_secs;
    }

    /// Stops the torrent.
    pub fn stop(&mut self) {
        self.is_running = false;
    }

    /// Whether the torrent started within the recent-start window.
    pub fn recently_started(&self, now_secs: u64) -> bool {
        now_secs.saturating_sub(self.start_date) < RECENTLY_STARTED_SECS
    }

    /// Wall-clock second the torrent last started.
    pub fn start_date(&self) -> u64 {
        self.start_date
    }

    /// Whether the torrent forbids DHT/PEX/LPD discovery.
    pub fn is_private(&self) -> bool {
        self.is_private
    }

    /// Whether peer exchange may run for this torrent.
    pub fn allows_pex(&self) -> bool {
        self.pex_enabled && !self.is_private
    }

    /// Enables or disables peer exchange (session-level toggle).
    pub fn set_pex_enabled(&mut self, enabled: bool) {
        self.pex_enabled = enabled;
    }

    /// Maximum peers for this torrent's swarm.
    pub fn peer_limit(&self) -> usize {
        self.peer_limit
    }

    /// Torrent scheduling priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Whether pieces are picked in order rather than rarest-first.
    pub fn sequential_download(&self) -> bool {
        self.sequential_download
    }

    /// Whether we may upload piece data right now.
    pub fn client_can_upload(&self) -> bool {
        self.is_running && self.upload_enabled
    }

    /// Whether we may download piece data right now.
    pub fn client_can_download(&self) -> bool {
        self.is_running && self.download_enabled && !self.is_done()
    }

    /// Webseed URLs from the metainfo.
    pub fn webseed_urls(&self) -> &[String] {
        &self.webseed_urls
    }

    /// Replaces the webseed URL list (metainfo update).
    pub fn set_webseed_urls(&mut self, urls: Vec<String>) {
        self.webseed_urls = urls;
    }

    /// Torrent-scope bandwidth ledger.
    pub fn bandwidth_mut(&mut self) -> &mut Bandwidth {
        &mut self.bandwidth
    }

    /// Credits downloaded payload bytes.
    pub fn add_downloaded(&mut self, now_secs: u64, bytes: u64) {
        self.downloaded += bytes;
        self.date_active = now_secs;
    }

    /// Credits uploaded payload bytes.
    pub fn add_uploaded(&mut self, now_secs: u64, bytes: u64) {
        self.uploaded += bytes;
        self.date_active = now_secs;
    }

    /// Credits corrupt bytes (failed verification).
    pub fn add_corrupt(&mut self, bytes: u64) {
        self.corrupt += bytes;
    }

    /// Total payload bytes downloaded this session.
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Total payload bytes uploaded this session.
    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    /// Total corrupt bytes discarded this session.
    pub fn corrupt(&self) -> u64 {
        self.corrupt
    }

    /// Whether the configured seed ratio has been reached.
    pub fn seed_limit_reached(&self) -> bool {
        let Some(limit) = self.seed_ratio_limit else {
            return false;
        };
        if !self.is_done() {
            return false;
        }
        let baseline = self.total_size.max(1);
        self.uploaded as f64 / baseline as f64 >= limit
    }

    /// Periodic housekeeping driven from the bandwidth pulse.
    pub fn do_idle_work(&mut self, now_msec: u64) {
        self.bandwidth.allocate(now_msec, 0);
    }
}

/// Builder for [`Torrent`] collaborator instances.
#[derive(Debug)]
pub struct TorrentBuilder {
    info_hash: InfoHash,
    total_size: u64,
    piece_size: u32,
    is_private: bool,
    pex_enabled: bool,
    has_metainfo: bool,
    peer_limit: usize,
    priority: Priority,
    sequential_download: bool,
    seed_ratio_limit: Option<f64>,
    webseed_urls: Vec<String>,
    all_pieces: bool,
}

impl TorrentBuilder {
    /// Starts a builder for a torrent of `total_size` bytes in pieces of
    /// `piece_size` bytes. Piece size must be a multiple of the block size.
    pub fn new(info_hash: InfoHash, total_size: u64, piece_size: u32) -> Self {
        debug_assert!(piece_size > 0 && piece_size % BLOCK_SIZE == 0);
        Self {
            info_hash,
            total_size,
            piece_size,
            is_private: false,
            pex_enabled: true,
            has_metainfo: true,
            peer_limit: 50,
            priority: Priority::Normal,
            sequential_download: false,
            seed_ratio_limit: None,
            webseed_urls: Vec::new(),
            all_pieces: false,
        }
    }

    /// Marks the torrent private.
    pub fn private(mut self, is_private: bool) -> Self {
        self.is_private = is_private;
        self
    }

    /// Enables or disables peer exchange.
    pub fn pex_enabled(mut self, enabled: bool) -> Self {
        self.pex_enabled = enabled;
        self
    }

    /// Marks metainfo availability.
    pub fn has_metainfo(mut self, has_metainfo: bool) -> Self {
        self.has_metainfo = has_metainfo;
        self
    }

    /// Sets the per-swarm peer limit.
    pub fn peer_limit(mut self, limit: usize) -> Self {
        self.peer_limit = limit;
        self
    }

    /// Sets the torrent priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Enables sequential piece picking.
    pub fn sequential_download(mut self, sequential: bool) -> Self {
        self.sequential_download = sequential;
        self
    }

    /// Sets the stop-seeding ratio.
    pub fn seed_ratio_limit(mut self, limit: Option<f64>) -> Self {
        self.seed_ratio_limit = limit;
        self
    }

    /// Sets the webseed URL list.
    pub fn webseed_urls(mut self, urls: Vec<String>) -> Self {
        self.webseed_urls = urls;
        self
    }

    /// Starts with every piece already owned (a seed).
    pub fn with_all_pieces(mut self) -> Self {
        self.all_pieces = true;
        self
    }

    /// Builds the torrent under the given session id.
    pub fn build(self, id: TorrentId) -> Torrent {
        let piece_count = self.total_size.div_ceil(u64::from(self.piece_size)) as u32;
        let block_count = self.total_size.div_ceil(u64::from(BLOCK_SIZE));

        let have_pieces = if self.all_pieces {
            Bitfield::new_full(piece_count)
        } else {
            Bitfield::new(piece_count)
        };

        Torrent {
            id,
            info_hash: self.info_hash,
            total_size: self.total_size,
            piece_size: self.piece_size,
            piece_count,
            block_count,
            have_pieces,
            have_blocks: vec![self.all_pieces; block_count as usize],
            wanted: vec![true; piece_count as usize],
            piece_priorities: vec![Priority::Normal; piece_count as usize],
            sequential_download: self.sequential_download,
            is_private: self.is_private,
            pex_enabled: self.pex_enabled,
            has_metainfo: self.has_metainfo,
            peer_limit: self.peer_limit,
            priority: self.priority,
            is_running: false,
            is_queued: false,
            upload_enabled: true,
            download_enabled: true,
            start_date: 0,
            date_active: 0,
            downloaded: 0,
            uploaded: 0,
            corrupt: 0,
            seed_ratio_limit: self.seed_ratio_limit,
            webseed_urls: self.webseed_urls,
            bandwidth: Bandwidth::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_torrent(total_size: u64, piece_size: u32) -> Torrent {
        TorrentBuilder::new(InfoHash::new([7u8; 20]), total_size, piece_size)
            .build(TorrentId(1))
    }

    #[test]
    fn test_geometry() {
        // 5 pieces of 32 KiB, final piece 8 KiB
        let tor = test_torrent(4 * 32 * 1024 + 8 * 1024, 32 * 1024);
        assert_eq!(tor.piece_count(), 5);
        assert_eq!(tor.block_count(), 9);
        assert_eq!(tor.piece_size_bytes(PieceIndex(0)), 32 * 1024);
        assert_eq!(tor.piece_size_bytes(PieceIndex(4)), 8 * 1024);

        let span = tor.block_span_for_piece(PieceIndex(4));
        assert_eq!(span.begin, BlockIndex(8));
        assert_eq!(span.end, BlockIndex(9));
        assert_eq!(tor.block_size_bytes(BlockIndex(8)), 8 * 1024);
        assert_eq!(tor.block_at(PieceIndex(1), 16 * 1024), BlockIndex(3));
    }

    #[test]
    fn test_block_completion_finishes_piece() {
        let mut tor = test_torrent(64 * 1024, 32 * 1024);

        assert_eq!(tor.got_block(BlockIndex(0)), None);
        assert_eq!(tor.got_block(BlockIndex(1)), Some(PieceIndex(0)));
        assert!(tor.has_piece(PieceIndex(0)));

        // duplicate block reports nothing
        assert_eq!(tor.got_block(BlockIndex(1)), None);
    }

    #[test]
    fn test_invalidate_piece() {
        let mut tor = test_torrent(64 * 1024, 32 * 1024);
        tor.got_block(BlockIndex(0));
        tor.got_block(BlockIndex(1));
        assert!(tor.has_piece(PieceIndex(0)));

        tor.invalidate_piece(PieceIndex(0));
        assert!(!tor.has_piece(PieceIndex(0)));
        assert!(!tor.has_block(BlockIndex(0)));
        assert_eq!(tor.count_missing_blocks_in_piece(PieceIndex(0)), 2);
    }

    #[test]
    fn test_left_until_done_respects_wanted() {
        let mut tor = test_torrent(64 * 1024, 32 * 1024);
        assert_eq!(tor.left_until_done(), 64 * 1024);

        tor.set_piece_wanted(PieceIndex(1), false);
        assert_eq!(tor.left_until_done(), 32 * 1024);

        tor.got_block(BlockIndex(0));
        tor.got_block(BlockIndex(1));
        assert!(tor.is_done());
        assert!(!tor.is_seed());
    }

    #[test]
    fn test_seed_builder() {
        let tor = TorrentBuilder::new(InfoHash::new([1u8; 20]), 96 * 1024, 32 * 1024)
            .with_all_pieces()
            .build(TorrentId(2));
        assert!(tor.is_seed());
        assert!(tor.is_done());
        assert_eq!(tor.left_until_done(), 0);
    }

    #[test]
    fn test_seed_limit() {
        let mut tor = TorrentBuilder::new(InfoHash::new([1u8; 20]), 32 * 1024, 32 * 1024)
            .with_all_pieces()
            .seed_ratio_limit(Some(2.0))
            .build(TorrentId(3));
        assert!(!tor.seed_limit_reached());

        tor.add_uploaded(10, 64 * 1024);
        assert!(tor.seed_limit_reached());
        assert_eq!(tor.uploaded(), 64 * 1024);
    }

    #[test]
    fn test_private_forbids_pex() {
        let tor = TorrentBuilder::new(InfoHash::new([1u8; 20]), 32 * 1024, 32 * 1024)
            .private(true)
            .build(TorrentId(4));
        assert!(tor.is_private());
        assert!(!tor.allows_pex());
    }
}
