//! Piece-selection seam
//!
//! Which blocks to request next is policy that lives outside the manager;
//! the manager hands a mediator view of one (torrent, transfer) pair to a
//! [`Wishlist`] and passes its answer straight through. A first-fit picker
//! ships as the default so the crate works out of the box; embedders with a
//! rarest-first or streaming picker swap it in.

use crate::torrent::{BlockIndex, BlockSpan, PieceIndex, Priority};

/// Read-only view of one (torrent, transfer) pair for piece selection.
pub trait WishlistMediator {
    /// Whether the block is missing and not already requested from this
    /// transfer.
    fn client_can_request_block(&self, block: BlockIndex) -> bool;

    /// Whether the piece is wanted and the transfer has it.
    fn client_can_request_piece(&self, piece: PieceIndex) -> bool;

    /// Whether the swarm is in endgame (duplicate requests allowed).
    fn is_endgame(&self) -> bool;

    /// Outstanding request count for the block across the swarm.
    fn count_active_requests(&self, block: BlockIndex) -> usize;

    /// Missing blocks in the piece.
    fn count_missing_blocks(&self, piece: PieceIndex) -> u64;

    /// Blocks covering the piece.
    fn block_span(&self, piece: PieceIndex) -> BlockSpan;

    /// Total pieces in the torrent.
    fn piece_count(&self) -> u32;

    /// Download priority of the piece.
    fn priority(&self, piece: PieceIndex) -> Priority;

    /// Whether pieces should be picked in index order.
    fn is_sequential_download(&self) -> bool;
}

/// Block-picking policy.
pub trait Wishlist: Send {
    /// Picks up to `numwant` blocks to request, as spans.
    fn next(&mut self, mediator: &dyn WishlistMediator, numwant: usize) -> Vec<BlockSpan>;
}

/// Default picker: pieces in priority order, blocks first-fit.
///
/// Outside endgame a block already requested anywhere in the swarm is
/// skipped; in endgame only blocks already requested from this transfer
/// are skipped, which is what produces duplicate requests.
#[derive(Debug, Default)]
pub struct FirstFitWishlist;

impl FirstFitWishlist {
    /// Creates the picker.
    pub fn new() -> Self {
        Self
    }
}

impl Wishlist for FirstFitWishlist {
    fn next(&mut self, mediator: &dyn WishlistMediator, numwant: usize) -> Vec<BlockSpan> {
        let mut pieces: Vec<PieceIndex> = (0..mediator.piece_count())
            .map(PieceIndex)
            .filter(|piece| {
                mediator.client_can_request_piece(*piece)
                    && mediator.count_missing_blocks(*piece) > 0
            })
            .collect();

        if mediator.is_sequential_download() {
            pieces.sort_by_key(|piece| (priority_rank(mediator.priority(*piece)), piece.as_u32()));
        } else {
            // fewest missing blocks first finishes pieces sooner
            pieces.sort_by_key(|piece| {
                (
                    priority_rank(mediator.priority(*piece)),
                    mediator.count_missing_blocks(*piece),
                    piece.as_u32(),
                )
            });
        }

        let endgame = mediator.is_endgame();
        let mut spans: Vec<BlockSpan> = Vec::new();
        let mut picked = 0usize;

        'pieces: for piece in pieces {
            for block in mediator.block_span(piece).iter() {
                if picked >= numwant {
                    break 'pieces;
                }
                if !mediator.client_can_request_block(block) {
                    continue;
                }
                if !endgame && mediator.count_active_requests(block) > 0 {
                    continue;
                }
                push_block(&mut spans, block);
                picked += 1;
            }
        }

        spans
    }
}

fn priority_rank(priority: Priority) -> u8 {
    match priority {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    }
}

fn push_block(spans: &mut Vec<BlockSpan>, block: BlockIndex) {
    if let Some(last) = spans.last_mut() {
        if last.end == block {
            last.end = BlockIndex(block.as_u64() + 1);
            return;
        }
    }
    spans.push(BlockSpan::new(block, BlockIndex(block.as_u64() + 1)));
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    struct FakeMediator {
        piece_count: u32,
        blocks_per_piece: u64,
        endgame: bool,
        sequential: bool,
        requestable_pieces: HashSet<u32>,
        requested_elsewhere: HashSet<u64>,
        requested_from_us: HashSet<u64>,
        high_priority: HashSet<u32>,
    }

    impl FakeMediator {
        fn new(piece_count: u32, blocks_per_piece: u64) -> Self {
            Self {
                piece_count,
                blocks_per_piece,
                endgame: false,
                sequential: true,
                requestable_pieces: (0..piece_count).collect(),
                requested_elsewhere: HashSet::new(),
                requested_from_us: HashSet::new(),
                high_priority: HashSet::new(),
            }
        }
    }

    impl WishlistMediator for FakeMediator {
        fn client_can_request_block(&self, block: BlockIndex) -> bool {
            !self.requested_from_us.contains(&block.as_u64())
        }

        fn client_can_request_piece(&self, piece: PieceIndex) -> bool {
            self.requestable_pieces.contains(&piece.as_u32())
        }

        fn is_endgame(&self) -> bool {
            self.endgame
        }

        fn count_active_requests(&self, block: BlockIndex) -> usize {
            usize::from(self.requested_elsewhere.contains(&block.as_u64()))
        }

        fn count_missing_blocks(&self, _piece: PieceIndex) -> u64 {
            self.blocks_per_piece
        }

        fn block_span(&self, piece: PieceIndex) -> BlockSpan {
            let begin = u64::from(piece.as_u32()) * self.blocks_per_piece;
            BlockSpan::new(BlockIndex(begin), BlockIndex(begin + self.blocks_per_piece))
        }

        fn piece_count(&self) -> u32 {
            self.piece_count
        }

        fn priority(&self, piece: PieceIndex) -> Priority {
            if self.high_priority.contains(&piece.as_u32()) {
                Priority::High
            } else {
                Priority::Normal
            }
        }

        fn is_sequential_download(&self) -> bool {
            self.sequential
        }
    }

    #[test]
    fn test_picks_contiguous_spans() {
        let mediator = FakeMediator::new(2, 4);
        let spans = FirstFitWishlist::new().next(&mediator, 6);

        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0], BlockSpan::new(BlockIndex(0), BlockIndex(6)));
    }

    #[test]
    fn test_skips_blocks_requested_elsewhere() {
        let mut mediator = FakeMediator::new(1, 4);
        mediator.requested_elsewhere.insert(1);

        let spans = FirstFitWishlist::new().next(&mediator, 4);
        let blocks: Vec<u64> = spans
            .iter()
            .flat_map(BlockSpan::iter)
            .map(BlockIndex::as_u64)
            .collect();
        assert_eq!(blocks, vec![0, 2, 3]);
    }

    #[test]
    fn test_endgame_allows_duplicates() {
        let mut mediator = FakeMediator::new(1, 4);
        mediator.endgame = true;
        mediator.requested_elsewhere.insert(1);
        mediator.requested_from_us.insert(2);

        let spans = FirstFitWishlist::new().next(&mediator, 4);
        let blocks: Vec<u64> = spans
            .iter()
            .flat_map(BlockSpan::iter)
            .map(BlockIndex::as_u64)
            .collect();
        // block 1 is duplicated, block 2 (ours already) is not
        assert_eq!(blocks, vec![0, 1, 3]);
    }

    #[test]
    fn test_priority_pieces_first() {
        let mut mediator = FakeMediator::new(3, 2);
        mediator.high_priority.insert(2);

        let spans = FirstFitWishlist::new().next(&mediator, 2);
        assert_eq!(spans[0], BlockSpan::new(BlockIndex(4), BlockIndex(6)));
    }

    #[test]
    fn test_respects_numwant() {
        let mediator = FakeMediator::new(4, 4);
        let spans = FirstFitWishlist::new().next(&mediator, 3);
        let total: u64 = spans.iter().map(BlockSpan::len).sum();
        assert_eq!(total, 3);
    }
}
