//! The block manager.
//!
//! Carves the contiguous heap reservation into regions (runs of blocks)
//! and serves region allocations. Free regions of 1..=4 blocks live on
//! quick-lists indexed by size; larger regions live on an ordered
//! list-of-lists whose list headers are themselves block headers in the
//! `ListHeader` state. The contiguous suffix of never-allocated blocks is
//! the wilderness and is allocated by pointer bump. All operations are
//! serialized by a single monitor.
//!
//! Freeing coalesces with the left neighbour, then either grows the
//! wilderness or coalesces with the right neighbour before reinsertion.
//! The last block of every multi-block free region carries the negated
//! region size so a right neighbour can find the region head.

use std::sync::Mutex;

use crate::heap::block::*;
use crate::util::constants::*;
use crate::util::conversions::bytes_to_blocks_up;
use crate::util::{memory, Address};

/// Region sizes below this are served from quick-lists.
pub const N_QUICK_LISTS: usize = 5;

pub struct BlockManager {
    sync: Mutex<BlockManagerSync>,
}

struct BlockManagerSync {
    quick: [Option<Block>; N_QUICK_LISTS],
    /// First block never yet allocated.
    wilderness: Address,
    heap_top: Address,
    n_wilderness: usize,
    n_lists: usize,
    n_allocated: usize,
}

impl BlockManager {
    /// Reserve and commit a heap of `heap_mb` megabytes and set up the
    /// header table.
    pub fn new(heap_mb: usize) -> BlockManager {
        assert!(heap_mb > 0 && heap_mb < (1 << LOG_BYTES_IN_BLOCK), "bad heap size");
        let heap_size = heap_mb << LOG_BYTES_IN_MBYTE as usize;
        let raw = memory::reserve(Address::ZERO, heap_size + BYTES_IN_BLOCK)
            .unwrap_or_else(|e| panic!("failed to reserve {} MB heap: {}", heap_mb, e));
        let start = raw.align_up(BYTES_IN_BLOCK);
        memory::commit(start, heap_size).expect("failed to commit heap");

        let n_blocks = heap_size >> LOG_BYTES_IN_BLOCK as usize;
        init_header_table(start, n_blocks);

        info!(
            "heap [{} ... {}], {} blocks",
            start,
            start + heap_size,
            n_blocks
        );

        BlockManager {
            sync: Mutex::new(BlockManagerSync {
                quick: [None; N_QUICK_LISTS],
                wilderness: start,
                heap_top: start + heap_size,
                n_wilderness: n_blocks,
                n_lists: 0,
                n_allocated: 0,
            }),
        }
    }

    /// Allocate one block for the chunk manager. The returned block is in
    /// the `Chunking` state.
    pub fn alloc_block(&self) -> Option<Block> {
        let mut s = self.sync.lock().unwrap();
        let b = s.alloc_region(1)?;
        b.reset_state(BlockState::Chunking);
        Some(b)
    }

    /// Allocate a region of `⌈nbytes / block size⌉` blocks for a big
    /// object. The head (and tail) blocks are stamped `Big`; the head
    /// carries `alloc_in_progress` until the creating mutator has logged
    /// the new handle.
    pub fn alloc_region(&self, nbytes: usize) -> Option<Block> {
        let n_blocks = bytes_to_blocks_up(nbytes);
        let head = {
            let mut s = self.sync.lock().unwrap();
            let head = s.alloc_region(n_blocks)?;
            let last = head.forward(n_blocks - 1);
            last.set_blob_size(n_blocks);
            last.reset_state(BlockState::Big);
            // The in-progress flag and size must be visible before the
            // status flips to `Big`, or a concurrent sweep could reclaim
            // the region before the handle is logged.
            head.set_alloc_in_progress(true);
            head.set_blob_size(n_blocks);
            head.reset_state(BlockState::Big);
            head
        };

        #[cfg(debug_assertions)]
        for i in 1..n_blocks.saturating_sub(1) {
            head.forward(i).set_big_interior(head);
        }

        Some(head)
    }

    /// Return a single chunked block, as freed by the recycled-lists
    /// flush.
    pub fn free_chunked_block(&self, b: Block) {
        debug_assert!(matches!(
            b.state(),
            BlockState::Exhausted | BlockState::Partial
        ));
        let mut s = self.sync.lock().unwrap();
        s.free_region(b, 1);
    }

    /// Return a batch of chunked blocks already marked `Dummy` by the
    /// observed-full flush.
    pub fn free_chunked_blocks(&self, blocks: &[Block]) {
        let mut s = self.sync.lock().unwrap();
        for &b in blocks {
            debug_assert_eq!(b.state(), BlockState::Dummy);
            s.free_region(b, 1);
        }
    }

    /// Return a whole big-object region.
    pub fn free_big_region(&self, head: Block) {
        let sz = head.blob_size();
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(head.state(), BlockState::Big);
            debug_assert!(!head.alloc_in_progress());
            let last = head.forward(sz - 1);
            debug_assert_eq!(last.state(), BlockState::Big);
            debug_assert!(sz == 1 || last.blob_size() == sz);
            for i in 1..sz - 1 {
                let inter = head.forward(i);
                debug_assert_eq!(inter.state(), BlockState::BigInterior);
                debug_assert_eq!(inter.big_interior_head(), head);
            }
        }
        let mut s = self.sync.lock().unwrap();
        s.free_region(head, sz);
    }

    /// The number of blocks considered available for trigger arithmetic:
    /// all wilderness blocks plus a configured share of list-held blocks.
    pub fn free_blocks(&self, list_blk_worth: usize) -> usize {
        let s = self.sync.lock().unwrap();
        s.n_lists * list_blk_worth / 100 + s.n_wilderness
    }

    /// (wilderness, list-held, allocated) block counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        let s = self.sync.lock().unwrap();
        (s.n_wilderness, s.n_lists, s.n_allocated)
    }

    pub fn total_blocks(&self) -> usize {
        heap_blocks()
    }

    /// The first never-allocated block; the linear sweep walks headers up
    /// to here.
    pub fn wilderness_start(&self) -> Address {
        self.sync.lock().unwrap().wilderness
    }
}

impl BlockManagerSync {
    fn alloc_region(&mut self, n_blocks: usize) -> Option<Block> {
        if n_blocks < N_QUICK_LISTS {
            if let Some(b) = self.alloc_from_quick_lists(n_blocks) {
                self.n_allocated += n_blocks;
                self.n_lists -= n_blocks;
                return Some(b);
            }
        }
        if let Some(b) = self.alloc_from_region_lists(n_blocks) {
            self.n_allocated += n_blocks;
            self.n_lists -= n_blocks;
            return Some(b);
        }
        let b = self.alloc_from_wilderness(n_blocks)?;
        self.n_allocated += n_blocks;
        self.n_wilderness -= n_blocks;
        Some(b)
    }

    fn alloc_from_wilderness(&mut self, n_blocks: usize) -> Option<Block> {
        let base = self.wilderness;
        let target = base + n_blocks * BYTES_IN_BLOCK;
        if target > self.heap_top {
            return None;
        }
        self.wilderness = target;
        Some(Block::from_aligned_address(base))
    }

    /// Find the first non-empty quick list of size at least `sz` and take
    /// its first element, reinserting any leftover.
    fn alloc_from_quick_lists(&mut self, sz: usize) -> Option<Block> {
        let found = (sz..N_QUICK_LISTS).find(|&i| self.quick[i].is_some())?;
        let b = self.quick[found].unwrap();
        let next = b.next_region();
        if let Some(n) = next {
            n.set_prev_region(PrevRef::Head(found));
        }
        self.quick[found] = next;
        if sz != found {
            self.insert_into_quick_lists(b.forward(sz), found - sz);
        }
        Some(b)
    }

    /// Best fit from the list-of-lists: the first list of sufficient
    /// size. Prefer an element after the header; otherwise extract the
    /// header itself. Leftover is reinserted.
    fn alloc_from_region_lists(&mut self, sz: usize) -> Option<Block> {
        let mut list = list_next_of(region_lists_root());
        let (p_list, region_size) = loop {
            let l = list?;
            let region_size = l.region_size() as usize;
            if sz <= region_size {
                break (l, region_size);
            }
            list = l.next_list();
        };

        let b = if let Some(region) = p_list.first_region() {
            let next = region.next_region();
            if let Some(n) = next {
                n.set_prev_region(PrevRef::Block(p_list));
            }
            p_list.set_first_region(next);
            region
        } else {
            self.extract_from_list_of_lists(p_list);
            p_list
        };

        let leftover = region_size - sz;
        if leftover >= N_QUICK_LISTS {
            self.insert_into_region_lists(b.forward(sz), leftover);
        } else if leftover >= 1 {
            self.insert_into_quick_lists(b.forward(sz), leftover);
        }
        Some(b)
    }

    /// Free a region: coalesce left, grow the wilderness if now adjacent,
    /// else coalesce right and reinsert.
    fn free_region(&mut self, block: Block, sz: usize) {
        self.n_allocated -= sz;

        let (block, sz) = self.try_extract_left_nbr(block, sz);

        if block.start() + sz * BYTES_IN_BLOCK == self.wilderness {
            self.wilderness = block.start();
            self.n_wilderness += sz;
            return;
        }

        let sz = self.try_extract_right_nbr(block, sz);

        self.n_lists += sz;
        if sz < N_QUICK_LISTS {
            self.insert_into_quick_lists(block, sz);
        } else {
            self.insert_into_region_lists(block, sz);
        }
    }

    /// If the region to the right is in the block manager's hands,
    /// extract it and return the grown size.
    fn try_extract_right_nbr(&mut self, block: Block, sz: usize) -> usize {
        let nbr_index = block.index() + sz;
        if nbr_index > heap_blocks() {
            return sz;
        }
        let nbr = Block::from_index(nbr_index);
        match nbr.state() {
            BlockState::Free => {
                let size = nbr.region_size() as usize;
                debug_assert!(size >= 1);
                self.extract_from_region_list(nbr);
                self.n_lists -= size;
                sz + size
            }
            BlockState::ListHeader => {
                let size = nbr.region_size() as usize;
                self.extract_from_list_of_lists(nbr);
                self.n_lists -= size;
                sz + size
            }
            _ => sz,
        }
    }

    /// If the region ending right before `block` is in the block
    /// manager's hands, extract it and return the grown (block, size).
    fn try_extract_left_nbr(&mut self, block: Block, sz: usize) -> (Block, usize) {
        let nbr_index = block.index() - 1;
        if nbr_index == GUARD_LOW {
            return (block, sz);
        }
        let nbr = Block::from_index(nbr_index);
        // The last block of a multi-block list-held region is marked
        // `Free` even when the region head is a list header.
        if nbr.state() != BlockState::Free {
            return (block, sz);
        }
        let raw = nbr.region_size();
        let size = if raw == 1 { 1 } else { (-raw) as usize };
        debug_assert!(size >= 1);
        let first = Block::from_index(nbr_index + 1 - size);
        debug_assert_eq!(first.region_size(), size as isize);
        match first.state() {
            BlockState::Free => self.extract_from_region_list(first),
            BlockState::ListHeader => self.extract_from_list_of_lists(first),
            s => unreachable!("left neighbour head in state {:?}", s),
        }
        self.n_lists -= size;
        (first, sz + size)
    }

    /// Unlink a region that is not a list header from whatever list it is
    /// on.
    fn extract_from_region_list(&mut self, b: Block) {
        let next = b.next_region();
        match b.prev_region() {
            PrevRef::Head(idx) => self.quick[idx] = next,
            // Writing through a predecessor block works whether it is a
            // free region (next-region) or a list header (first-region):
            // the fields alias.
            PrevRef::Block(p) => p.set_next_region(next),
        }
        if let Some(n) = next {
            n.set_prev_region(b.prev_region());
        }
    }

    /// Unlink a list header from the list-of-lists, promoting its first
    /// region to header if the list is non-empty.
    fn extract_from_list_of_lists(&mut self, ph: Block) {
        let prev_idx = ph.prev_list();
        if let Some(new_header) = ph.first_region() {
            let sz = new_header.region_size();
            new_header.set_prev_list(prev_idx);
            new_header.set_next_list(ph.next_list());
            set_list_next_of(prev_idx, Some(new_header));
            if let Some(nl) = new_header.next_list() {
                nl.set_prev_list(new_header.index());
            }
            new_header.reset_state(BlockState::ListHeader);
            new_header.set_prev_list(prev_idx);
            new_header.set_region_size(sz);
        } else {
            set_list_next_of(prev_idx, ph.next_list());
            if let Some(nl) = ph.next_list() {
                nl.set_prev_list(prev_idx);
            }
        }
    }

    /// Insert a region into its quick list. No coalescing is attempted
    /// nor applicable. The limiting blocks get their sizes set.
    fn insert_into_quick_lists(&mut self, b: Block, sz: usize) {
        debug_assert!(sz >= 1 && sz < N_QUICK_LISTS);
        b.reset_state(BlockState::Free);
        b.set_region_size(sz as isize);
        if sz > 1 {
            let last = b.forward(sz - 1);
            last.reset_state(BlockState::Free);
            last.set_region_size(-(sz as isize));
        }
        b.set_next_region(self.quick[sz]);
        if let Some(n) = self.quick[sz] {
            n.set_prev_region(PrevRef::Block(b));
        }
        b.set_prev_region(PrevRef::Head(sz));
        self.quick[sz] = Some(b);
    }

    /// Insert a region into the ordered list-of-lists: join the list of
    /// its exact size, or become a new list header between the nearest
    /// sizes.
    fn insert_into_region_lists(&mut self, b: Block, sz: usize) {
        debug_assert!(sz >= N_QUICK_LISTS);
        let last = b.forward(sz - 1);
        last.reset_state(BlockState::Free);
        last.set_region_size(-(sz as isize));

        let mut prev_idx = region_lists_root();
        let mut list = list_next_of(prev_idx);
        let mut matched = None;
        while let Some(l) = list {
            let region_size = l.region_size() as usize;
            if sz <= region_size {
                if sz == region_size {
                    matched = Some(l);
                }
                break;
            }
            prev_idx = l.index();
            list = l.next_list();
        }

        if let Some(p_list) = matched {
            // Perfect match: become the list's first region.
            b.reset_state(BlockState::Free);
            b.set_region_size(sz as isize);
            b.set_next_region(p_list.first_region());
            b.set_prev_region(PrevRef::Block(p_list));
            if let Some(first) = p_list.first_region() {
                first.set_prev_region(PrevRef::Block(b));
            }
            p_list.set_first_region(Some(b));
            return;
        }

        // Create a new, empty list between prev_idx and `list`.
        b.reset_state(BlockState::ListHeader);
        b.set_region_size(sz as isize);
        b.set_first_region(None);
        b.set_prev_list(prev_idx);
        b.set_next_list(list);
        set_list_next_of(prev_idx, Some(b));
        if let Some(l) = list {
            l.set_prev_list(b.index());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::with_fixture;

    fn assert_accounting(bm: &BlockManager) {
        let (w, l, a) = bm.counts();
        assert_eq!(w + l + a, bm.total_blocks());
    }

    #[test]
    fn block_accounting_identity() {
        with_fixture(|fx| {
            let bm = fx.heap.block_manager();
            assert_accounting(bm);
            let b = bm.alloc_block().unwrap();
            assert_eq!(b.state(), BlockState::Chunking);
            assert_accounting(bm);
            b.init_owned(0);
            b.set_state(BlockState::Exhausted);
            bm.free_chunked_block(b);
            assert_accounting(bm);
        });
    }

    /// Allocate a contiguous run of big regions of the given block
    /// counts. Earlier tests leave arbitrary regions on the free lists,
    /// so the first tries may land anywhere; once the lists run dry the
    /// wilderness serves consecutive runs. Non-adjacent tries are parked
    /// and returned afterwards.
    fn alloc_adjacent_run(bm: &BlockManager, sizes: &[usize]) -> Vec<Block> {
        let mut parked = Vec::new();
        let run = loop {
            let mut run = Vec::with_capacity(sizes.len());
            for &sz in sizes {
                let b = bm.alloc_region(sz * BYTES_IN_BLOCK).unwrap();
                b.set_alloc_in_progress(false);
                run.push(b);
            }
            let mut expect = run[0].index();
            let mut adjacent = true;
            for (b, &sz) in run.iter().zip(sizes) {
                if b.index() != expect {
                    adjacent = false;
                    break;
                }
                expect += sz;
            }
            if adjacent {
                break run;
            }
            parked.append(&mut run);
        };
        for region in parked {
            bm.free_big_region(region);
        }
        run
    }

    #[test]
    fn region_free_coalesces_with_neighbours() {
        with_fixture(|fx| {
            let bm = fx.heap.block_manager();
            // guard | head(4) | right(2) | guard: the guards pin the run
            // away from foreign free regions and the wilderness.
            let run = alloc_adjacent_run(bm, &[1, 4, 2, 1]);
            let (guard_lo, head, right, guard_hi) = (run[0], run[1], run[2], run[3]);
            assert_eq!(head.state(), BlockState::Big);
            assert_eq!(head.blob_size(), 4);

            bm.free_big_region(head);
            assert_eq!(head.region_size(), 4);
            // The tail block carries the negated size for left-coalescing.
            assert_eq!(head.forward(3).region_size(), -4);
            assert_accounting(bm);

            // Freeing the right region coalesces leftwards into one
            // 6-block region headed by `head`.
            bm.free_big_region(right);
            assert_eq!(head.region_size(), 6);
            assert_eq!(head.forward(5).region_size(), -6);
            assert_accounting(bm);

            bm.free_big_region(guard_lo);
            bm.free_big_region(guard_hi);
            assert_accounting(bm);
        });
    }

    #[test]
    fn quick_list_split_reinserts_leftover() {
        with_fixture(|fx| {
            let bm = fx.heap.block_manager();
            let run = alloc_adjacent_run(bm, &[1, 3, 1]);
            let (guard_lo, head, guard_hi) = (run[0], run[1], run[2]);
            bm.free_big_region(head);
            assert_eq!(head.region_size(), 3);

            // Taking a 2-block region from the freed run must split it
            // and reinsert the 1-block leftover. Best-fit may pick some
            // other run first; drain until ours is hit.
            let mut taken = Vec::new();
            loop {
                let two = bm.alloc_region(2 * BYTES_IN_BLOCK).unwrap();
                two.set_alloc_in_progress(false);
                taken.push(two);
                if two.index() == head.index() {
                    break;
                }
            }
            let leftover = head.forward(2);
            assert_eq!(leftover.state(), BlockState::Free);
            assert_eq!(leftover.region_size(), 1);

            for region in taken {
                bm.free_big_region(region);
            }
            bm.free_big_region(guard_lo);
            bm.free_big_region(guard_hi);
            assert_accounting(bm);
        });
    }
}
