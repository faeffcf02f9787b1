//! The chunk manager: size-class allocation atop blocks.
//!
//! Mutators allocate by popping the head of a thread-local allocation
//! list; the slow path pulls a block from the global partial list of the
//! bin or a fresh block from the block manager. The collector returns
//! freed chunks through the recycled-lists cache (RLC), a direct-mapped
//! table batching frees per block until a conflicting block evicts the
//! entry and the batch is merged into the block's free list.
//!
//! Free lists and recycled lists are circular, with the head element
//! holding the element count; allocation lists are linear and end with
//! [`ALLOC_LIST_SENTINEL`]. A chunk's list link occupies the same word as
//! a live handle's log pointer, which is what lets handle validation
//! reject free chunks.

use spin::Mutex as SpinMutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::heap::block::{Block, BlockState, PrevRef};
use crate::heap::block_manager::BlockManager;
use crate::heap::size_class::{BIN_SIZE, N_BINS, SIZE_CLASSES};
use crate::util::constants::*;
use crate::util::{Address, Handle};

/// Terminates every allocation list. Not 8-byte aligned, so it can never
/// be mistaken for a handle or a log position.
pub const ALLOC_LIST_SENTINEL: usize = usize::MAX;

/// One block of recycled-lists cache coverage per this many heap blocks.
const RLC_RATIO: usize = 10;
const MIN_RLC_ENTRIES: usize = 117;

/// Thresholds for evacuating fully-free partial blocks back to the block
/// manager.
const MAX_OBSERVED_FULL_PER_LIST: usize = 2;
const MAX_OBSERVED_FULL: usize = 4;

/// A free chunk viewed as a list cell: the element count in word 0 (only
/// meaningful on a list head) and the link in word 2, aliasing the log
/// pointer of a live handle.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FreeCell(Address);

impl FreeCell {
    pub fn at(addr: Address) -> FreeCell {
        debug_assert!(!addr.is_zero());
        FreeCell(addr)
    }

    pub fn addr(self) -> Address {
        self.0
    }

    pub fn count(self) -> usize {
        unsafe { self.0.load::<usize>() }
    }

    pub fn set_count(self, count: usize) {
        unsafe { self.0.store::<usize>(count) }
    }

    pub fn next_raw(self) -> usize {
        unsafe { (self.0 + 2 * BYTES_IN_WORD).load::<usize>() }
    }

    pub fn set_next_raw(self, next: usize) {
        unsafe { (self.0 + 2 * BYTES_IN_WORD).store::<usize>(next) }
    }
}

fn same_block(a: Address, b: Address) -> bool {
    (a.as_usize() ^ b.as_usize()) < BYTES_IN_BLOCK
}

/// A per-mutator allocation list for one bin.
pub struct AllocList {
    head: usize,
    pub(crate) block: Option<Block>,
    bin: usize,
}

impl AllocList {
    pub fn new(bin: usize) -> AllocList {
        AllocList {
            head: ALLOC_LIST_SENTINEL,
            block: None,
            bin,
        }
    }

    pub fn bin(&self) -> usize {
        self.bin
    }

    /// The inline fast path: pop the list head.
    pub fn pop(&mut self) -> Option<Address> {
        if self.head == ALLOC_LIST_SENTINEL {
            return None;
        }
        let cell = FreeCell::at(unsafe { Address::from_usize(self.head) });
        self.head = cell.next_raw();
        Some(cell.addr())
    }
}

struct PartialInner {
    first: Option<Block>,
    observed_full: [Option<Block>; MAX_OBSERVED_FULL_PER_LIST],
    n_observed: usize,
}

/// A partial list: blocks of one bin with free chunks, guarded by its
/// own spinlock, plus the bin's observed-full remembered set.
struct PartialList {
    inner: SpinMutex<PartialInner>,
    n_blocks: AtomicUsize,
}

impl PartialList {
    fn new() -> PartialList {
        PartialList {
            inner: SpinMutex::new(PartialInner {
                first: None,
                observed_full: [None; MAX_OBSERVED_FULL_PER_LIST],
                n_observed: 0,
            }),
            n_blocks: AtomicUsize::new(0),
        }
    }
}

/// The recycled-lists cache. Only the collector touches it; the lock is
/// for form, never contended.
struct RecycledLists {
    entries: Vec<Option<FreeCell>>,
    n_observed_full: usize,
}

pub struct ChunkManager {
    partial: Vec<PartialList>,
    rlc: SpinMutex<RecycledLists>,
}

impl ChunkManager {
    pub fn new(heap_mb: usize) -> ChunkManager {
        let n_blocks = heap_mb << (LOG_BYTES_IN_MBYTE - LOG_BYTES_IN_BLOCK) as usize;
        let n_entries = std::cmp::max(n_blocks / RLC_RATIO, MIN_RLC_ENTRIES);
        ChunkManager {
            partial: (0..N_BINS).map(|_| PartialList::new()).collect(),
            rlc: SpinMutex::new(RecycledLists {
                entries: vec![None; n_entries],
                n_observed_full: 0,
            }),
        }
    }

    /// The allocation slow path. Retries a partial block, then a fresh
    /// block, raising memory pressure in between; `request_sync_gc`
    /// returns false when no collector is available yet. Returns the
    /// chunk address, or `None` for out-of-memory.
    pub fn alloc_small(
        &self,
        blocks: &BlockManager,
        list: &mut AllocList,
        mut request_sync_gc: impl FnMut() -> bool,
    ) -> Option<Address> {
        if let Some(a) = self.alloc_from_owned(list) {
            return Some(a);
        }
        for _ in 0..3 {
            if self.get_partial_block(list) {
                let a = self.alloc_from_owned(list);
                debug_assert!(a.is_some());
                return a;
            }
            if self.get_fresh_block(blocks, list) {
                let a = self.alloc_from_owned(list);
                debug_assert!(a.is_some());
                return a;
            }
            if !request_sync_gc() {
                break;
            }
        }
        None
    }

    /// Allocate from the allocation list or from the free list of the
    /// block it owns. When both are empty the block is abandoned as
    /// `Exhausted` and the mutator detaches from it.
    fn alloc_from_owned(&self, list: &mut AllocList) -> Option<Address> {
        if let Some(a) = list.pop() {
            return Some(a);
        }
        let ph = list.block?;
        ph.lock();
        let free = ph.free_list();
        if !free.is_zero() {
            ph.set_free_list(Address::ZERO);
            ph.unlock();
            // `free` is the circular list's count cell; break the circle
            // and keep the count cell as the list tail.
            let head = FreeCell::at(free);
            let ret = FreeCell::at(unsafe { Address::from_usize(head.next_raw()) });
            head.set_next_raw(ALLOC_LIST_SENTINEL);
            list.head = ret.next_raw();
            return Some(ret.addr());
        }
        ph.set_state(BlockState::Exhausted);
        ph.unlock();
        list.block = None;
        None
    }

    /// Try to take a block from the bin's partial list. While the list
    /// lock is held the block becomes `Owned`, which keeps the collector
    /// from returning it to the block manager.
    fn get_partial_block(&self, list: &mut AllocList) -> bool {
        let plist = &self.partial[list.bin];
        let mut inner = plist.inner.lock();
        let ph = match inner.first {
            Some(ph) => ph,
            None => return false,
        };
        let next = ph.next_partial();
        inner.first = next;
        if let Some(n) = next {
            n.set_prev_partial(PrevRef::Head(list.bin));
        }
        ph.set_state(BlockState::Owned);
        plist.n_blocks.fetch_sub(1, Ordering::Relaxed);
        drop(inner);

        list.block = Some(ph);
        self.steal_free_list(list);
        debug_assert!(list.head != ALLOC_LIST_SENTINEL);
        true
    }

    /// Move every chunk of the owned block's free list onto the
    /// allocation list. Called right after extracting the block from a
    /// partial list, so the free list is known non-empty.
    fn steal_free_list(&self, list: &mut AllocList) {
        let ph = list.block.unwrap();
        debug_assert_eq!(list.bin, ph.bin());
        debug_assert_eq!(ph.state(), BlockState::Owned);

        ph.lock();
        let prev = FreeCell::at(ph.free_list());
        ph.set_free_list(Address::ZERO);
        ph.unlock();

        let head = prev.next_raw();
        prev.set_next_raw(ALLOC_LIST_SENTINEL);
        list.head = head;
    }

    /// Take a fresh block from the block manager and thread it into
    /// chunks of the bin's size.
    fn get_fresh_block(&self, blocks: &BlockManager, list: &mut AllocList) -> bool {
        let ph = match blocks.alloc_block() {
            Some(ph) => ph,
            None => return false,
        };
        let sz = BIN_SIZE[list.bin];
        let count = SIZE_CLASSES.chunks_per_block(list.bin);
        debug_assert!(count >= 2);

        let start = ph.start();
        let mut curr = start;
        for _ in 0..count - 1 {
            let next = curr + sz;
            FreeCell::at(curr).set_next_raw(next.as_usize());
            curr = next;
        }
        FreeCell::at(curr).set_next_raw(ALLOC_LIST_SENTINEL);

        list.head = start.as_usize();
        list.block = Some(ph);
        ph.init_owned(list.bin);
        true
    }

    /// Hand a freed chunk to the recycled-lists cache. Called by the
    /// collector for every reclaimed chunked object.
    pub fn pre_collect(&self, blocks: &BlockManager, chunk: Address) {
        let mut rlc = self.rlc.lock();
        let idx = (chunk >> LOG_BYTES_IN_BLOCK as usize) % rlc.entries.len();
        if let Some(head) = rlc.entries[idx] {
            if same_block(head.addr(), chunk) {
                let cell = FreeCell::at(chunk);
                cell.set_next_raw(head.next_raw());
                head.set_next_raw(chunk.as_usize());
                head.set_count(head.count() + 1);
                return;
            }
            self.flush_list(blocks, &mut rlc, head);
        }
        let cell = FreeCell::at(chunk);
        cell.set_count(1);
        cell.set_next_raw(chunk.as_usize());
        rlc.entries[idx] = Some(cell);
    }

    /// Flush every occupied cache entry. Run at the end of each
    /// reclamation phase.
    pub fn flush_recycled_lists(&self, blocks: &BlockManager) {
        let mut rlc = self.rlc.lock();
        for idx in 0..rlc.entries.len() {
            if let Some(head) = rlc.entries[idx] {
                self.flush_list(blocks, &mut rlc, head);
                rlc.entries[idx] = None;
            }
        }
    }

    /// Merge a recycled list into its block's free list and reconcile
    /// against the block's current state.
    fn flush_list(&self, blocks: &BlockManager, rlc: &mut RecycledLists, recycled: FreeCell) {
        let ph = Block::containing(recycled.addr());
        let n_recycled = recycled.count();
        debug_assert!(n_recycled > 0);

        ph.lock();
        let status = ph.state();
        debug_assert!(matches!(
            status,
            BlockState::Partial | BlockState::Owned | BlockState::Exhausted
        ));
        let free = ph.free_list();
        let (merged, n_free) = if !free.is_zero() {
            let free = FreeCell::at(free);
            let n = free.count() + n_recycled;
            // Splice the two circular lists.
            let t = recycled.next_raw();
            recycled.set_next_raw(free.next_raw());
            free.set_next_raw(t);
            (free, n)
        } else {
            (recycled, n_recycled)
        };
        merged.set_count(n_free);
        ph.set_free_list(merged.addr());
        ph.unlock();

        let max_chunks = SIZE_CLASSES.chunks_per_block(ph.bin());
        match status {
            BlockState::Owned => {} // the owner will consume it
            BlockState::Partial => {
                if n_free == max_chunks {
                    self.note_full_partial(blocks, rlc, ph);
                }
            }
            BlockState::Exhausted => {
                if n_free == max_chunks {
                    blocks.free_chunked_block(ph);
                } else {
                    self.add_to_partial_list(ph);
                }
            }
            _ => unreachable!("flushing recycled list into {:?}", status),
        }
    }

    /// Move an `Exhausted` block onto its bin's partial list. No
    /// contention on the state: the block has no owner.
    fn add_to_partial_list(&self, ph: Block) {
        debug_assert_eq!(ph.state(), BlockState::Exhausted);
        let bin = ph.bin();
        ph.set_state(BlockState::Partial);

        let plist = &self.partial[bin];
        let mut inner = plist.inner.lock();
        ph.set_next_partial(inner.first);
        ph.set_prev_partial(PrevRef::Head(bin));
        if let Some(first) = inner.first {
            first.set_prev_partial(PrevRef::Block(ph));
        }
        inner.first = Some(ph);
        plist.n_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Remember that a partial block has been observed fully free;
    /// crossing a threshold flushes the observed-full sets.
    fn note_full_partial(&self, blocks: &BlockManager, rlc: &mut RecycledLists, ph: Block) {
        let plist = &self.partial[ph.bin()];
        let n = {
            let mut inner = plist.inner.lock();
            let n = inner.n_observed;
            inner.observed_full[n] = Some(ph);
            inner.n_observed = n + 1;
            inner.n_observed
        };
        rlc.n_observed_full += 1;
        if n >= MAX_OBSERVED_FULL_PER_LIST || rlc.n_observed_full >= MAX_OBSERVED_FULL {
            self.flush_observed_full(blocks, rlc);
        }
    }

    /// Re-verify each observed-full candidate and batch-return the ones
    /// that are still partial, still in the same bin, and still fully
    /// free. A candidate a mutator grabbed in the meantime fails the
    /// status check and is skipped.
    fn flush_observed_full(&self, blocks: &BlockManager, rlc: &mut RecycledLists) {
        let mut truly_full: Vec<Block> = Vec::with_capacity(MAX_OBSERVED_FULL);

        for (list_idx, plist) in self.partial.iter().enumerate() {
            let max_chunks = SIZE_CLASSES.chunks_per_block(list_idx);
            let mut inner = plist.inner.lock();
            for slot in 0..inner.n_observed {
                let ph = inner.observed_full[slot].take().unwrap();
                if ph.state() != BlockState::Partial {
                    continue; // a mutator took it
                }
                if ph.bin() != list_idx {
                    continue; // reallocated into another bin since
                }
                let free = ph.free_list();
                if free.is_zero() {
                    continue;
                }
                let count = FreeCell::at(free).count();
                debug_assert!(count <= max_chunks);
                if count < max_chunks {
                    continue;
                }
                // Guard against extracting a block twice.
                ph.set_state(BlockState::Dummy);
                let next = ph.next_partial();
                match ph.prev_partial() {
                    PrevRef::Head(bin) => {
                        debug_assert_eq!(bin, list_idx);
                        inner.first = next;
                    }
                    PrevRef::Block(p) => p.set_next_partial(next),
                }
                if let Some(n) = next {
                    n.set_prev_partial(ph.prev_partial());
                }
                plist.n_blocks.fetch_sub(1, Ordering::Relaxed);
                truly_full.push(ph);
            }
            inner.n_observed = 0;
        }
        rlc.n_observed_full = 0;

        blocks.free_chunked_blocks(&truly_full);
    }

    /// Sweep one chunked block during a tracing cycle: gather the chunks
    /// `is_dead` approves into a transient recycled list and flush it.
    pub fn sweep_chunked_block(
        &self,
        blocks: &BlockManager,
        ph: Block,
        is_dead: impl Fn(Handle) -> bool,
    ) -> usize {
        let bin = ph.bin();
        let objsz = BIN_SIZE[bin];
        let nobj = SIZE_CLASSES.chunks_per_block(bin);

        let mut local: Option<FreeCell> = None;
        let mut count = 0;
        let mut addr = ph.start();
        for _ in 0..nobj {
            let h = unsafe { Handle::from_address_unchecked(addr) };
            if is_dead(h) {
                let cell = FreeCell::at(addr);
                match local {
                    None => {
                        cell.set_next_raw(addr.as_usize());
                        local = Some(cell);
                        count = 1;
                    }
                    Some(head) => {
                        cell.set_next_raw(head.next_raw());
                        head.set_next_raw(addr.as_usize());
                        count += 1;
                    }
                }
            }
            addr += objsz;
        }

        if let Some(head) = local {
            head.set_count(count);
            let mut rlc = self.rlc.lock();
            self.flush_list(blocks, &mut rlc, head);
        }
        count
    }

    /// Total blocks currently on partial lists.
    pub fn count_partial_blocks(&self) -> usize {
        self.partial
            .iter()
            .map(|p| p.n_blocks.load(Ordering::Relaxed))
            .sum()
    }

    /// Per-bin (blocks, free bytes) on the partial lists.
    pub fn partial_stats(&self) -> [(usize, usize); N_BINS] {
        let mut out = [(0, 0); N_BINS];
        for (bin, plist) in self.partial.iter().enumerate() {
            let objsz = BIN_SIZE[bin];
            let inner = plist.inner.lock();
            let mut blocks = 0;
            let mut free_chunks = 0;
            let mut ph = inner.first;
            while let Some(b) = ph {
                blocks += 1;
                debug_assert_eq!(b.state(), BlockState::Partial);
                let free = b.free_list();
                if !free.is_zero() {
                    free_chunks += FreeCell::at(free).count();
                }
                ph = b.next_partial();
            }
            out[bin] = (blocks, free_chunks * objsz);
        }
        out
    }
}
