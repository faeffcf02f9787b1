//! Blocks and their out-of-heap headers.
//!
//! The heap is divided into 16 KiB blocks. Every block has a four-word
//! header in a table parallel to the heap, indexed by block number with a
//! guard entry on each side plus one extra entry serving as the root of
//! the block manager's list-of-lists. The meaning of the header words
//! depends on the block's state:
//!
//! | state                       | w0              | w1           | w2            |
//! |-----------------------------|-----------------|--------------|---------------|
//! | `Free`                      | next region     | prev region  | region size   |
//! | `ListHeader`                | first region    | next list    | region size   |
//! | `Big`                       | alloc-in-progress | -          | size in blocks|
//! | `BigInterior` (debug)       | head block      | -            | -             |
//! | `Owned`/`Exhausted`/`Partial` | next partial  | prev partial | free list     |
//!
//! Word 3 packs `status(8) | lock(8) | bin(16) | aux(32)`; `aux` holds the
//! previous-list header index for `ListHeader` blocks. The lock byte is a
//! spinlock taken by compare-and-swap on the whole word; it guards the
//! block's free list.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::util::constants::*;
use crate::util::Address;
use crate::util::Handle;

/// A 16 KiB heap block. This type always holds the non-zero,
/// block-aligned address of the block, so `Option<Block>` is pointer
/// sized.
#[derive(Clone, Copy, PartialOrd, PartialEq, Eq)]
#[repr(transparent)]
pub struct Block(NonZeroUsize);

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Block({:#x})", self.0)
    }
}

/// The block allocation state, kept in the status byte of header word 3.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum BlockState {
    /// A free region in the hands of the block manager.
    Free = 1,
    /// A free region that is also a list header in the list-of-lists.
    ListHeader = 2,
    /// In transit from the block manager to the chunk manager.
    Chunking = 3,
    /// Head block of a multi-block object.
    Big = 4,
    /// Interior block of a multi-block object (maintained in debug
    /// builds only).
    BigInterior = 5,
    /// Chunked block owned by exactly one mutator's allocation list.
    Owned = 6,
    /// Chunked block with no owner and no free chunks known to any
    /// mutator.
    Exhausted = 7,
    /// Chunked block sitting on the global partial list for its bin.
    Partial = 8,
    /// Transient state during batched frees and for the table guards.
    Dummy = 9,
}

impl From<u8> for BlockState {
    fn from(v: u8) -> BlockState {
        match v {
            // Never-stamped headers (big-region interiors outside debug
            // builds) read as zero; treat them like the table guards.
            0 => BlockState::Dummy,
            1 => BlockState::Free,
            2 => BlockState::ListHeader,
            3 => BlockState::Chunking,
            4 => BlockState::Big,
            5 => BlockState::BigInterior,
            6 => BlockState::Owned,
            7 => BlockState::Exhausted,
            8 => BlockState::Partial,
            9 => BlockState::Dummy,
            _ => unreachable!("invalid block state {}", v),
        }
    }
}

const STATUS_SHIFT: u64 = 56;
const LOCK_SHIFT: u64 = 48;
const BIN_SHIFT: u64 = 32;
const LOCK_MASK: u64 = 0xff << LOCK_SHIFT;
const BIN_MASK: u64 = 0xffff << BIN_SHIFT;
const AUX_MASK: u64 = 0xffff_ffff;

/// One block header. The header table is created once at heap
/// initialization and lives for the process lifetime.
#[repr(C)]
pub struct BlockHeader {
    w0: AtomicUsize,
    w1: AtomicUsize,
    w2: AtomicUsize,
    w3: AtomicU64,
}

const_assert_eq!(std::mem::size_of::<BlockHeader>(), 32);

// The header table and heap bounds are process-wide, set once by
// `init_header_table`. Keeping them global lets `Block` expose header
// accessors without threading the table through every call site.
static HEADERS: AtomicUsize = AtomicUsize::new(0);
static HEAP_START: AtomicUsize = AtomicUsize::new(0);
static HEAP_BLOCKS: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn heap_start() -> Address {
    unsafe { Address::from_usize(HEAP_START.load(std::sync::atomic::Ordering::Relaxed)) }
}

pub(crate) fn heap_blocks() -> usize {
    HEAP_BLOCKS.load(std::sync::atomic::Ordering::Relaxed)
}

pub(crate) fn heap_end() -> Address {
    heap_start() + blocks_to_bytes_const(heap_blocks())
}

const fn blocks_to_bytes_const(blocks: usize) -> usize {
    blocks << LOG_BYTES_IN_BLOCK as usize
}

/// Is the address inside the managed heap reservation?
pub fn address_in_heap(addr: Address) -> bool {
    addr >= heap_start() && addr < heap_end()
}

/// Create the header table for a heap of `n_blocks` blocks starting at
/// `start`. Index 0 and `n_blocks + 1` are guards; index `n_blocks + 2`
/// is the root of the list-of-lists.
pub(crate) fn init_header_table(start: Address, n_blocks: usize) {
    let bytes = (n_blocks + 3) * std::mem::size_of::<BlockHeader>();
    let table = crate::util::memory::reserve_and_commit(bytes);
    HEADERS.store(table.as_usize(), std::sync::atomic::Ordering::Relaxed);
    HEAP_START.store(start.as_usize(), std::sync::atomic::Ordering::Relaxed);
    HEAP_BLOCKS.store(n_blocks, std::sync::atomic::Ordering::Relaxed);

    hdr_at(GUARD_LOW).set_status_raw(BlockState::Dummy);
    hdr_at(guard_high()).set_status_raw(BlockState::Dummy);
    hdr_at(region_lists_root()).set_status_raw(BlockState::ListHeader);
}

pub(crate) const GUARD_LOW: usize = 0;

pub(crate) fn guard_high() -> usize {
    heap_blocks() + 1
}

/// Header index of the list-of-lists root.
pub(crate) fn region_lists_root() -> usize {
    heap_blocks() + 2
}

/// The next-list pointer of the list header (or the root) at the given
/// header-table index.
pub(crate) fn list_next_of(index: usize) -> Option<Block> {
    NonZeroUsize::new(hdr_at(index).w1.load(Ordering::Relaxed)).map(Block)
}

pub(crate) fn set_list_next_of(index: usize, next: Option<Block>) {
    hdr_at(index)
        .w1
        .store(next.map_or(0, |b| b.start().as_usize()), Ordering::Relaxed);
}

pub(crate) fn hdr_at(index: usize) -> &'static BlockHeader {
    let base = HEADERS.load(std::sync::atomic::Ordering::Relaxed);
    debug_assert!(base != 0, "header table not initialized");
    debug_assert!(index <= region_lists_root());
    unsafe { &*(base as *const BlockHeader).add(index) }
}

impl BlockHeader {
    fn set_status_raw(&self, s: BlockState) {
        self.w3.store((s as u64) << STATUS_SHIFT, Ordering::Release);
    }

    pub(crate) fn status(&self) -> BlockState {
        ((self.w3.load(Ordering::Relaxed) >> STATUS_SHIFT) as u8).into()
    }

    pub(crate) fn set_status(&self, s: BlockState) {
        self.w3
            .fetch_update(Ordering::Release, Ordering::Relaxed, |v| {
                Some((v & !(0xff << STATUS_SHIFT)) | ((s as u64) << STATUS_SHIFT))
            })
            .unwrap();
    }

    fn bin(&self) -> usize {
        ((self.w3.load(Ordering::Relaxed) & BIN_MASK) >> BIN_SHIFT) as usize
    }

    fn aux(&self) -> usize {
        (self.w3.load(Ordering::Relaxed) & AUX_MASK) as usize
    }

    fn set_aux(&self, aux: usize) {
        debug_assert!(aux as u64 <= AUX_MASK);
        self.w3
            .fetch_update(Ordering::Release, Ordering::Relaxed, |v| {
                Some((v & !AUX_MASK) | aux as u64)
            })
            .unwrap();
    }

    /// Install status and bin in one store, clearing the lock.
    fn set_status_and_bin(&self, s: BlockState, bin: usize) {
        debug_assert!(bin < crate::heap::size_class::N_BINS);
        self.w3.store(
            ((s as u64) << STATUS_SHIFT) | ((bin as u64) << BIN_SHIFT),
            Ordering::Release,
        );
    }

    fn lock(&self) {
        loop {
            let v = self.w3.load(Ordering::Relaxed);
            if v & LOCK_MASK != 0 {
                std::hint::spin_loop();
                continue;
            }
            if self
                .w3
                .compare_exchange_weak(v, v | LOCK_MASK, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    fn unlock(&self) {
        debug_assert!(self.w3.load(Ordering::Relaxed) & LOCK_MASK != 0);
        self.w3.fetch_and(!LOCK_MASK, Ordering::Release);
    }
}

/// The previous-element reference of an intrusive block list: either the
/// list's head slot (identified by an index the list owner interprets) or
/// a real block. Block addresses are word aligned, so the tag fits in the
/// low bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrevRef {
    Head(usize),
    Block(Block),
}

impl PrevRef {
    pub(crate) fn encode(self) -> usize {
        match self {
            PrevRef::Head(idx) => (idx << 1) | 1,
            PrevRef::Block(b) => b.start().as_usize(),
        }
    }

    pub(crate) fn decode(raw: usize) -> PrevRef {
        if raw & 1 != 0 {
            PrevRef::Head(raw >> 1)
        } else {
            PrevRef::Block(unsafe { Block::from_aligned_address_unchecked(Address::from_usize(raw)) })
        }
    }
}

impl Block {
    /// log2 of the block size in bytes.
    pub const LOG_BYTES: usize = LOG_BYTES_IN_BLOCK as usize;
    /// The block size in bytes.
    pub const BYTES: usize = BYTES_IN_BLOCK;

    pub fn from_aligned_address(address: Address) -> Self {
        debug_assert!(address.is_aligned_to(Self::BYTES));
        debug_assert!(!address.is_zero());
        Self(unsafe { NonZeroUsize::new_unchecked(address.as_usize()) })
    }

    pub(crate) unsafe fn from_aligned_address_unchecked(address: Address) -> Self {
        Self(NonZeroUsize::new_unchecked(address.as_usize()))
    }

    /// The block containing the given heap address.
    pub fn containing(address: Address) -> Self {
        Self::from_aligned_address(address.align_down(Self::BYTES))
    }

    pub fn start(&self) -> Address {
        unsafe { Address::from_usize(self.0.get()) }
    }

    pub fn end(&self) -> Address {
        self.start() + Self::BYTES
    }

    /// The block `n` blocks to the right.
    pub fn forward(&self, n: usize) -> Block {
        Block::from_aligned_address(self.start() + n * Self::BYTES)
    }

    /// The header-table index of this block (1-based; 0 is the low
    /// guard).
    pub(crate) fn index(&self) -> usize {
        (self.start() - heap_start()) / Self::BYTES + 1
    }

    pub(crate) fn from_index(index: usize) -> Block {
        debug_assert!(index >= 1 && index <= heap_blocks());
        Block::from_aligned_address(heap_start() + (index - 1) * Self::BYTES)
    }

    pub(crate) fn hdr(&self) -> &'static BlockHeader {
        hdr_at(self.index())
    }

    pub fn state(&self) -> BlockState {
        self.hdr().status()
    }

    pub fn set_state(&self, s: BlockState) {
        self.hdr().set_status(s);
    }

    /// Overwrite the whole status word for a block leaving the chunked
    /// states: installs the new status and clears lock, bin and aux.
    pub fn reset_state(&self, s: BlockState) {
        self.hdr().set_status_raw(s);
    }

    /// The bin index of a chunked block.
    pub fn bin(&self) -> usize {
        self.hdr().bin()
    }

    /// Take this block's spinlock, guarding its free list.
    pub fn lock(&self) {
        self.hdr().lock();
    }

    pub fn unlock(&self) {
        self.hdr().unlock();
    }

    /// Transition a fresh `Chunking` block into `Owned` for a bin,
    /// clearing the partial links and the free list.
    pub fn init_owned(&self, bin: usize) {
        debug_assert_eq!(self.state(), BlockState::Chunking);
        self.hdr().w0.store(0, Ordering::Relaxed);
        self.hdr().w1.store(0, Ordering::Relaxed);
        self.hdr().w2.store(0, Ordering::Relaxed);
        self.hdr().set_status_and_bin(BlockState::Owned, bin);
    }

    // Chunked-block fields.

    pub fn free_list(&self) -> Address {
        unsafe { Address::from_usize(self.hdr().w2.load(Ordering::Relaxed)) }
    }

    pub fn set_free_list(&self, head: Address) {
        self.hdr().w2.store(head.as_usize(), Ordering::Relaxed);
    }

    pub fn next_partial(&self) -> Option<Block> {
        let raw = self.hdr().w0.load(Ordering::Relaxed);
        NonZeroUsize::new(raw).map(Block)
    }

    pub fn set_next_partial(&self, next: Option<Block>) {
        self.hdr()
            .w0
            .store(next.map_or(0, |b| b.start().as_usize()), Ordering::Relaxed);
    }

    pub(crate) fn prev_partial(&self) -> PrevRef {
        PrevRef::decode(self.hdr().w1.load(Ordering::Relaxed))
    }

    pub(crate) fn set_prev_partial(&self, prev: PrevRef) {
        self.hdr().w1.store(prev.encode(), Ordering::Relaxed);
    }

    // Big-allocation fields.

    pub fn alloc_in_progress(&self) -> bool {
        self.hdr().w0.load(Ordering::Acquire) != 0
    }

    pub fn set_alloc_in_progress(&self, v: bool) {
        self.hdr().w0.store(v as usize, Ordering::Release);
    }

    /// The region size in blocks of a `Big` head (or tail) block.
    pub fn blob_size(&self) -> usize {
        self.hdr().w2.load(Ordering::Relaxed)
    }

    pub fn set_blob_size(&self, blocks: usize) {
        self.hdr().w2.store(blocks, Ordering::Relaxed);
    }

    #[cfg(debug_assertions)]
    pub fn set_big_interior(&self, head: Block) {
        self.hdr().w0.store(head.start().as_usize(), Ordering::Relaxed);
        self.hdr().set_status(BlockState::BigInterior);
    }

    #[cfg(debug_assertions)]
    pub fn big_interior_head(&self) -> Block {
        Block::from_aligned_address(unsafe {
            Address::from_usize(self.hdr().w0.load(Ordering::Relaxed))
        })
    }

    // Free-region fields.

    pub fn next_region(&self) -> Option<Block> {
        NonZeroUsize::new(self.hdr().w0.load(Ordering::Relaxed)).map(Block)
    }

    pub fn set_next_region(&self, next: Option<Block>) {
        self.hdr()
            .w0
            .store(next.map_or(0, |b| b.start().as_usize()), Ordering::Relaxed);
    }

    pub(crate) fn prev_region(&self) -> PrevRef {
        PrevRef::decode(self.hdr().w1.load(Ordering::Relaxed))
    }

    pub(crate) fn set_prev_region(&self, prev: PrevRef) {
        self.hdr().w1.store(prev.encode(), Ordering::Relaxed);
    }

    /// The signed region size of a free block. Positive on the first
    /// block of a region; the last block of a multi-block region carries
    /// the negated size to enable left-coalescing.
    pub fn region_size(&self) -> isize {
        self.hdr().w2.load(Ordering::Relaxed) as isize
    }

    pub fn set_region_size(&self, size: isize) {
        self.hdr().w2.store(size as usize, Ordering::Relaxed);
    }

    // List-header fields (the list-of-lists). `first_region` aliases
    // `next_region` (header word 0) so that unlinking a region can write
    // through its predecessor without caring whether the predecessor is
    // the list header.

    pub fn first_region(&self) -> Option<Block> {
        self.next_region()
    }

    pub fn set_first_region(&self, first: Option<Block>) {
        self.set_next_region(first);
    }

    pub fn next_list(&self) -> Option<Block> {
        NonZeroUsize::new(self.hdr().w1.load(Ordering::Relaxed)).map(Block)
    }

    pub fn set_next_list(&self, next: Option<Block>) {
        self.hdr()
            .w1
            .store(next.map_or(0, |b| b.start().as_usize()), Ordering::Relaxed);
    }

    /// Header-table index of the previous list header (or the root).
    pub(crate) fn prev_list(&self) -> usize {
        self.hdr().aux()
    }

    pub(crate) fn set_prev_list(&self, idx: usize) {
        self.hdr().set_aux(idx);
    }

    /// The handle occupying a whole `Big` region.
    pub fn big_handle(&self) -> Handle {
        unsafe { Handle::from_address_unchecked(self.start()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prev_ref_roundtrip() {
        let head = PrevRef::Head(13);
        assert_eq!(PrevRef::decode(head.encode()), head);
        let addr = unsafe { Address::from_usize(0x40_0000) };
        let block = PrevRef::Block(Block::from_aligned_address(addr));
        assert_eq!(PrevRef::decode(block.encode()), block);
    }

    #[test]
    fn state_byte_roundtrip() {
        for s in [
            BlockState::Free,
            BlockState::ListHeader,
            BlockState::Chunking,
            BlockState::Big,
            BlockState::BigInterior,
            BlockState::Owned,
            BlockState::Exhausted,
            BlockState::Partial,
            BlockState::Dummy,
        ] {
            assert_eq!(BlockState::from(s as u8), s);
        }
    }
}
