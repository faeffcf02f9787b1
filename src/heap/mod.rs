//! Heap structure: blocks, regions, and size-class chunks.

pub mod block;
pub mod block_manager;
pub mod chunk_manager;
pub mod size_class;

pub use block::{Block, BlockState};
pub use block_manager::BlockManager;
pub use chunk_manager::{AllocList, ChunkManager};

use crate::heap::chunk_manager::ALLOC_LIST_SENTINEL;
use crate::heap::size_class::BIN_SIZE;
use crate::util::constants::HANDLE_GRAIN;
use crate::util::{Address, Handle};

/// Decide conservatively whether `addr` is a live handle. Used to filter
/// the words found by register and stack snooping, and by debug
/// assertions on log entries.
///
/// A word passes if it points into the heap, is handle-aligned, sits at a
/// plausible position for its block's state, and is not a free chunk. A
/// free chunk is recognizable because its list link occupies the handle's
/// log-pointer word: the link is either the allocation-list sentinel or
/// an address within the same block, neither of which a live handle's
/// log pointer can be.
pub fn is_valid_handle(addr: Address) -> Option<Handle> {
    if !block::address_in_heap(addr) {
        return None;
    }
    if !addr.is_aligned_to(HANDLE_GRAIN) {
        return None;
    }
    let b = Block::containing(addr);
    match b.state() {
        BlockState::Big => {
            if addr == b.start() {
                Some(unsafe { Handle::from_address_unchecked(addr) })
            } else {
                None
            }
        }
        BlockState::Owned | BlockState::Exhausted | BlockState::Partial => {
            let offset = addr - b.start();
            if offset % BIN_SIZE[b.bin()] != 0 {
                return None;
            }
            let h = unsafe { Handle::from_address_unchecked(addr) };
            let link = h.log_pos();
            if link.as_usize() == ALLOC_LIST_SENTINEL {
                return None;
            }
            if !link.is_zero() && (link.as_usize() ^ addr.as_usize()) < Block::BYTES {
                return None;
            }
            Some(h)
        }
        _ => None,
    }
}

/// Like [`is_valid_handle`], but for a word that may be a body pointer
/// rather than a handle pointer.
pub fn handle_from_body(addr: Address) -> Option<Handle> {
    if addr.as_usize() < crate::util::address::HANDLE_BYTES {
        return None;
    }
    is_valid_handle(addr - crate::util::address::HANDLE_BYTES)
}
