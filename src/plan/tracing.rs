//! The backup tracing collector.
//!
//! Shares the write-buffer infrastructure with the RC path but ignores
//! its content: the logged replicas are discarded, the RC table is bulk
//! zeroed, live objects get their counts rebuilt by a depth-first trace
//! from the unique locals, and a linear sweep of the block headers
//! returns everything the trace did not reach. Cyclic garbage the RC
//! cycles could not reclaim dies here.

use crate::heap::block::{heap_blocks, Block, BlockState};
use crate::heap::size_class::BIN_SIZE;
use crate::plan::global::CollectorContext;
use crate::plan::log_buffer::*;
use crate::svrc::SVRC;
use crate::util::constants::*;
use crate::util::{Address, Handle};
use crate::vm::{ObjectModel, RuntimeBinding};

/// Discard the logged state of the cycle and clear the RC table. Runs at
/// the start of root consolidation when the cycle is a tracing one.
pub(crate) fn trace_setup<B: RuntimeBinding>(heap: &SVRC<B>, cx: &mut CollectorContext<B>) {
    let pool = heap.chunk_pool();

    free_chains(pool, cx.stolen_create.take());
    free_chains(pool, cx.stolen_update.take());

    cx.zct_log.seal();
    free_chain(pool, cx.zct_log.start_chunk());

    cx.zct_bmp.decommit();
    cx.rc.bulk_zero();
}

fn scan_handle<B: RuntimeBinding>(cx: &mut CollectorContext<B>, h: Handle) {
    let prev = cx.rc.inc_rv(h);
    if prev == 0 {
        cx.mark_stack.push(h);
    }
}

/// Push the children of a marked handle. A dirty handle's children are
/// taken from its logged replica; a clean one is read directly, retrying
/// against the log if it gets logged mid-read. A handle whose log entry
/// is a create-buffer entry was born after the cut: its children are
/// reached through whoever stored them, so it contributes nothing here.
fn mark_handle_children<B: RuntimeBinding>(cx: &mut CollectorContext<B>, h: Handle) {
    cx.stats.traced += 1;
    loop {
        let p = h.log_pos();
        if !p.is_zero() {
            let (kind, payload) = decode(unsafe { p.load::<usize>() });
            if kind == EntryKind::Child {
                debug_assert!(cx.locals_bmp.get(h));
                return;
            }
            debug_assert_eq!(kind, EntryKind::Closer);
            debug_assert_eq!(payload, h.to_address());
            let mut q = p - BYTES_IN_WORD;
            loop {
                let (kind, child) = decode(unsafe { q.load::<usize>() });
                if kind != EntryKind::Child {
                    return;
                }
                scan_handle(cx, unsafe { Handle::from_address_unchecked(child) });
                q -= BYTES_IN_WORD;
            }
        }

        let mut replica = std::mem::take(&mut cx.replica);
        replica.clear();
        B::Model::scan_object(h, |slot| {
            let child = unsafe { slot.load::<usize>() };
            if child != 0 {
                replica.push(unsafe { Handle::from_address_unchecked(Address::from_usize(child)) });
            }
        });
        let logged_meanwhile = h.is_logged();
        if !logged_meanwhile {
            for &child in replica.iter() {
                scan_handle(cx, child);
            }
        }
        cx.replica = replica;
        if !logged_meanwhile {
            return;
        }
    }
}

fn empty_mark_stack<B: RuntimeBinding>(cx: &mut CollectorContext<B>) {
    while let Some(h) = cx.mark_stack.pop() {
        debug_assert!(cx.rc.get(h) > 0);
        mark_handle_children(cx, h);
    }
}

/// Depth-first trace from the unique-locals buffer. Each node is pushed
/// once: the first visit moves its RC off zero.
pub(crate) fn trace<B: RuntimeBinding>(_heap: &SVRC<B>, cx: &mut CollectorContext<B>) {
    let locals = *cx.unique_locals.as_ref().unwrap();
    let end = locals.pos();
    let mut walk = BackwardWalk::new(end, None);
    while let Some((kind, _, payload)) = walk.next() {
        debug_assert_eq!(kind, EntryKind::Child);
        let h = unsafe { Handle::from_address_unchecked(payload) };
        debug_assert!(cx.rc.get(h) >= 1);
        mark_handle_children(cx, h);
        empty_mark_stack(cx);
    }
}

fn sweep_big<B: RuntimeBinding>(heap: &SVRC<B>, cx: &mut CollectorContext<B>, b: Block) {
    if b.alloc_in_progress() {
        return;
    }
    let h = b.big_handle();
    if cx.rc.get(h) > 0 {
        return;
    }
    if h.is_logged() {
        // Logged since the cut; leave it for the next cycle.
        return;
    }
    cx.stats.freed += 1;
    cx.stats.bytes_freed += b.blob_size() * BYTES_IN_BLOCK;
    heap.block_manager().free_big_region(b);
}

/// Linear walk of the block headers from the heap start to the
/// wilderness, reclaiming unreached big regions and sweeping every
/// chunked block through the recycled-lists cache.
pub(crate) fn sweep<B: RuntimeBinding>(heap: &SVRC<B>, cx: &mut CollectorContext<B>) {
    let blocks = heap.block_manager();
    let chunks = heap.chunk_manager();
    let wilderness = blocks.wilderness_start();
    let total = heap_blocks();

    let mut idx = 1usize;
    while idx <= total {
        let b = Block::from_index(idx);
        if b.start() >= wilderness {
            break;
        }
        match b.state() {
            BlockState::Free | BlockState::ListHeader => {
                let size = b.region_size();
                debug_assert!(size >= 1);
                idx += size as usize;
            }
            BlockState::Big => {
                let size = b.blob_size();
                sweep_big(heap, cx, b);
                debug_assert!(size >= 1);
                idx += size;
            }
            BlockState::Owned | BlockState::Exhausted | BlockState::Partial => {
                let bin = b.bin();
                let rc = &cx.rc;
                let freed = chunks.sweep_chunked_block(blocks, b, |h| {
                    rc.get(h) == 0 && !h.is_logged()
                });
                cx.stats.freed += freed;
                cx.stats.bytes_freed += freed * BIN_SIZE[bin];
                idx += 1;
            }
            _ => {
                // A block in transit to the chunk manager; nothing to
                // sweep yet.
                idx += 1;
            }
        }
    }
}
