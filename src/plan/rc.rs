//! RC updating, the zero-count table, and reclamation.

use crate::heap::block::{Block, BlockState};
use crate::heap::size_class::BIN_SIZE;
use crate::plan::global::CollectorContext;
use crate::plan::log_buffer::*;
use crate::svrc::SVRC;
use crate::util::constants::*;
use crate::util::{Address, Handle};
use crate::vm::{ObjectModel, RuntimeBinding};

fn handle_of(payload: Address) -> Handle {
    debug_assert!(!payload.is_zero());
    unsafe { Handle::from_address_unchecked(payload) }
}

/// Increment the RC of every child the object held at the sliding-view
/// cut. If the handle is dirty, the logged replica is authoritative.
/// Otherwise the current contents are read and committed only if the
/// handle is still clean after the read; a handle that got logged
/// mid-read is retried against its replica. This is the two-phase commit
/// against the mutator.
fn determine_handle_contents<B: RuntimeBinding>(cx: &mut CollectorContext<B>, h: Handle) {
    loop {
        let p = h.log_pos();
        if !p.is_zero() {
            debug_assert_eq!(decode(unsafe { p.load::<usize>() }).0, EntryKind::Closer);
            debug_assert_eq!(decode(unsafe { p.load::<usize>() }).1, h.to_address());
            let mut q = p - BYTES_IN_WORD;
            loop {
                let word = unsafe { q.load::<usize>() };
                let (kind, child) = decode(word);
                if kind != EntryKind::Child {
                    return;
                }
                cx.rc.inc(handle_of(child));
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
                cx.rc.inc(child);
            }
        }
        cx.replica = replica;
        if !logged_meanwhile {
            return;
        }
    }
}

fn decrement_in_update<B: RuntimeBinding>(heap: &SVRC<B>, cx: &mut CollectorContext<B>, h: Handle) {
    let prev = cx.rc.dec(h);
    if prev == 1 && !cx.zct_bmp.get(h) {
        cx.zct_bmp.set(h);
        cx.zct_log.log_handle(heap.chunk_pool(), h);
        cx.stats.in_zct += 1;
    }
}

/// Replay the stolen logs against the RC table: for each logged object,
/// increment the children of its pre-update replica and decrement the
/// children of its current contents. Walking newest-first means
/// increments land before the matching decrements, keeping the ZCT
/// small. Update-log chunks are recycled by the walk; create-log chunks
/// are kept for the reclamation pass.
pub(crate) fn update_reference_counters<B: RuntimeBinding>(
    heap: &SVRC<B>,
    cx: &mut CollectorContext<B>,
) {
    let mut list = cx.stolen_update.take();
    while let Some(chunk) = list {
        list = list_next(chunk);
        // Whether child entries below the current closer belong to a
        // live replica or a neutralized duplicate.
        let mut live = false;
        let mut walk = BackwardWalk::of_sealed(chunk, Some(heap.chunk_pool()));
        while let Some((kind, _, payload)) = walk.next() {
            match kind {
                EntryKind::Closer => {
                    let h = handle_of(payload);
                    determine_handle_contents(cx, h);
                    live = true;
                }
                EntryKind::Dup => live = false,
                EntryKind::Child => {
                    if live {
                        decrement_in_update(heap, cx, handle_of(payload));
                    }
                }
                EntryKind::Link => unreachable!(),
            }
        }
    }

    // Created objects have no pre-images; the collector replicates their
    // children from the current contents. An entry rewritten as a
    // duplicate belongs to a handle a recursive free already took.
    let mut list = cx.stolen_create;
    while let Some(chunk) = list {
        list = list_next(chunk);
        for (kind, _, payload) in BackwardWalk::of_sealed(chunk, None) {
            if kind == EntryKind::Child {
                determine_handle_contents(cx, handle_of(payload));
            } else {
                debug_assert_eq!(kind, EntryKind::Dup);
            }
        }
    }
}

fn decrement_in_deletion<B: RuntimeBinding>(cx: &mut CollectorContext<B>, h: Handle) {
    debug_assert!(!cx.zct_bmp.get(h));
    let prev = cx.rc.dec(h);
    debug_assert!(prev > 0);
    if prev == 1 {
        cx.mark_stack.push(h);
    }
}

/// Free a handle and, through the mark stack, everything that becomes
/// unreferenced because of it. A handle freed with its log still pending
/// has the entry rewritten as a duplicate (preserving framing); a pending
/// closer's logged replica drives the child decrements, while a pending
/// create entry has no replica and the object is read directly.
pub(crate) fn free_handle<B: RuntimeBinding>(
    heap: &SVRC<B>,
    cx: &mut CollectorContext<B>,
    mut h: Handle,
) {
    loop {
        debug_assert_eq!(cx.rc.get(h), 0);

        let p = h.log_pos();
        let mut replica_logged = false;
        if !p.is_zero() {
            let word = unsafe { p.load::<usize>() };
            let (kind, payload) = decode(word);
            debug_assert_eq!(payload, h.to_address());
            debug_assert!(matches!(kind, EntryKind::Closer | EntryKind::Child));
            unsafe { p.store::<usize>(word | EntryKind::Dup as usize) };
            h.clear_log_pos();
            cx.stats.cycles_broken += 1;
            replica_logged = kind == EntryKind::Closer;
        }
        if replica_logged {
            let mut q = p - BYTES_IN_WORD;
            loop {
                let (kind, child) = decode(unsafe { q.load::<usize>() });
                if kind != EntryKind::Child {
                    break;
                }
                decrement_in_deletion(cx, handle_of(child));
                q -= BYTES_IN_WORD;
            }
        } else {
            let mut replica = std::mem::take(&mut cx.replica);
            replica.clear();
            B::Model::scan_object(h, |slot| {
                let child = unsafe { slot.load::<usize>() };
                if child != 0 {
                    replica
                        .push(unsafe { Handle::from_address_unchecked(Address::from_usize(child)) });
                }
            });
            for &child in replica.iter() {
                decrement_in_deletion(cx, child);
            }
            cx.replica = replica;
        }

        cx.stats.freed += 1;
        let b = Block::containing(h.to_address());
        match b.state() {
            BlockState::Big => {
                cx.stats.bytes_freed += b.blob_size() * BYTES_IN_BLOCK;
                heap.block_manager().free_big_region(b);
            }
            BlockState::Owned | BlockState::Exhausted | BlockState::Partial => {
                cx.stats.bytes_freed += BIN_SIZE[b.bin()];
                heap.chunk_manager()
                    .pre_collect(heap.block_manager(), h.to_address());
            }
            s => unreachable!("freeing handle in {:?} block", s),
        }

        match cx.mark_stack.pop() {
            Some(next) => h = next,
            None => return,
        }
    }
}

/// Reclamation: filter the ZCT down to the handles whose RC is still
/// zero, fold unreferenced created objects in, then free everything that
/// survived the filter.
pub(crate) fn reclaim_garbage<B: RuntimeBinding>(heap: &SVRC<B>, cx: &mut CollectorContext<B>) {
    let pool = heap.chunk_pool();
    let mut tmp_zct = LogBuffer::new(pool, false);

    // Handles rescued since they entered the ZCT drop out here.
    {
        let end = cx.zct_log.pos();
        let mut walk = BackwardWalk::new(end, Some(pool));
        while let Some((kind, _, payload)) = walk.next() {
            debug_assert_eq!(kind, EntryKind::Child);
            let h = handle_of(payload);
            debug_assert!(cx.zct_bmp.get(h));
            if cx.rc.get(h) > 0 {
                cx.zct_bmp.clear(h);
            } else {
                tmp_zct.log_handle(pool, h);
            }
        }
    }

    // Created objects that never got a reference are garbage already.
    let mut list = cx.stolen_create.take();
    while let Some(chunk) = list {
        list = list_next(chunk);
        let mut walk = BackwardWalk::of_sealed(chunk, Some(pool));
        while let Some((kind, _, payload)) = walk.next() {
            if kind != EntryKind::Child {
                debug_assert_eq!(kind, EntryKind::Dup);
                continue;
            }
            let h = handle_of(payload);
            if cx.rc.get(h) == 0 && !cx.zct_bmp.get(h) {
                cx.zct_bmp.set(h);
                tmp_zct.log_handle(pool, h);
            }
        }
    }

    // Free the survivors, recursively.
    {
        let end = tmp_zct.pos();
        let mut walk = BackwardWalk::new(end, Some(pool));
        while let Some((kind, _, payload)) = walk.next() {
            debug_assert_eq!(kind, EntryKind::Child);
            let h = handle_of(payload);
            debug_assert!(cx.zct_bmp.get(h));
            free_handle(heap, cx, h);
            cx.zct_bmp.clear(h);
        }
    }

    heap.chunk_manager()
        .flush_recycled_lists(heap.block_manager());
}

/// Withdraw the reference counts contributed by root snooping. A handle
/// whose count drops to zero with the local contribution removed is a
/// candidate for the next cycle's ZCT. The next-cycle ZCT then becomes
/// the current one.
pub(crate) fn process_locals_into_next_zct<B: RuntimeBinding>(
    heap: &SVRC<B>,
    cx: &mut CollectorContext<B>,
) {
    let pool = heap.chunk_pool();
    let mut next_zct = LogBuffer::new(pool, false);

    let locals = cx.unique_locals.take().unwrap();
    let end = locals.pos();
    let mut walk = BackwardWalk::new(end, Some(pool));
    while let Some((kind, _, payload)) = walk.next() {
        debug_assert_eq!(kind, EntryKind::Child);
        let h = handle_of(payload);
        debug_assert!(!cx.zct_bmp.get(h));
        // Everyone's bit is being turned off, so wiping whole bitmap
        // bytes is fine.
        cx.locals_bmp.clear_byte(h);
        let prev = cx.rc.dec(h);
        debug_assert!(prev > 0);
        if prev == 1 {
            cx.zct_bmp.set(h);
            next_zct.log_handle(pool, h);
        }
    }

    cx.zct_log = next_zct;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::block::heap_start;
    use crate::plan::global::CollectorContext;
    use crate::plan::handshake;
    use crate::util::constants::LOG_BYTES_IN_MBYTE;
    use crate::util::test_util::*;

    // Build a collector context over the fixture heap's address range.
    // Its bitmaps are private to the test and never touch the fixture's
    // collector state.
    fn scratch_context(fx: &HeapFixture) -> CollectorContext<MockRuntime> {
        CollectorContext::new(
            heap_start(),
            FIXTURE_HEAP_MB << LOG_BYTES_IN_MBYTE as usize,
            fx.heap.chunk_pool(),
        )
    }

    #[test]
    fn update_replay_skips_duplicate_closers() {
        with_fixture(|fx| {
            fx.quiesce();
            let c1 = fx.alloc_obj(0, 8);
            let c2 = fx.alloc_obj(0, 8);
            let h1 = fx.alloc_obj(1, 0);
            let h2 = fx.alloc_obj(1, 0);
            let h2_saved_log = h2.log_pos();

            let pool = fx.heap.chunk_pool();
            let mut cx = scratch_context(fx);

            // A stolen update buffer: h1's replica got neutralized by a
            // cycle-breaking free; h2's is live, with its log pointer
            // reinforced onto the closer.
            let mut buf = LogBuffer::new(pool, false);
            buf.log_handle(pool, c1);
            let h1_closer = buf.pos();
            buf.log_word(pool, encode(h1.to_address(), EntryKind::Closer));
            buf.log_handle(pool, c2);
            let h2_closer = buf.pos();
            buf.log_word(pool, encode(h2.to_address(), EntryKind::Closer));
            buf.seal();
            unsafe {
                h1_closer.store::<usize>(encode(h1.to_address(), EntryKind::Dup));
            }
            h2.set_log_pos(h2_closer);

            // Pre-existing counts: two references to c1, one to c2.
            cx.rc.inc(c1);
            cx.rc.inc(c1);
            cx.rc.inc(c2);

            cx.stolen_update = Some(buf.start_chunk());
            update_reference_counters(fx.heap, &mut cx);

            // h2 live: +1 for c2 from the replica, then -1 for the
            // logged pre-image; h1's entries contribute nothing.
            assert_eq!(cx.rc.get(c1), 2);
            assert_eq!(cx.rc.get(c2), 1);
            assert!(!cx.zct_bmp.get(c2));

            h2.set_log_pos(h2_saved_log);
            fx.quiesce();
        });
    }

    #[test]
    fn clear_dirty_neutralizes_stale_closers() {
        with_fixture(|fx| {
            fx.quiesce();
            let owned = fx.alloc_obj(1, 0);
            let stale = fx.alloc_obj(1, 0);
            let owned_saved_log = owned.log_pos();

            let pool = fx.heap.chunk_pool();
            let mut cx = scratch_context(fx);

            let mut buf = LogBuffer::new(pool, false);
            let owned_closer = buf.pos();
            buf.log_word(pool, encode(owned.to_address(), EntryKind::Closer));
            let stale_closer = buf.pos();
            buf.log_word(pool, encode(stale.to_address(), EntryKind::Closer));
            buf.seal();
            // `owned` still points at its entry; `stale` was re-logged
            // elsewhere in the meantime (its create entry, here).
            owned.set_log_pos(owned_closer);

            cx.stolen_update = Some(buf.start_chunk());
            handshake::clear_dirty_marks(fx.heap, &mut cx);

            assert!(!owned.is_logged(), "owned closer cleared the mark");
            assert_eq!(
                decode(unsafe { owned_closer.load::<usize>() }).0,
                EntryKind::Closer
            );
            assert_eq!(
                decode(unsafe { stale_closer.load::<usize>() }).0,
                EntryKind::Dup,
                "a closer that lost its handle is rewritten"
            );
            assert!(stale.is_logged(), "the newer log position is untouched");
            assert_eq!(cx.stats.duplicates, 1);

            free_chains(pool, cx.stolen_update.take());
            owned.set_log_pos(owned_saved_log);
            fx.quiesce();
        });
    }
}
