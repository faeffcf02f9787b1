//! The four-stage handshake.
//!
//! Mutators advance through the stages independently, either voluntarily
//! at a cooperation point or by collector-initiated suspension. A mutator
//! inside an uncooperative region is retried until the flag clears; the
//! registry lock is held across each handshake so threads cannot attach
//! or detach mid-stage, mirroring the thread-queue lock of classic
//! on-the-fly designs.

use std::time::Duration;

use crate::heap::{handle_from_body, is_valid_handle};
use crate::plan::global::{CollectionKind, CollectorContext};
use crate::plan::log_buffer::*;
use crate::plan::mutator::{Mutator, Stage, COOPERATED_NONE};
use crate::svrc::SVRC;
use crate::util::{Address, Handle};
use crate::vm::{Roots, RuntimeBinding, Threads};

const HANDSHAKE_RETRY: Duration = Duration::from_millis(10);

/// Run one handshake step against every registered mutator until all of
/// them have transitioned. The registry stays locked throughout.
fn handshake_all<B: RuntimeBinding, F>(heap: &SVRC<B>, mut step: F)
where
    F: FnMut(&mut Mutator<B>) -> bool,
{
    let reg = heap.registry().lock().unwrap();
    loop {
        let mut all_ok = true;
        for ptr in reg.mutator_ptrs() {
            let m = unsafe { &mut *ptr };
            if !step(m) {
                all_ok = false;
            }
        }
        if all_ok {
            break;
        }
        std::thread::sleep(HANDSHAKE_RETRY);
    }
}

/// Suspend `m`'s thread unless it is the current thread (which happens
/// when a cycle runs inline on a requesting mutator that is parked at a
/// safepoint). Returns whether a resume is needed.
fn suspend_unless_self<B: RuntimeBinding>(m: &Mutator<B>) -> bool {
    if m.tls.0 == B::Threads::current() {
        return false;
    }
    B::Threads::suspend(m.tls);
    true
}

/// Stage H1: raise every mutator's snoop flag, splice the dead-thread
/// logs, then steal each mutator's update and create buffers, handing it
/// fresh pre-allocated ones.
pub(crate) fn initiate<B: RuntimeBinding>(heap: &SVRC<B>, cx: &mut CollectorContext<B>) {
    debug_assert_eq!(heap.global_stage(), Stage::Consolidate);

    {
        let reg = heap.registry().lock().unwrap();
        for ptr in reg.mutator_ptrs() {
            let m = unsafe { &*ptr };
            m.snoop.store(true, atomic::Ordering::Release);
        }
    }

    debug_assert!(cx.stolen_update.is_none());
    debug_assert!(cx.stolen_create.is_none());
    {
        let mut reg = heap.registry().lock().unwrap();
        heap.set_global_stage(Stage::Initiate);
        cx.stolen_create = reg.dead.create.take();
        cx.stolen_update = reg.dead.update.take();
    }

    handshake_all(heap, |m| {
        if m.stage() == Stage::Initiate {
            return true;
        }
        if m.cant_coop() {
            return false;
        }
        while cx.preallocated.len() < 2 {
            cx.preallocated.push(LogBuffer::new(heap.chunk_pool(), false));
        }
        let resume = suspend_unless_self(m);
        debug_assert_eq!(m.stage(), Stage::Consolidate);
        if m.cant_coop() {
            if resume {
                B::Threads::resume(m.tls);
            }
            return false;
        }

        // Covers threads that attached after the snoop-raising pass.
        m.snoop.store(true, atomic::Ordering::Release);

        cx.stats.objects_allocated += m.counters.objects_allocated;
        cx.stats.bytes_allocated += m.counters.bytes_allocated;
        m.counters.objects_allocated = 0;
        m.counters.bytes_allocated = 0;

        if m.create_log.is_modified() {
            m.create_log.seal();
            push_onto_list(&mut cx.stolen_create, m.create_log.start_chunk());
            m.create_log = cx.preallocated.pop().unwrap();
        }
        if m.update_log.is_modified() {
            m.update_log.seal();
            push_onto_list(&mut cx.stolen_update, m.update_log.start_chunk());
            m.update_log = cx.preallocated.pop().unwrap();
        }

        m.set_stage(Stage::Initiate);
        if resume {
            B::Threads::resume(m.tls);
        }
        true
    });
}

/// Clear the dirty marks of every handle logged in the stolen buffers.
/// Runs while mutators log freely into their fresh buffers; a closer
/// whose handle has been re-logged since (log pointer no longer aiming at
/// this entry) is rewritten as a duplicate so the framing survives. The
/// stolen chunks are kept: the RC update replays them.
pub(crate) fn clear_dirty_marks<B: RuntimeBinding>(_heap: &SVRC<B>, cx: &mut CollectorContext<B>) {
    // Create logs: no logging contention is possible for fresh objects,
    // so every surviving entry still owns its log pointer. Entries
    // rewritten as duplicates belong to handles a recursive free of the
    // previous cycle already took.
    let mut list = cx.stolen_create;
    while let Some(chunk) = list {
        list = list_next(chunk);
        let limit = unsafe { Address::from_usize(load_reserved(chunk, LAST_POS_IDX)) };
        for (kind, entry, payload) in ForwardWalk::new(chunk, limit) {
            if kind != EntryKind::Child {
                debug_assert_eq!(kind, EntryKind::Dup);
                continue;
            }
            let h = unsafe { Handle::from_address_unchecked(payload) };
            debug_assert_eq!(h.log_pos(), entry);
            h.clear_log_pos();
            cx.stats.create_objects += 1;
        }
    }

    let mut list = cx.stolen_update;
    while let Some(chunk) = list {
        list = list_next(chunk);
        for (kind, entry, payload) in BackwardWalk::of_sealed(chunk, None) {
            match kind {
                EntryKind::Closer => {
                    let h = unsafe { Handle::from_address_unchecked(payload) };
                    if h.log_pos() == entry {
                        h.clear_log_pos();
                    } else {
                        // Re-logged (or freed) since: neutralize.
                        unsafe { entry.store::<usize>(encode(payload, EntryKind::Dup)) };
                        cx.stats.duplicates += 1;
                    }
                    cx.stats.update_objects += 1;
                }
                // Duplicates left by cycle-breaking frees of earlier
                // cycles; their children are plain entries.
                EntryKind::Dup => cx.stats.update_objects += 1,
                EntryKind::Child => {}
                EntryKind::Link => unreachable!(),
            }
        }
    }
}

/// Stages H2 and H3: record the sliding-view cut in every mutator's live
/// update buffer, reinforce the log pointers the concurrent clearing pass
/// may have taken from pre-cut entries, then advance everyone to the
/// third stage.
pub(crate) fn reinforce_and_advance<B: RuntimeBinding>(heap: &SVRC<B>, cx: &mut CollectorContext<B>) {
    debug_assert!(cx.reinforce_list.is_none());
    {
        let mut reg = heap.registry().lock().unwrap();
        heap.set_global_stage(Stage::Cut);
        cx.reinforce_list = reg.dead.reinforce.take();
    }

    handshake_all(heap, |m| {
        if m.stage() == Stage::Cut {
            return true;
        }
        if m.cant_coop() {
            return false;
        }
        let resume = suspend_unless_self(m);
        debug_assert_eq!(m.stage(), Stage::Initiate);
        if m.cant_coop() {
            if resume {
                B::Threads::resume(m.tls);
            }
            return false;
        }

        // Mark the cut and leave the buffer with the mutator; it keeps
        // logging past the mark. The buffers are chained for the
        // reinforcement pass instead of re-walking the thread ring.
        m.update_log.record_cut();
        store_reserved(
            m.update_log.start_chunk(),
            REINFORCE_IDX,
            cx.reinforce_list.map_or(0, |a| a.as_usize()),
        );
        cx.reinforce_list = Some(m.update_log.start_chunk());

        m.set_stage(Stage::Cut);
        if resume {
            B::Threads::resume(m.tls);
        }
        true
    });

    // Reinforce: restore the dirty mark of every pre-cut closer the
    // clearing pass concurrently took.
    while let Some(chunk) = cx.reinforce_list {
        cx.reinforce_list = match load_reserved(chunk, REINFORCE_IDX) {
            0 => None,
            raw => Some(unsafe { Address::from_usize(raw) }),
        };
        let limit = unsafe { Address::from_usize(load_reserved(chunk, LAST_POS_IDX)) };
        for (kind, entry, payload) in ForwardWalk::new(chunk, limit) {
            match kind {
                EntryKind::Closer => {
                    let h = unsafe { Handle::from_address_unchecked(payload) };
                    if !h.is_logged() {
                        h.set_log_pos(entry);
                    }
                }
                EntryKind::Child => {}
                EntryKind::Dup | EntryKind::Link => unreachable!(),
            }
        }
    }

    // Third handshake: voluntary cooperation or suspension.
    {
        let _reg = heap.registry().lock().unwrap();
        heap.set_global_stage(Stage::Reinforce);
    }
    handshake_all(heap, |m| {
        if m.stage() == Stage::Reinforce {
            return true;
        }
        debug_assert_eq!(m.stage(), Stage::Cut);
        if m
            .stage_cooperated
            .compare_exchange(
                Stage::Reinforce as u8,
                COOPERATED_NONE,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Relaxed,
            )
            .is_ok()
        {
            m.set_stage(Stage::Reinforce);
            return true;
        }
        if m.cant_coop() {
            return false;
        }
        let resume = suspend_unless_self(m);
        if m.cant_coop() {
            if resume {
                B::Threads::resume(m.tls);
            }
            return false;
        }
        m.stage_cooperated
            .store(COOPERATED_NONE, atomic::Ordering::Relaxed);
        m.set_stage(Stage::Reinforce);
        if resume {
            B::Threads::resume(m.tls);
        }
        true
    });
}

fn set_local<B: RuntimeBinding>(heap: &SVRC<B>, cx: &mut CollectorContext<B>, h: Handle) {
    if !cx.locals_bmp.get(h) {
        cx.locals_bmp.set(h);
        cx.rc.inc(h);
        cx.unique_locals
            .as_mut()
            .unwrap()
            .log_handle(heap.chunk_pool(), h);
        cx.stats.locals += 1;
    }
}

/// Conservative filter for a register or stack word: a handle, a body
/// pointer, or a scalar.
fn snoop_word<B: RuntimeBinding>(heap: &SVRC<B>, cx: &mut CollectorContext<B>, word: Address) {
    if let Some(h) = is_valid_handle(word) {
        set_local(heap, cx, h);
    } else if let Some(h) = handle_from_body(word) {
        set_local(heap, cx, h);
    }
}

/// Stage H4: consolidate the roots. Snoops the runtime's global roots and
/// every mutator's registers and stack, drops the snoop flags, steals the
/// snoop buffers, and merges everything into the unique-locals buffer
/// gated by the locals bitmap so each handle contributes one reference
/// count at most.
pub(crate) fn consolidate<B: RuntimeBinding>(
    heap: &SVRC<B>,
    cx: &mut CollectorContext<B>,
    kind: CollectionKind,
) {
    if kind == CollectionKind::Tracing {
        crate::plan::tracing::trace_setup(heap, cx);
    }

    cx.unique_locals = Some(LogBuffer::new(heap.chunk_pool(), false));

    B::Roots::scan_global_roots(|h| set_local(heap, cx, h));
    cx.stats.globals = cx.stats.locals;
    cx.stats.locals = 0;

    debug_assert!(cx.stolen_snoop.is_none());
    {
        let mut reg = heap.registry().lock().unwrap();
        heap.set_global_stage(Stage::Consolidate);
        cx.stolen_snoop = reg.dead.snoop.take();
    }

    handshake_all(heap, |m| {
        if m.stage() == Stage::Consolidate {
            return true;
        }
        if m.cant_coop() {
            return false;
        }
        while cx.preallocated.is_empty() {
            cx.preallocated.push(LogBuffer::new(heap.chunk_pool(), false));
        }
        let resume = suspend_unless_self(m);
        debug_assert_eq!(m.stage(), Stage::Reinforce);
        if m.cant_coop() {
            if resume {
                B::Threads::resume(m.tls);
            }
            return false;
        }

        m.snoop.store(false, atomic::Ordering::Release);

        // Local roots: captured registers and the runtime stack.
        B::Threads::scan_thread_words(m.tls, |w| snoop_word(heap, cx, w));

        if m.snoop_log.is_modified() {
            m.snoop_log.seal();
            push_onto_list(&mut cx.stolen_snoop, m.snoop_log.start_chunk());
            m.snoop_log = cx.preallocated.pop().unwrap();
        }

        m.set_stage(Stage::Consolidate);
        if resume {
            B::Threads::resume(m.tls);
        }
        true
    });

    // Values snooped by the write barriers since H1 count as locals too.
    let mut list = cx.stolen_snoop.take();
    while let Some(chunk) = list {
        list = list_next(chunk);
        for (kind, _, payload) in BackwardWalk::of_sealed(chunk, Some(heap.chunk_pool())) {
            debug_assert_eq!(kind, EntryKind::Child);
            debug_assert!(is_valid_handle(payload).is_some());
            let h = unsafe { Handle::from_address_unchecked(payload) };
            set_local(heap, cx, h);
            cx.stats.snooped += 1;
        }
    }
}
