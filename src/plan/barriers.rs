//! Write-barrier entry points.
//!
//! Every reference store in the runtime funnels through one of these.
//! The first store into an object since the last sliding-view cut
//! captures the object's pre-update replica into the mutator's update
//! buffer and publishes it through the object's log pointer; while
//! snooping is enabled, every new non-null value is appended to the snoop
//! buffer, with one word re-reserved so the next append can never fail to
//! commit.

use crate::plan::log_buffer::{encode, EntryKind};
use crate::plan::Mutator;
use crate::util::{Address, Handle};
use crate::vm::{ObjectModel, RuntimeBinding};

/// Store `value` into a reference field of `object`.
pub fn object_write<B: RuntimeBinding>(
    mutator: &mut Mutator<B>,
    object: Handle,
    slot: Address,
    value: Option<Handle>,
) {
    mutator.set_cant_coop(true);
    if !object.is_logged() && B::Model::has_reference_slots(object) {
        log_object_slow(mutator, object);
    }
    unsafe { slot.store::<usize>(value.map_or(0, |h| h.to_address().as_usize())) };
    snoop_and_uncoop(mutator, value);
}

/// Store `value` into an element of a reference array. Arrays log the
/// same way as objects.
pub fn array_write<B: RuntimeBinding>(
    mutator: &mut Mutator<B>,
    array: Handle,
    slot: Address,
    value: Option<Handle>,
) {
    object_write(mutator, array, slot, value);
}

/// Store `value` into a class-level static reference slot. Statics are
/// roots: there is no containing object to log, but new values are still
/// snooped.
pub fn static_write<B: RuntimeBinding>(
    mutator: &mut Mutator<B>,
    slot: Address,
    value: Option<Handle>,
) {
    global_write(mutator, slot, value);
}

/// Store `value` into a runtime-global root slot.
pub fn global_write<B: RuntimeBinding>(
    mutator: &mut Mutator<B>,
    slot: Address,
    value: Option<Handle>,
) {
    mutator.set_cant_coop(true);
    unsafe { slot.store::<usize>(value.map_or(0, |h| h.to_address().as_usize())) };
    snoop_and_uncoop(mutator, value);
}

#[inline]
fn snoop_and_uncoop<B: RuntimeBinding>(mutator: &mut Mutator<B>, value: Option<Handle>) {
    match value {
        Some(v) if mutator.snoop.load(atomic::Ordering::Relaxed) => {
            mutator
                .snoop_log
                .push_word_unchecked(encode(v.to_address(), EntryKind::Child));
            // Re-reserve one word while still uncooperative: the thread
            // must never be suspended holding the chunk pool's lock.
            let pool = mutator.heap.chunk_pool();
            let grew = mutator.snoop_log.reserve_word(pool, true);
            mutator.set_cant_coop(false);
            if grew {
                mutator.heap.check_buffer_trigger();
            }
        }
        _ => mutator.set_cant_coop(false),
    }
}

/// Capture the object's pre-update replica: all current non-null
/// reference children, then the closing containing-handle entry, then
/// (only if the log pointer is still null) publish by storing the
/// closer's address into it. Losing the publish race discards the
/// replica; the winner's entries stand.
#[cold]
fn log_object_slow<B: RuntimeBinding>(mutator: &mut Mutator<B>, object: Handle) {
    let needed = B::Model::reference_slot_count(object) + 1;
    if needed > mutator.update_log.available_words() {
        let pool = mutator.heap.chunk_pool();
        mutator.update_log.grow(pool, true);
        debug_assert!(needed <= mutator.update_log.available_words());
        mutator.heap.check_buffer_trigger();
    }

    let mut p = mutator.update_log.pos();
    B::Model::scan_object(object, |slot| {
        let child = unsafe { slot.load::<usize>() };
        if child != 0 {
            unsafe { p.store::<usize>(child) };
            p += crate::util::constants::BYTES_IN_WORD;
        }
    });

    if !object.is_logged() {
        unsafe { p.store::<usize>(encode(object.to_address(), EntryKind::Closer)) };
        object.set_log_pos(p);
        mutator.update_log.set_pos(p + crate::util::constants::BYTES_IN_WORD);
    }
}

/// Log a freshly created handle into the create buffer: the handle's own
/// address, with the log pointer set to the entry. The collector
/// replicates children at cycle end; none are logged here.
pub(crate) fn log_new_handle<B: RuntimeBinding>(mutator: &mut Mutator<B>, h: Handle) {
    mutator.set_cant_coop(true);
    let pos = mutator.create_log.pos();
    mutator
        .create_log
        .push_word_unchecked(encode(h.to_address(), EntryKind::Child));
    h.set_log_pos(pos);
    let pool = mutator.heap.chunk_pool();
    let grew = mutator.create_log.reserve_word(pool, true);
    mutator.set_cant_coop(false);
    if grew {
        mutator.heap.check_buffer_trigger();
    }
}
