//! The collector context and the cycle driver.
//!
//! One collection cycle runs the four-stage handshake, then either RC
//! updating and reclamation or the backup trace-and-sweep, then the
//! post-cycle root processing and the adaptive strategy update.

use std::marker::PhantomData;
use std::time::Instant;

use crate::plan::handshake;
use crate::plan::log_buffer::LogBuffer;
use crate::plan::rc;
use crate::plan::tracing;
use crate::svrc::SVRC;
use crate::util::constants::*;
use crate::util::memory;
use crate::util::metadata::{HandleBitmap, RcBitmap};
use crate::util::{Address, Handle};
use crate::vm::RuntimeBinding;

/// The two collection modes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CollectionKind {
    Tracing = 0,
    Rc = 1,
}

/// How many recent cycle times feed each mode's moving average.
pub const N_SAMPLES: usize = 4;

/// Counters for one cycle, published to [`crate::svrc::Stats`] when the
/// cycle ends.
#[derive(Default, Clone, Copy)]
pub struct CycleStats {
    pub update_objects: usize,
    pub create_objects: usize,
    pub snooped: usize,
    pub locals: usize,
    pub globals: usize,
    pub duplicates: usize,
    pub cycles_broken: usize,
    pub in_zct: usize,
    pub freed: usize,
    pub bytes_freed: usize,
    pub traced: usize,
    pub objects_allocated: usize,
    pub bytes_allocated: usize,
}

/// An explicit worklist for recursive deletion and tracing, grown by
/// doubling through fresh reserve-and-commit mappings so deep object
/// graphs cannot overflow the native stack.
pub(crate) struct MarkStack {
    base: Address,
    sp: Address,
    top: Address,
}

impl MarkStack {
    fn new(bytes: usize) -> MarkStack {
        let bytes = crate::util::conversions::raw_align_up_page(bytes);
        let base = memory::reserve_and_commit(bytes);
        MarkStack {
            base,
            sp: base,
            top: base + bytes,
        }
    }

    pub(crate) fn push(&mut self, h: Handle) {
        if self.sp == self.top {
            self.grow();
        }
        unsafe { self.sp.store::<usize>(h.to_address().as_usize()) };
        self.sp += BYTES_IN_WORD;
    }

    pub(crate) fn pop(&mut self) -> Option<Handle> {
        if self.sp == self.base {
            return None;
        }
        self.sp -= BYTES_IN_WORD;
        let raw = unsafe { self.sp.load::<usize>() };
        Some(unsafe { Handle::from_address_unchecked(Address::from_usize(raw)) })
    }

    #[cold]
    fn grow(&mut self) {
        let old_bytes = self.top - self.base;
        let new_bytes = old_bytes * 2;
        let new_base = memory::reserve_and_commit(new_bytes);
        unsafe {
            std::ptr::copy_nonoverlapping::<u8>(
                self.base.to_ptr(),
                new_base.to_mut_ptr(),
                old_bytes,
            );
        }
        memory::unreserve(self.base, old_bytes).expect("mark stack unreserve failed");
        self.sp = new_base + old_bytes;
        self.base = new_base;
        self.top = new_base + new_bytes;
    }
}

/// The collector's working state, owned by whichever thread is running a
/// cycle (the collector thread, or a requesting mutator before the
/// collector thread has been started).
pub struct CollectorContext<B: RuntimeBinding> {
    pub(crate) rc: RcBitmap,
    pub(crate) zct_bmp: HandleBitmap,
    pub(crate) locals_bmp: HandleBitmap,
    /// Handles whose RC dropped to zero; carried into the next cycle.
    pub(crate) zct_log: LogBuffer,
    pub(crate) unique_locals: Option<LogBuffer>,
    /// Replacement buffers handed to mutators when theirs are stolen.
    /// Topped up before every suspension so the swap never allocates.
    pub(crate) preallocated: Vec<LogBuffer>,
    pub(crate) stolen_update: Option<Address>,
    pub(crate) stolen_create: Option<Address>,
    pub(crate) stolen_snoop: Option<Address>,
    pub(crate) reinforce_list: Option<Address>,
    pub(crate) mark_stack: MarkStack,
    /// Scratch for replica capture during RC update and tracing.
    pub(crate) replica: Vec<Handle>,
    run_hist: [[u64; N_SAMPLES]; 2],
    next_kind: CollectionKind,
    rng: u64,
    pub(crate) stats: CycleStats,
    _p: PhantomData<B>,
}

impl<B: RuntimeBinding> CollectorContext<B> {
    pub(crate) fn new(
        heap_start: Address,
        heap_size: usize,
        pool: &crate::plan::log_buffer::ChunkPool,
    ) -> CollectorContext<B> {
        CollectorContext {
            rc: RcBitmap::new(heap_start, heap_size),
            zct_bmp: HandleBitmap::new(heap_start, heap_size),
            locals_bmp: HandleBitmap::new(heap_start, heap_size),
            zct_log: LogBuffer::new(pool, false),
            unique_locals: None,
            preallocated: Vec::with_capacity(2),
            stolen_update: None,
            stolen_create: None,
            stolen_snoop: None,
            reinforce_list: None,
            mark_stack: MarkStack::new(heap_size / 0x100),
            replica: Vec::new(),
            run_hist: [[0; N_SAMPLES]; 2],
            next_kind: CollectionKind::Rc,
            rng: 0x5eed_1234_5678_9abc,
            stats: CycleStats::default(),
            _p: PhantomData,
        }
    }

    fn next_random(&mut self) -> f64 {
        // xorshift64*; good enough to pick between two modes.
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        (x.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 11) as f64 / (1u64 << 53) as f64
    }

    fn record_run(&mut self, kind: CollectionKind, millis: u64) {
        let hist = &mut self.run_hist[kind as usize];
        for i in (0..N_SAMPLES - 1).rev() {
            hist[i + 1] = hist[i];
        }
        hist[0] = millis.max(1);
    }

    /// Pick the next cycle's mode with probability inversely
    /// proportional to each mode's recent average time. A mode with no
    /// history yet gets tried.
    fn recommend_kind(&mut self, recommend_only_rc: bool) -> CollectionKind {
        if recommend_only_rc {
            return CollectionKind::Rc;
        }
        let mut avg = [0f64; 2];
        for t in 0..2 {
            let mut n = 0;
            for &sample in &self.run_hist[t] {
                if sample == 0 {
                    break;
                }
                avg[t] += sample as f64;
                n += 1;
            }
            if n > 0 {
                avg[t] /= n as f64;
            }
        }
        if avg[CollectionKind::Tracing as usize] < 0.001 {
            return CollectionKind::Tracing;
        }
        if avg[CollectionKind::Rc as usize] < 0.001 {
            return CollectionKind::Rc;
        }
        // Normalize so that prob ~ 1/avg and prob[0] + prob[1] == 1.
        let norm = (avg[0] * avg[1]) / (avg[0] + avg[1]);
        let prob_tracing = norm / avg[0];
        if self.next_random() < prob_tracing {
            CollectionKind::Tracing
        } else {
            CollectionKind::Rc
        }
    }
}

/// Run one full collection cycle.
pub(crate) fn collect<B: RuntimeBinding>(heap: &SVRC<B>, cx: &mut CollectorContext<B>) {
    let start = Instant::now();
    let shared = heap.shared();
    shared.set_gc_active(true);

    let mut kind = cx.next_kind;
    cx.next_kind = CollectionKind::Rc;
    if shared.take_user_sync() {
        kind = CollectionKind::Tracing;
    }
    if shared.take_mem_stress() {
        kind = CollectionKind::Tracing;
    }
    if *heap.options.use_only_tracing_gc {
        kind = CollectionKind::Tracing;
    }
    if *heap.options.use_only_rc_gc {
        kind = CollectionKind::Rc;
    }

    let was_free = heap.free_blocks();
    cx.stats = CycleStats::default();

    info!(
        "----- start gc({}, {:?}), {} free blocks -----",
        shared.cycle(),
        kind,
        was_free
    );

    handshake::initiate(heap, cx);
    handshake::clear_dirty_marks(heap, cx);
    handshake::reinforce_and_advance(heap, cx);
    handshake::consolidate(heap, cx, kind);

    match kind {
        CollectionKind::Rc => {
            rc::update_reference_counters(heap, cx);
            rc::reclaim_garbage(heap, cx);
        }
        CollectionKind::Tracing => {
            tracing::trace(heap, cx);
            tracing::sweep(heap, cx);
            // The ZCT bitmap was dropped by the trace setup; bring it
            // back (zeroed) for the post-cycle root processing.
            cx.zct_bmp.recommit();
        }
    }

    rc::process_locals_into_next_zct(heap, cx);

    let millis = start.elapsed().as_millis() as u64;
    cx.record_run(kind, millis);

    // Strategy for the next cycle. The trigger is a free-block count: a
    // cycle that ended short of the low-water mark raises it so the next
    // collection starts sooner, and a cycle with slack beyond the mark
    // relaxes it.
    let total = heap.block_manager().total_blocks();
    let now_free = heap.free_blocks();
    let trig_high = shared.trig_high();
    let delta = *heap.options.low_trig_delta * total / 100;
    let low_mark = trig_high + delta;
    let failed = now_free < low_mark;
    if failed {
        let raised = trig_high + *heap.options.raise_trig_inc * total / 100;
        shared.set_trig_high(raised.min(total));
    } else if now_free > low_mark + delta {
        shared
            .set_trig_high(trig_high.saturating_sub(*heap.options.lower_trig_dec * total / 100));
    }

    // Memory stress raised while this cycle was already running means
    // some allocation had to wait on us; the next cycle is pinned to
    // tracing unless the configuration forbids recommending it.
    let got_into_sync = shared.mem_stress();
    cx.next_kind = if (got_into_sync || failed) && !*heap.options.recommend_only_rc_gc {
        CollectionKind::Tracing
    } else {
        cx.recommend_kind(*heap.options.recommend_only_rc_gc)
    };

    debug!(
        "gc({}) {:?} took {} ms: freed {} ({} bytes), next={:?}, trig={}, free={} (was {})",
        shared.cycle(),
        kind,
        millis,
        cx.stats.freed,
        cx.stats.bytes_freed,
        cx.next_kind,
        shared.trig_high(),
        now_free,
        was_free,
    );

    heap.publish_cycle_stats(kind, &cx.stats);
    shared.set_gc_active(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;

    #[test]
    fn mark_stack_grows_by_doubling() {
        let mut stack = MarkStack::new(BYTES_IN_PAGE);
        let n = 3 * BYTES_IN_PAGE / BYTES_IN_WORD;
        for i in 1..=n {
            let h = unsafe {
                Handle::from_address_unchecked(Address::from_usize(i * HANDLE_GRAIN))
            };
            stack.push(h);
        }
        for i in (1..=n).rev() {
            let h = stack.pop().unwrap();
            assert_eq!(h.to_address().as_usize(), i * HANDLE_GRAIN);
        }
        assert!(stack.pop().is_none());
    }
}
