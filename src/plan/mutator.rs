//! Per-mutator collector state.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::heap::chunk_manager::AllocList;
use crate::heap::size_class::N_BINS;
use crate::plan::log_buffer::LogBuffer;
use crate::svrc::SVRC;
use crate::util::VMMutatorThread;
use crate::vm::RuntimeBinding;

/// The handshake stages a mutator advances through during one collection
/// cycle. `Consolidate` (the fourth stage) is zero so that threads and
/// the collector both start in it between cycles.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    /// H4: roots consolidated; the quiescent inter-cycle stage.
    Consolidate = 0,
    /// H1: buffers stolen, snooping on.
    Initiate = 1,
    /// H2: the sliding-view cut has been recorded.
    Cut = 2,
    /// H3: the reinforcement pass is visible to this mutator.
    Reinforce = 3,
}

impl From<u8> for Stage {
    fn from(v: u8) -> Stage {
        match v {
            0 => Stage::Consolidate,
            1 => Stage::Initiate,
            2 => Stage::Cut,
            3 => Stage::Reinforce,
            _ => unreachable!("invalid stage {}", v),
        }
    }
}

/// Sentinel for "no voluntary cooperation pending".
pub(crate) const COOPERATED_NONE: u8 = 0xff;

/// Per-cycle mutator-local counters, drained by the collector at the
/// first handshake.
#[derive(Default)]
pub(crate) struct MutatorCounters {
    pub bytes_allocated: usize,
    pub objects_allocated: usize,
}

/// A mutator's collector context: its allocation lists, its three write
/// buffers, and its handshake state.
///
/// The mutator thread owns this structure. The collector reads and
/// writes it only while the thread is suspended (or while it is parked
/// in a synchronous-collection wait), which is what makes the raw
/// accesses in the handshake sound.
pub struct Mutator<B: RuntimeBinding> {
    pub(crate) tls: VMMutatorThread,
    pub(crate) heap: &'static SVRC<B>,
    pub(crate) alloc_lists: [AllocList; N_BINS],
    pub(crate) update_log: LogBuffer,
    pub(crate) create_log: LogBuffer,
    pub(crate) snoop_log: LogBuffer,
    /// New reference values are appended to the snoop log while raised.
    pub(crate) snoop: AtomicBool,
    /// Raised across regions the collector must not suspend the thread
    /// in (mid-logging, mostly), to keep buffer framing intact.
    pub(crate) cant_coop: AtomicBool,
    stage: AtomicU8,
    pub(crate) stage_cooperated: AtomicU8,
    pub(crate) counters: MutatorCounters,
}

impl<B: RuntimeBinding> Mutator<B> {
    pub(crate) fn new(
        heap: &'static SVRC<B>,
        tls: VMMutatorThread,
        alloc_lists: [AllocList; N_BINS],
        initial_stage: Stage,
        snoop: bool,
    ) -> Mutator<B> {
        Mutator {
            tls,
            heap,
            alloc_lists,
            update_log: LogBuffer::new(heap.chunk_pool(), true),
            create_log: LogBuffer::new(heap.chunk_pool(), true),
            snoop_log: LogBuffer::new(heap.chunk_pool(), true),
            snoop: AtomicBool::new(snoop),
            cant_coop: AtomicBool::new(false),
            stage: AtomicU8::new(initial_stage as u8),
            stage_cooperated: AtomicU8::new(COOPERATED_NONE),
            counters: MutatorCounters::default(),
        }
    }

    pub fn tls(&self) -> VMMutatorThread {
        self.tls
    }

    pub(crate) fn stage(&self) -> Stage {
        self.stage.load(Ordering::Acquire).into()
    }

    pub(crate) fn set_stage(&self, s: Stage) {
        self.stage.store(s as u8, Ordering::Release);
    }

    pub(crate) fn cant_coop(&self) -> bool {
        self.cant_coop.load(Ordering::Acquire)
    }

    pub(crate) fn set_cant_coop(&self, v: bool) {
        self.cant_coop.store(v, Ordering::Release);
    }

    /// Voluntarily advance towards the collector's current stage at a
    /// designated safepoint. Only the third handshake has a voluntary
    /// fast path; the others transition under collector-initiated
    /// suspension.
    pub fn cooperate(&self) {
        debug_assert!(!self.cant_coop());
        self.set_cant_coop(true);
        let global = self.heap.global_stage();
        let own = self.stage();
        let coop = self.stage_cooperated.load(Ordering::Relaxed);
        if own != global && coop != global as u8 {
            if global == Stage::Reinforce {
                debug_assert_eq!(own, Stage::Cut);
                let res = self.stage_cooperated.compare_exchange(
                    COOPERATED_NONE,
                    Stage::Reinforce as u8,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                debug_assert!(res.is_ok());
            }
        }
        self.set_cant_coop(false);
    }
}
