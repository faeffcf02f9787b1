//! The `SVRC` instance: the single process-wide heap value that owns the
//! block manager, the chunk manager, the collector state, and the
//! options, passed explicitly to every API entry point.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::heap::block;
use crate::heap::chunk_manager::AllocList;
use crate::heap::size_class::N_BINS;
use crate::heap::{BlockManager, ChunkManager};
use crate::plan::gc_requester::GcRequester;
use crate::plan::global::{collect, CollectionKind, CollectorContext, CycleStats};
use crate::plan::log_buffer::{push_onto_list, store_reserved, ChunkPool, REINFORCE_IDX};
use crate::plan::mutator::{Mutator, Stage};
use crate::util::constants::*;
use crate::util::options::Options;
use crate::util::VMMutatorThread;
use crate::vm::RuntimeBinding;

/// Buffers of detached threads, spliced into the collector's lists at
/// the matching handshake of the next cycle. Guarded by the registry
/// lock.
#[derive(Default)]
pub(crate) struct DeadBuffers {
    pub update: Option<crate::util::Address>,
    pub create: Option<crate::util::Address>,
    pub snoop: Option<crate::util::Address>,
    pub reinforce: Option<crate::util::Address>,
}

pub(crate) struct MutatorPtr<B: RuntimeBinding>(pub *mut Mutator<B>);

// The pointers are only dereferenced by the collector while the owning
// thread is suspended or parked; the registry itself is Mutex-guarded.
unsafe impl<B: RuntimeBinding> Send for MutatorPtr<B> {}

pub(crate) struct Registry<B: RuntimeBinding> {
    mutators: Vec<MutatorPtr<B>>,
    pub(crate) dead: DeadBuffers,
    parked_alloc_lists: Vec<[AllocList; N_BINS]>,
}

impl<B: RuntimeBinding> Registry<B> {
    pub(crate) fn mutator_ptrs(&self) -> impl Iterator<Item = *mut Mutator<B>> + '_ {
        self.mutators.iter().map(|p| p.0)
    }
}

/// Collector state shared between mutators and the collector thread.
pub(crate) struct CollectorShared {
    stage: AtomicU8,
    gc_active: AtomicBool,
    mem_stress: AtomicBool,
    usr_sync: AtomicBool,
    /// The allocation trigger: an asynchronous cycle starts when fewer
    /// free blocks than this remain.
    trig_high: AtomicUsize,
    cycle: AtomicUsize,
    collector_running: AtomicBool,
}

impl CollectorShared {
    pub(crate) fn stage(&self) -> Stage {
        self.stage.load(Ordering::Acquire).into()
    }

    pub(crate) fn gc_active(&self) -> bool {
        self.gc_active.load(Ordering::Relaxed)
    }

    pub(crate) fn set_gc_active(&self, v: bool) {
        self.gc_active.store(v, Ordering::Release);
    }

    pub(crate) fn mem_stress(&self) -> bool {
        self.mem_stress.load(Ordering::Relaxed)
    }

    pub(crate) fn raise_mem_stress(&self) {
        self.mem_stress.store(true, Ordering::Release);
    }

    pub(crate) fn take_mem_stress(&self) -> bool {
        self.mem_stress.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn take_user_sync(&self) -> bool {
        self.usr_sync.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn trig_high(&self) -> usize {
        self.trig_high.load(Ordering::Relaxed)
    }

    pub(crate) fn set_trig_high(&self, v: usize) {
        self.trig_high.store(v, Ordering::Relaxed);
    }

    pub(crate) fn cycle(&self) -> usize {
        self.cycle.load(Ordering::Acquire)
    }

    pub(crate) fn collector_running(&self) -> bool {
        self.collector_running.load(Ordering::Acquire)
    }
}

/// Exposed statistics.
pub struct Stats {
    pub total_objects_allocated: AtomicUsize,
    pub total_bytes_allocated: AtomicUsize,
    pub total_objects_freed: AtomicUsize,
    pub total_bytes_freed: AtomicUsize,
    last: Mutex<Option<(CollectionKind, CycleStats)>>,
}

impl Stats {
    fn new() -> Stats {
        Stats {
            total_objects_allocated: AtomicUsize::new(0),
            total_bytes_allocated: AtomicUsize::new(0),
            total_objects_freed: AtomicUsize::new(0),
            total_bytes_freed: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    /// The mode and counters of the most recent completed cycle.
    pub fn last_cycle(&self) -> Option<(CollectionKind, CycleStats)> {
        *self.last.lock().unwrap()
    }
}

/// Free memory decomposed the way the meters report it.
#[derive(Debug, Clone, Copy)]
pub struct FreeBytes {
    /// Bytes in blocks held by the block manager (wilderness included).
    pub block_bytes: usize,
    /// Free bytes scattered across partial blocks.
    pub partial_bytes: usize,
}

impl FreeBytes {
    pub fn total(&self) -> usize {
        self.block_bytes + self.partial_bytes
    }
}

/// An SVRC instance.
pub struct SVRC<B: RuntimeBinding> {
    pub options: Options,
    block_manager: BlockManager,
    chunk_manager: ChunkManager,
    pool: ChunkPool,
    registry: Mutex<Registry<B>>,
    requester: GcRequester,
    collector: Mutex<CollectorContext<B>>,
    shared: CollectorShared,
    pub stats: Stats,
}

pub(crate) fn fresh_alloc_lists() -> [AllocList; N_BINS] {
    std::array::from_fn(AllocList::new)
}

impl<B: RuntimeBinding> SVRC<B> {
    pub(crate) fn new(heap_mb: usize, mut options: Options) -> SVRC<B> {
        options.read_env_var_settings();

        let block_manager = BlockManager::new(heap_mb);
        let chunk_manager = ChunkManager::new(heap_mb);
        let pool = ChunkPool::new();
        let collector = CollectorContext::new(
            block::heap_start(),
            heap_mb << LOG_BYTES_IN_MBYTE as usize,
            &pool,
        );
        let total_blocks = block_manager.total_blocks();
        let trig_high = *options.initial_high_trig_mark * total_blocks / 100;

        SVRC {
            options,
            block_manager,
            chunk_manager,
            pool,
            registry: Mutex::new(Registry {
                mutators: Vec::new(),
                dead: DeadBuffers::default(),
                parked_alloc_lists: Vec::new(),
            }),
            requester: GcRequester::new(),
            collector: Mutex::new(collector),
            shared: CollectorShared {
                stage: AtomicU8::new(Stage::Consolidate as u8),
                gc_active: AtomicBool::new(false),
                mem_stress: AtomicBool::new(false),
                usr_sync: AtomicBool::new(false),
                trig_high: AtomicUsize::new(trig_high),
                cycle: AtomicUsize::new(0),
                collector_running: AtomicBool::new(false),
            },
            stats: Stats::new(),
        }
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    pub fn chunk_manager(&self) -> &ChunkManager {
        &self.chunk_manager
    }

    pub(crate) fn chunk_pool(&self) -> &ChunkPool {
        &self.pool
    }

    pub(crate) fn registry(&self) -> &Mutex<Registry<B>> {
        &self.registry
    }

    pub(crate) fn shared(&self) -> &CollectorShared {
        &self.shared
    }

    pub(crate) fn global_stage(&self) -> Stage {
        self.shared.stage()
    }

    pub(crate) fn set_global_stage(&self, s: Stage) {
        self.shared.stage.store(s as u8, Ordering::Release);
    }

    /// The number of completed collection cycles.
    pub fn cycles(&self) -> usize {
        self.shared.cycle()
    }

    /// Blocks available for the trigger arithmetic.
    pub fn free_blocks(&self) -> usize {
        self.block_manager.free_blocks(*self.options.list_blk_worth)
    }

    /// Check the allocation trigger after taking blocks from the block
    /// manager.
    pub(crate) fn check_gc(&self) {
        if self.free_blocks() < self.shared.trig_high() {
            self.request_async_gc();
        }
    }

    /// Check the write-buffer trigger after handing a chunk to a
    /// mutator.
    pub(crate) fn check_buffer_trigger(&self) {
        if self.pool.user_chunks() >= *self.options.user_buff_trig && !self.shared.gc_active() {
            debug!(
                "{} user buffer chunks, triggering async gc",
                self.pool.user_chunks()
            );
            self.request_async_gc();
        }
    }

    /// Wake the collector thread for an asynchronous cycle. A no-op
    /// while a cycle already runs or before the collector thread exists.
    pub fn request_async_gc(&self) {
        if self.shared.collector_running() && !self.shared.gc_active() {
            self.requester.request();
        }
    }

    /// Request a collection and wait for it to finish. Synchronous
    /// requests pin the cycle to tracing mode. Before the collector
    /// thread is started the cycle runs inline on the calling thread,
    /// which must be at a safepoint.
    pub fn request_sync_gc(&self) {
        self.shared.usr_sync.store(true, Ordering::Release);
        if self.shared.collector_running() {
            let was = self.shared.cycle();
            self.requester.request();
            self.requester
                .wait_for_cycle_change(|| self.shared.cycle(), was);
        } else {
            self.collect_now();
        }
    }

    /// Raise memory pressure and run a synchronous collection. Used by
    /// the allocation slow paths; always returns true (retry).
    pub(crate) fn pressure_sync_gc(&self) -> bool {
        self.shared.raise_mem_stress();
        self.request_sync_gc();
        true
    }

    /// Run one collection cycle on the current thread.
    pub fn collect_now(&self) {
        let mut cx = self.collector.lock().unwrap();
        collect(self, &mut cx);
        self.shared.cycle.fetch_add(1, Ordering::Release);
        self.requester.notify_cycle_done();
    }

    /// Spawn the dedicated collector thread. Its priority is picked by
    /// host CPU count from the `uni_prio`/`multi_prio` options.
    pub fn start_collector_thread(&'static self) {
        if self.shared.collector_running.swap(true, Ordering::AcqRel) {
            return;
        }
        std::thread::Builder::new()
            .name("svrc-collector".to_string())
            .spawn(move || {
                let prio = if num_cpus::get() > 1 {
                    *self.options.multi_prio
                } else {
                    *self.options.uni_prio
                };
                // Map the 1..10 priority scale onto niceness; highest
                // priority becomes niceness 0.
                let nice = (10 - prio).clamp(0, 19);
                let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
                if rc != 0 {
                    debug!(
                        "could not set collector thread priority: {}",
                        std::io::Error::last_os_error()
                    );
                }
                info!("collector thread running (niceness {})", nice);
                loop {
                    self.requester.wait_for_request();
                    self.pool.reset_user_chunks();
                    self.collect_now();
                }
            })
            .expect("failed to spawn the collector thread");
    }

    /// Register a mutator thread. A parked set of allocation lists from
    /// a detached thread is adopted when available; the mutator starts
    /// at the collector's current stage.
    pub fn bind_mutator(&'static self, tls: VMMutatorThread) -> Box<Mutator<B>> {
        let mut mutator = {
            // Buffers are taken from the pool before the registry lock.
            let stage = self.global_stage();
            let snoop = stage != Stage::Consolidate;
            Box::new(Mutator::new(self, tls, fresh_alloc_lists(), stage, snoop))
        };
        let mut reg = self.registry.lock().unwrap();
        if let Some(lists) = reg.parked_alloc_lists.pop() {
            mutator.alloc_lists = lists;
        }
        // Re-read under the lock: the stage cannot move while we hold it.
        let stage = self.global_stage();
        mutator.set_stage(stage);
        mutator
            .snoop
            .store(stage != Stage::Consolidate, Ordering::Release);
        reg.mutators.push(MutatorPtr(&mut *mutator as *mut _));
        drop(reg);
        debug!("mutator attached at stage {:?}", stage);
        mutator
    }

    /// Unregister a mutator: park its allocation lists for reuse and
    /// splice its buffers into the dead-thread lists the collector will
    /// drain next cycle.
    pub fn destroy_mutator(&self, mut mutator: Box<Mutator<B>>) {
        let mut reg = self.registry.lock().unwrap();

        let lists = std::mem::replace(&mut mutator.alloc_lists, fresh_alloc_lists());
        reg.parked_alloc_lists.push(lists);

        mutator.create_log.seal();
        push_onto_list(&mut reg.dead.create, mutator.create_log.start_chunk());
        mutator.update_log.seal();
        push_onto_list(&mut reg.dead.update, mutator.update_log.start_chunk());
        mutator.snoop_log.seal();
        push_onto_list(&mut reg.dead.snoop, mutator.snoop_log.start_chunk());

        // Between the first and second handshakes the update buffer is
        // also due for reinforcement.
        if mutator.stage() == Stage::Initiate {
            store_reserved(
                mutator.update_log.start_chunk(),
                REINFORCE_IDX,
                reg.dead.reinforce.map_or(0, |a| a.as_usize()),
            );
            reg.dead.reinforce = Some(mutator.update_log.start_chunk());
        }

        let ptr = &mut *mutator as *mut Mutator<B>;
        reg.mutators.retain(|p| p.0 != ptr);
        drop(reg);
        debug!("mutator detached");
    }

    /// (allocated, used, free) write-buffer chunk counts.
    pub fn buffer_chunks(&self) -> (usize, usize, usize) {
        self.pool.counts()
    }

    /// Total managed heap bytes.
    pub fn total_bytes(&self) -> usize {
        self.block_manager.total_blocks() * BYTES_IN_BLOCK
    }

    /// Free bytes, decomposed into block-manager blocks and partial
    /// blocks.
    pub fn free_bytes(&self) -> FreeBytes {
        let (wilderness, lists, _) = self.block_manager.counts();
        let partial_bytes: usize = self
            .chunk_manager
            .partial_stats()
            .iter()
            .map(|(_, bytes)| bytes)
            .sum();
        FreeBytes {
            block_bytes: (wilderness + lists) * BYTES_IN_BLOCK,
            partial_bytes,
        }
    }

    pub(crate) fn publish_cycle_stats(&self, kind: CollectionKind, stats: &CycleStats) {
        self.stats
            .total_objects_allocated
            .fetch_add(stats.objects_allocated, Ordering::Relaxed);
        self.stats
            .total_bytes_allocated
            .fetch_add(stats.bytes_allocated, Ordering::Relaxed);
        self.stats
            .total_objects_freed
            .fetch_add(stats.freed, Ordering::Relaxed);
        self.stats
            .total_bytes_freed
            .fetch_add(stats.bytes_freed, Ordering::Relaxed);
        *self.stats.last.lock().unwrap() = Some((kind, *stats));
    }
}
