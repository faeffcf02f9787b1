//! The API a language runtime calls into.
//!
//! Functions here either take the [`SVRC`] instance explicitly or a
//! [`Mutator`] bound to it. The expected life cycle is: `svrc_init`, then
//! `bind_mutator` per thread, `start_collector_thread` once the runtime
//! can take upcalls, and `alloc`/write-barrier calls from then on.

use crate::heap::block::Block;
use crate::heap::size_class::{N_BINS, SIZE_CLASSES};
use crate::plan::barriers::log_new_handle;
pub use crate::plan::barriers::{array_write, global_write, object_write, static_write};
use crate::plan::Mutator;
use crate::svrc::SVRC;
use crate::util::address::HANDLE_BYTES;
use crate::util::constants::*;
use crate::util::options::Options;
use crate::util::{memory, Address, Handle, VMMutatorThread};
use crate::vm::{Collection, RuntimeBinding};

/// Create and initialize an SVRC instance for a heap of `heap_mb`
/// megabytes. The caller keeps the box alive for the process lifetime
/// (bindings usually leak it into a static).
pub fn svrc_init<B: RuntimeBinding>(heap_mb: usize, options: Options) -> Box<SVRC<B>> {
    crate::util::logger::try_init();
    Box::new(SVRC::new(heap_mb, options))
}

/// Register the current thread as a mutator.
pub fn bind_mutator<B: RuntimeBinding>(
    svrc: &'static SVRC<B>,
    tls: VMMutatorThread,
) -> Box<Mutator<B>> {
    svrc.bind_mutator(tls)
}

/// Unregister a mutator; its logs are handed to the collector and its
/// allocation lists parked for the next thread.
pub fn destroy_mutator<B: RuntimeBinding>(svrc: &SVRC<B>, mutator: Box<Mutator<B>>) {
    svrc.destroy_mutator(mutator);
}

/// A designated safepoint: let the mutator catch up with the collector's
/// current handshake stage.
pub fn cooperate<B: RuntimeBinding>(mutator: &Mutator<B>) {
    mutator.cooperate();
}

/// Spawn the collector thread. Allocation works before this is called,
/// with collections running synchronously on the allocating thread.
pub fn start_collector_thread<B: RuntimeBinding>(svrc: &'static SVRC<B>) {
    svrc.start_collector_thread();
}

/// Allocate an object with a zeroed body of `body_size` bytes. The
/// returned handle has its methods record installed and is already
/// logged in the mutator's create buffer. Returns `None` after the
/// out-of-memory protocol has run its course.
pub fn alloc<B: RuntimeBinding>(
    mutator: &mut Mutator<B>,
    methods: Address,
    body_size: usize,
) -> Option<Handle> {
    let heap = mutator.heap;
    let total = HANDLE_BYTES + body_size;

    if total <= MAX_CHUNK_ALLOC {
        let bin = SIZE_CLASSES.bin_for(total);
        let chunk = {
            let fast = mutator.alloc_lists[bin].pop();
            match fast {
                Some(a) => a,
                None => {
                    let slow = heap.chunk_manager().alloc_small(
                        heap.block_manager(),
                        &mut mutator.alloc_lists[bin],
                        || heap.pressure_sync_gc(),
                    );
                    heap.check_gc();
                    match slow {
                        Some(a) => a,
                        None => {
                            warn!("out of memory allocating {} bytes", total);
                            B::Collection::out_of_memory(mutator.tls.0);
                            return None;
                        }
                    }
                }
            }
        };
        let h = unsafe { Handle::from_address_unchecked(chunk) };
        if body_size > 0 {
            memory::zero(chunk + HANDLE_BYTES, body_size);
        }
        h.init_header(methods);
        mutator.counters.objects_allocated += 1;
        mutator.counters.bytes_allocated += SIZE_CLASSES.rounded_size(total);
        log_new_handle(mutator, h);
        Some(h)
    } else {
        let mut head: Option<Block> = None;
        for _ in 0..3 {
            if let Some(b) = heap.block_manager().alloc_region(total) {
                head = Some(b);
                break;
            }
            heap.pressure_sync_gc();
        }
        let head = match head {
            Some(b) => b,
            None => {
                warn!("out of memory allocating {} byte region", total);
                B::Collection::out_of_memory(mutator.tls.0);
                return None;
            }
        };
        heap.check_gc();

        let h = head.big_handle();
        memory::zero(h.to_address() + HANDLE_BYTES, body_size);
        h.init_header(methods);
        mutator.counters.objects_allocated += 1;
        mutator.counters.bytes_allocated += head.blob_size() * BYTES_IN_BLOCK;
        log_new_handle(mutator, h);
        // Only now may a sweep reclaim the region on its own terms.
        head.set_alloc_in_progress(false);
        Some(h)
    }
}

/// Explicit (user-requested) collection; waits for the cycle to finish.
pub fn handle_user_collection_request<B: RuntimeBinding>(svrc: &SVRC<B>) {
    svrc.request_sync_gc();
}

/// Trigger a collection without waiting.
pub fn request_async_gc<B: RuntimeBinding>(svrc: &SVRC<B>) {
    svrc.request_async_gc();
}

/// Total managed memory in bytes.
pub fn total_bytes<B: RuntimeBinding>(svrc: &SVRC<B>) -> usize {
    svrc.total_bytes()
}

/// Free memory in bytes (block-manager blocks plus partial-block slack).
pub fn free_bytes<B: RuntimeBinding>(svrc: &SVRC<B>) -> crate::svrc::FreeBytes {
    svrc.free_bytes()
}

/// Per-bin count of blocks on the partial lists.
pub fn partial_block_counts<B: RuntimeBinding>(svrc: &SVRC<B>) -> [usize; N_BINS] {
    let mut out = [0; N_BINS];
    for (i, (blocks, _)) in svrc.chunk_manager().partial_stats().iter().enumerate() {
        out[i] = *blocks;
    }
    out
}
