//! The interface SVRC consumes from the language runtime.
//!
//! A runtime that uses SVRC implements [`RuntimeBinding`] and its four
//! associated traits. SVRC trusts the binding to supply reference-slot
//! layout per class, a safe suspend/resume primitive, register and stack
//! snapshots of suspended threads, and the global root set. All SVRC core
//! types are generic over the binding.

use crate::util::{Address, Handle, VMMutatorThread, VMThread};

/// A runtime binding. The four associated types mirror the facets of the
/// runtime the collector needs.
pub trait RuntimeBinding: 'static + Send + Sync + Sized {
    type Model: ObjectModel<Self>;
    type Threads: Threads<Self>;
    type Roots: Roots<Self>;
    type Collection: Collection<Self>;
}

/// Per-class object layout, keyed off the methods record stored in every
/// handle.
pub trait ObjectModel<B: RuntimeBinding> {
    /// Visit the address of every reference slot in the object's body.
    /// Slots hold either a handle address or null.
    fn scan_object<F: FnMut(Address)>(object: Handle, visitor: F);

    /// Whether objects of this class have any reference slots at all.
    /// Objects without reference slots are never logged by the write
    /// barrier.
    fn has_reference_slots(object: Handle) -> bool;

    /// An upper bound on the number of reference slots of the object;
    /// used to reserve buffer space before replica capture.
    fn reference_slot_count(object: Handle) -> usize;

    /// The body size in bytes (excluding the handle header); used for
    /// accounting only.
    fn body_size(object: Handle) -> usize;
}

/// Thread control. Suspension must only ever be requested for threads
/// outside their uncooperative regions; SVRC checks the flag, the binding
/// performs the stop.
pub trait Threads<B: RuntimeBinding> {
    /// Suspend a mutator thread at an arbitrary point and capture its
    /// register state. Must not be called for the current thread.
    fn suspend(t: VMMutatorThread);

    /// Resume a thread previously suspended by [`Threads::suspend`].
    fn resume(t: VMMutatorThread);

    /// Visit every word of the suspended thread's captured registers and
    /// runtime stack. The visitor conservatively filters the words, so
    /// scalars and interior pointers are fine to report.
    fn scan_thread_words<F: FnMut(Address)>(t: VMMutatorThread, visitor: F);

    /// The current thread.
    fn current() -> VMThread;
}

/// Enumeration of the runtime's global roots: class tables, interned
/// strings, monitor caches, global reference frames.
pub trait Roots<B: RuntimeBinding> {
    /// Visit every global root as an exact handle.
    fn scan_global_roots<F: FnMut(Handle)>(visitor: F);
}

/// Collection-related upcalls.
pub trait Collection<B: RuntimeBinding> {
    /// An allocation failed even after synchronous collections. The
    /// allocation entry point returns null after this upcall; the
    /// binding decides whether to raise a language-level OOM or abort.
    fn out_of_memory(tls: VMThread);
}
