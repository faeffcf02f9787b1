//! Test support: a mock runtime binding and a shared, serialized heap
//! fixture.
//!
//! The header table and heap bounds are process globals, so all tests
//! that touch the heap share one fixture and run serialized through its
//! mutex. Tests own their root sets: install roots, run cycles, and
//! clean up so delta-based assertions stay exact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::memory_manager;
use crate::plan::Mutator;
use crate::svrc::SVRC;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::options::Options;
use crate::util::{Address, Handle, OpaquePointer, VMMutatorThread, VMThread};
use crate::vm::{Collection, ObjectModel, Roots, RuntimeBinding, Threads};

/// A class record for mock objects: the body starts with `n_refs`
/// reference slots, followed by scalar payload.
#[repr(C)]
pub struct MockClass {
    pub n_refs: usize,
    pub body_size: usize,
}

/// Leak a class record and return its address as the methods pointer.
pub fn mock_class(n_refs: usize, body_size: usize) -> Address {
    debug_assert!(n_refs * BYTES_IN_WORD <= body_size);
    let class = Box::leak(Box::new(MockClass { n_refs, body_size }));
    Address::from_ptr(class as *const MockClass)
}

fn class_of(object: Handle) -> &'static MockClass {
    unsafe { object.methods().as_ref::<MockClass>() }
}

lazy_static! {
    /// Exact global roots the mock runtime reports.
    pub static ref GLOBAL_ROOTS: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    /// Raw words the mock runtime reports as registers/stack contents.
    pub static ref STACK_WORDS: Mutex<Vec<usize>> = Mutex::new(Vec::new());
}

pub static OOM_REPORTED: AtomicBool = AtomicBool::new(false);

pub struct MockRuntime;

impl RuntimeBinding for MockRuntime {
    type Model = MockRuntime;
    type Threads = MockRuntime;
    type Roots = MockRuntime;
    type Collection = MockRuntime;
}

impl ObjectModel<MockRuntime> for MockRuntime {
    fn scan_object<F: FnMut(Address)>(object: Handle, mut visitor: F) {
        let body = object.body();
        for i in 0..class_of(object).n_refs {
            visitor(body + i * BYTES_IN_WORD);
        }
    }

    fn has_reference_slots(object: Handle) -> bool {
        class_of(object).n_refs > 0
    }

    fn reference_slot_count(object: Handle) -> usize {
        class_of(object).n_refs
    }

    fn body_size(object: Handle) -> usize {
        class_of(object).body_size
    }
}

thread_local! {
    static THREAD_MARKER: u8 = const { 0 };
}

impl Threads<MockRuntime> for MockRuntime {
    fn suspend(_t: VMMutatorThread) {
        // Fixture tests only run cycles while every mutator is parked.
    }

    fn resume(_t: VMMutatorThread) {}

    fn scan_thread_words<F: FnMut(Address)>(_t: VMMutatorThread, mut visitor: F) {
        for &word in STACK_WORDS.lock().unwrap().iter() {
            visitor(unsafe { Address::from_usize(word) });
        }
    }

    fn current() -> VMThread {
        THREAD_MARKER
            .with(|marker| VMThread(OpaquePointer::from_address(Address::from_ptr(marker))))
    }
}

impl Roots<MockRuntime> for MockRuntime {
    fn scan_global_roots<F: FnMut(Handle)>(mut visitor: F) {
        for &root in GLOBAL_ROOTS.lock().unwrap().iter() {
            visitor(unsafe { Handle::from_address_unchecked(Address::from_usize(root)) });
        }
    }
}

impl Collection<MockRuntime> for MockRuntime {
    fn out_of_memory(_tls: VMThread) {
        OOM_REPORTED.store(true, Ordering::SeqCst);
    }
}

/// The current thread as the mock runtime identifies it.
pub fn current_thread() -> VMThread {
    <MockRuntime as Threads<MockRuntime>>::current()
}

/// Heap size of the shared fixture.
pub const FIXTURE_HEAP_MB: usize = 64;

pub struct HeapFixture {
    pub heap: &'static SVRC<MockRuntime>,
    mutator: *mut Mutator<MockRuntime>,
}

unsafe impl Send for HeapFixture {}

impl HeapFixture {
    fn create() -> HeapFixture {
        let mut options = Options::default();
        // Keep cycle-mode selection deterministic under test; tracing
        // cycles are still reachable through synchronous requests.
        assert!(options.set_from_str("recommendOnlyRCGC", "1"));
        let heap: &'static SVRC<MockRuntime> =
            Box::leak(memory_manager::svrc_init(FIXTURE_HEAP_MB, options));
        let tls = VMMutatorThread(MockRuntime::current());
        let mutator = Box::leak(memory_manager::bind_mutator(heap, tls));
        HeapFixture {
            heap,
            mutator: mutator as *mut _,
        }
    }

    /// The fixture's mutator. Tests are serialized, so handing out a
    /// mutable reference from a shared fixture is fine.
    #[allow(clippy::mut_from_ref)]
    pub fn mutator(&self) -> &mut Mutator<MockRuntime> {
        unsafe { &mut *self.mutator }
    }

    /// Allocate a mock object with `n_refs` reference slots and
    /// `scalar_bytes` of scalar payload.
    pub fn alloc_obj(&self, n_refs: usize, scalar_bytes: usize) -> Handle {
        let body_size = n_refs * BYTES_IN_WORD + scalar_bytes;
        let methods = mock_class(n_refs, body_size);
        memory_manager::alloc(self.mutator(), methods, body_size).expect("fixture alloc failed")
    }

    /// Store into the `idx`-th reference slot through the write barrier.
    pub fn store_ref(&self, object: Handle, idx: usize, value: Option<Handle>) {
        debug_assert!(idx < class_of(object).n_refs);
        let slot = object.body() + idx * BYTES_IN_WORD;
        memory_manager::object_write(self.mutator(), object, slot, value);
    }

    pub fn read_ref(&self, object: Handle, idx: usize) -> Option<Handle> {
        let slot = object.body() + idx * BYTES_IN_WORD;
        Handle::from_address(unsafe { slot.load::<Address>() })
    }

    pub fn set_roots(&self, roots: &[Handle]) {
        *GLOBAL_ROOTS.lock().unwrap() = roots.iter().map(|h| h.to_address().as_usize()).collect();
    }

    pub fn clear_roots(&self) {
        GLOBAL_ROOTS.lock().unwrap().clear();
        STACK_WORDS.lock().unwrap().clear();
    }

    /// Run one reference-counting cycle inline.
    pub fn gc_rc(&self) {
        self.heap.collect_now();
    }

    /// Run one tracing cycle inline (synchronous requests pin tracing).
    pub fn gc_trace(&self) {
        self.heap.request_sync_gc();
    }

    /// Freed-object count of the last cycle.
    pub fn freed_last_cycle(&self) -> usize {
        self.heap.stats.last_cycle().map_or(0, |(_, s)| s.freed)
    }

    /// Drain all garbage left over by earlier tests: two RC cycles flush
    /// the pending ZCT, and a tracing cycle catches anything cyclic.
    pub fn quiesce(&self) {
        self.clear_roots();
        self.gc_rc();
        self.gc_rc();
        self.gc_trace();
        self.gc_rc();
    }

}

lazy_static! {
    static ref FIXTURE: Mutex<HeapFixture> = Mutex::new(HeapFixture::create());
}

/// Run a test body against the shared heap fixture, serialized against
/// all other fixture tests.
pub fn with_fixture<F: FnOnce(&HeapFixture)>(f: F) {
    let fixture = FIXTURE.lock().unwrap_or_else(|e| e.into_inner());
    f(&fixture)
}
