use crate::util::Address;
use libc::c_void;

/// An opaque pointer handed to SVRC by the runtime. SVRC never
/// dereferences it; it only passes it back through the
/// [`crate::vm::RuntimeBinding`] traits so the runtime knows the context.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OpaquePointer(*mut c_void);

unsafe impl Sync for OpaquePointer {}
unsafe impl Send for OpaquePointer {}

impl Default for OpaquePointer {
    fn default() -> Self {
        Self::UNINITIALIZED
    }
}

impl OpaquePointer {
    pub const UNINITIALIZED: Self = Self(std::ptr::null_mut());

    pub fn from_address(addr: Address) -> Self {
        OpaquePointer(addr.to_mut_ptr::<c_void>())
    }

    pub fn to_address(self) -> Address {
        Address::from_mut_ptr(self.0)
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// A VMThread is an opaque pointer that uniquely identifies a thread in
/// the runtime. A binding may use thread pointers or thread IDs as
/// VMThreads; SVRC makes no assumption beyond identity comparison.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VMThread(pub OpaquePointer);

impl VMThread {
    pub const UNINITIALIZED: Self = Self(OpaquePointer::UNINITIALIZED);
}

/// A VMMutatorThread is a VMThread that is associated with a
/// [`crate::plan::Mutator`].
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VMMutatorThread(pub VMThread);
