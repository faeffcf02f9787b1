use atomic::Atomic;
use bytemuck::NoUninit;

use std::fmt;
use std::num::NonZeroUsize;
use std::ops::*;
use std::sync::atomic::Ordering;

use crate::util::constants::{BYTES_IN_WORD, HANDLE_GRAIN};

/// size in bytes
pub type ByteSize = usize;

/// Address represents an arbitrary address. This is designed to represent
/// address and do address arithmetic mostly in a safe way, and to allow
/// marking some operations as unsafe. This type needs to be zero overhead
/// (memory wise and time wise). The idea is from the paper
/// High-level Low-level Programming (VEE09) and JikesRVM.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct Address(usize);

impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

impl AddAssign<ByteSize> for Address {
    fn add_assign(&mut self, offset: ByteSize) {
        self.0 += offset;
    }
}

impl Sub<ByteSize> for Address {
    type Output = Address;
    fn sub(self, offset: ByteSize) -> Address {
        Address(self.0 - offset)
    }
}

impl SubAssign<ByteSize> for Address {
    fn sub_assign(&mut self, offset: ByteSize) {
        self.0 -= offset;
    }
}

/// Address - Address (the first address must be higher)
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(
            self.0 >= other.0,
            "for (addr_a - addr_b), a({}) needs to be larger than b({})",
            self,
            other
        );
        self.0 - other.0
    }
}

impl BitAnd<usize> for Address {
    type Output = usize;
    fn bitand(self, other: usize) -> usize {
        self.0 & other
    }
}

impl Shr<usize> for Address {
    type Output = usize;
    fn shr(self, shift: usize) -> usize {
        self.0 >> shift
    }
}

impl Address {
    /// The lowest possible address.
    pub const ZERO: Self = Address(0);

    /// creates Address from a pointer
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    /// creates Address from a mutable pointer
    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    /// creates a null Address (0)
    /// # Safety
    /// The zero address should only be used as an uninitialized or
    /// sentinel value in performance critical code.
    pub const unsafe fn zero() -> Address {
        Address(0)
    }

    /// creates an arbitrary Address
    /// # Safety
    /// The caller must be aware that they may create an invalid address.
    pub const unsafe fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    /// Get the word offset between two addresses (self must be higher).
    pub fn diff_words(self, other: Address) -> usize {
        (self - other) >> crate::util::constants::LOG_BYTES_IN_WORD as usize
    }

    /// align up to `align` bytes, which must be a power of two
    pub const fn align_up(self, align: ByteSize) -> Address {
        Address((self.0 + align - 1) & !(align - 1))
    }

    /// align down to `align` bytes, which must be a power of two
    pub const fn align_down(self, align: ByteSize) -> Address {
        Address(self.0 & !(align - 1))
    }

    /// is this address aligned to `align` bytes
    pub const fn is_aligned_to(self, align: ByteSize) -> bool {
        self.0 % align == 0
    }

    /// is this address zero?
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// converts the Address to a raw usize
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// converts the Address to a pointer
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// converts the Address to a mutable pointer
    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// converts the Address to a Rust reference
    ///
    /// # Safety
    /// The caller must guarantee the address actually points to a Rust
    /// object of `T`, and that no aliasing rules are violated.
    pub unsafe fn as_ref<'a, T>(self) -> &'a T {
        &*self.to_mut_ptr()
    }

    /// loads a value of type T from the address
    /// # Safety
    /// This could throw a segment fault if the address is invalid.
    pub unsafe fn load<T: Copy>(self) -> T {
        *(self.0 as *mut T)
    }

    /// stores a value of type T to the address
    /// # Safety
    /// This could throw a segment fault if the address is invalid.
    pub unsafe fn store<T>(self, value: T) {
        *(self.0 as *mut T) = value;
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The number of words in a handle header.
pub const HANDLE_WORDS: usize = 3;
/// The handle header size in bytes: body pointer, methods pointer, log
/// pointer.
pub const HANDLE_BYTES: usize = HANDLE_WORDS * BYTES_IN_WORD;

const BODY_OFFSET: usize = 0;
const METHODS_OFFSET: usize = BYTES_IN_WORD;
const LOG_POS_OFFSET: usize = 2 * BYTES_IN_WORD;

/// `Handle` is the per-object prefix every managed object starts with. It
/// always holds the non-zero, 8-byte-aligned address of the header. The
/// header is three words: a pointer to the object body, a pointer to the
/// per-class method/layout record, and the log pointer the collector uses
/// as the object's dirty flag.
///
/// The underlying `NonZeroUsize` type ensures `Option<Handle>` is the same
/// size as `Handle` itself.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct Handle(NonZeroUsize);

impl Handle {
    /// Wrap a raw handle address. Returns `None` for a null address.
    pub fn from_address(addr: Address) -> Option<Handle> {
        debug_assert!(addr.is_aligned_to(HANDLE_GRAIN) || addr.is_zero());
        NonZeroUsize::new(addr.as_usize()).map(Handle)
    }

    /// Wrap a raw handle address known to be non-null.
    ///
    /// # Safety
    /// `addr` must be non-zero and 8-byte aligned.
    pub unsafe fn from_address_unchecked(addr: Address) -> Handle {
        debug_assert!(!addr.is_zero());
        Handle(NonZeroUsize::new_unchecked(addr.as_usize()))
    }

    /// The address of the handle header.
    pub fn to_address(self) -> Address {
        unsafe { Address::from_usize(self.0.get()) }
    }

    /// The address of the first body word.
    pub fn body(self) -> Address {
        unsafe { (self.to_address() + BODY_OFFSET).load::<Address>() }
    }

    /// The per-class method/layout record.
    pub fn methods(self) -> Address {
        unsafe { (self.to_address() + METHODS_OFFSET).load::<Address>() }
    }

    /// Initialize the header of a freshly allocated handle. The body
    /// starts right after the header.
    ///
    /// The log-pointer word is left untouched: on a chunk it still holds
    /// the free-list link, which keeps a concurrent sweep from treating
    /// the half-born object as dead. The create-buffer logging that
    /// immediately follows every allocation overwrites it.
    pub fn init_header(self, methods: Address) {
        unsafe {
            (self.to_address() + BODY_OFFSET).store::<Address>(self.to_address() + HANDLE_BYTES);
            (self.to_address() + METHODS_OFFSET).store::<Address>(methods);
        }
    }

    fn log_pos_atomic(self) -> &'static Atomic<Address> {
        unsafe { (self.to_address() + LOG_POS_OFFSET).as_ref::<Atomic<Address>>() }
    }

    /// The log pointer, or `Address::ZERO` when the handle is clean. A
    /// non-zero value points at the handle's closer entry in some update
    /// or create buffer.
    pub fn log_pos(self) -> Address {
        self.log_pos_atomic().load(Ordering::Relaxed)
    }

    /// Is the handle logged in some buffer since the last sliding-view
    /// cut?
    pub fn is_logged(self) -> bool {
        !self.log_pos().is_zero()
    }

    pub fn set_log_pos(self, pos: Address) {
        self.log_pos_atomic().store(pos, Ordering::Release);
    }

    pub fn clear_log_pos(self) {
        self.log_pos_atomic().store(Address::ZERO, Ordering::Release);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align() {
        let a = unsafe { Address::from_usize(0x123) };
        assert_eq!(a.align_down(0x100), unsafe { Address::from_usize(0x100) });
        assert_eq!(a.align_up(0x100), unsafe { Address::from_usize(0x200) });
        assert!(!a.is_aligned_to(8));
        assert!(a.align_up(8).is_aligned_to(8));
    }

    #[test]
    fn handle_header_roundtrip() {
        let mut backing = [0usize; HANDLE_WORDS + 4];
        let addr = Address::from_mut_ptr(backing.as_mut_ptr());
        let h = Handle::from_address(addr).unwrap();
        h.init_header(unsafe { Address::from_usize(0xdead0) });
        assert_eq!(h.body(), addr + HANDLE_BYTES);
        assert_eq!(h.methods().as_usize(), 0xdead0);
        assert!(!h.is_logged());
        h.set_log_pos(addr + 64usize);
        assert_eq!(h.log_pos(), addr + 64usize);
        h.clear_log_pos();
        assert!(!h.is_logged());
    }
}
