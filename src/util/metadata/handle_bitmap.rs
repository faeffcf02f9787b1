//! Side bitmaps at handle granularity.
//!
//! Handles are 8-byte aligned, so a 1-bit-per-handle table costs one byte
//! per 64 heap bytes and a 2-bit table one byte per 32 heap bytes. The
//! tables are reserved and committed out of heap and are touched only by
//! the collector thread during the update/reclaim stages; accesses are
//! plain loads and stores.
//!
//! The 2-bit table holds saturating reference counts: value
//! [`MAX_RC`] is absorbing under both increment and decrement.

use crate::util::constants::{LOG_BITS_IN_BYTE, LOG_HANDLE_GRAIN};
use crate::util::conversions::raw_align_up_page;
use crate::util::memory;
use crate::util::Address;
use crate::util::Handle;

/// The saturating RC ceiling of a 2-bit counter.
pub const MAX_RC: u8 = 3;

/// Bits selecting the bit position of a handle inside one byte of a
/// 1-bit table.
const H1_FIELD_BITS: usize = LOG_BITS_IN_BYTE as usize;
const H1_BYTE_SHIFT: usize = LOG_HANDLE_GRAIN as usize + H1_FIELD_BITS;

/// A 2-bit field selector covers 4 handles per byte.
const H2_FIELD_BITS: usize = 2;
const H2_BYTE_SHIFT: usize = LOG_HANDLE_GRAIN as usize + H2_FIELD_BITS;

/// A 1-bit-per-handle bitmap (used for the ZCT membership and locals
/// marks).
pub struct HandleBitmap {
    map: Address,
    map_size: usize,
    base: Address,
}

impl HandleBitmap {
    /// Create a bitmap covering `heap_size` bytes starting at
    /// `heap_start`.
    pub fn new(heap_start: Address, heap_size: usize) -> Self {
        let map_size = raw_align_up_page(heap_size >> H1_BYTE_SHIFT);
        HandleBitmap {
            map: memory::reserve_and_commit(map_size),
            map_size,
            base: heap_start,
        }
    }

    fn byte_of(&self, h: Handle) -> *mut u8 {
        debug_assert!(h.to_address() >= self.base);
        let idx = (h.to_address() - self.base) >> H1_BYTE_SHIFT;
        debug_assert!(idx < self.map_size);
        (self.map + idx).to_mut_ptr::<u8>()
    }

    fn bit_of(h: Handle) -> u8 {
        (h.to_address() >> LOG_HANDLE_GRAIN as usize) as u8 & ((1 << H1_FIELD_BITS) - 1)
    }

    pub fn get(&self, h: Handle) -> bool {
        unsafe { *self.byte_of(h) >> Self::bit_of(h) & 1 != 0 }
    }

    pub fn set(&self, h: Handle) {
        unsafe { *self.byte_of(h) |= 1 << Self::bit_of(h) }
    }

    pub fn clear(&self, h: Handle) {
        unsafe { *self.byte_of(h) &= !(1 << Self::bit_of(h)) }
    }

    /// Clear the whole byte holding this handle's bit. This also resets
    /// the bits of the 7 neighbouring handles, so it is only sound when
    /// every bit is being turned off anyway.
    pub fn clear_byte(&self, h: Handle) {
        unsafe { *self.byte_of(h) = 0 }
    }

    /// Drop the table's backing store; the next [`recommit`] observes an
    /// all-zero table.
    pub fn decommit(&self) {
        memory::decommit(self.map, self.map_size).expect("bitmap decommit failed");
    }

    pub fn recommit(&self) {
        memory::commit(self.map, self.map_size).expect("bitmap commit failed");
    }
}

/// The 2-bit-per-handle saturating reference-count table.
pub struct RcBitmap {
    map: Address,
    map_size: usize,
    base: Address,
}

impl RcBitmap {
    pub fn new(heap_start: Address, heap_size: usize) -> Self {
        let map_size = raw_align_up_page(heap_size >> H2_BYTE_SHIFT);
        RcBitmap {
            map: memory::reserve_and_commit(map_size),
            map_size,
            base: heap_start,
        }
    }

    fn byte_of(&self, h: Handle) -> *mut u8 {
        debug_assert!(h.to_address() >= self.base);
        let idx = (h.to_address() - self.base) >> H2_BYTE_SHIFT;
        debug_assert!(idx < self.map_size);
        (self.map + idx).to_mut_ptr::<u8>()
    }

    fn shift_of(h: Handle) -> u8 {
        ((h.to_address() >> LOG_HANDLE_GRAIN as usize) as u8 & ((1 << H2_FIELD_BITS) - 1)) * 2
    }

    pub fn get(&self, h: Handle) -> u8 {
        unsafe { *self.byte_of(h) >> Self::shift_of(h) & 0b11 }
    }

    fn put(&self, h: Handle, val: u8) {
        debug_assert!(val <= MAX_RC);
        let shift = Self::shift_of(h);
        unsafe {
            let b = self.byte_of(h);
            *b = (*b & !(0b11 << shift)) | (val << shift);
        }
    }

    /// Increment the count, saturating at [`MAX_RC`].
    pub fn inc(&self, h: Handle) {
        self.inc_rv(h);
    }

    /// Increment the count, saturating at [`MAX_RC`]; returns the
    /// previous value.
    pub fn inc_rv(&self, h: Handle) -> u8 {
        let prev = self.get(h);
        if prev < MAX_RC {
            self.put(h, prev + 1);
        }
        prev
    }

    /// Decrement the count; a stuck counter stays stuck. Returns the
    /// previous value, which must be positive.
    pub fn dec(&self, h: Handle) -> u8 {
        let prev = self.get(h);
        debug_assert!(prev > 0, "RC underflow for {:?}", h);
        if prev < MAX_RC {
            self.put(h, prev - 1);
        }
        prev
    }

    /// Force the counter to the absorbing value.
    pub fn stuck(&self, h: Handle) {
        self.put(h, MAX_RC);
    }

    pub fn clear(&self, h: Handle) {
        self.put(h, 0);
    }

    /// Bulk-zero the whole table by dropping and re-committing its
    /// backing store.
    pub fn bulk_zero(&self) {
        memory::decommit(self.map, self.map_size).expect("rc bitmap decommit failed");
        memory::commit(self.map, self.map_size).expect("rc bitmap commit failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::{BYTES_IN_PAGE, HANDLE_GRAIN};

    fn handle_at(base: Address, i: usize) -> Handle {
        Handle::from_address(base + i * HANDLE_GRAIN).unwrap()
    }

    #[test]
    fn one_bit_set_get_clear() {
        let base = memory::reserve_and_commit(BYTES_IN_PAGE);
        let bmp = HandleBitmap::new(base, BYTES_IN_PAGE);
        for i in 0..16 {
            let h = handle_at(base, i);
            assert!(!bmp.get(h));
            bmp.set(h);
            assert!(bmp.get(h));
        }
        let h3 = handle_at(base, 3);
        bmp.clear(h3);
        assert!(!bmp.get(h3));
        assert!(bmp.get(handle_at(base, 2)));
        assert!(bmp.get(handle_at(base, 4)));
        // clear_byte wipes all 8 neighbours
        bmp.clear_byte(handle_at(base, 0));
        for i in 0..8 {
            assert!(!bmp.get(handle_at(base, i)));
        }
        assert!(bmp.get(handle_at(base, 8)));
    }

    #[test]
    fn two_bit_counts_saturate() {
        let base = memory::reserve_and_commit(BYTES_IN_PAGE);
        let bmp = RcBitmap::new(base, BYTES_IN_PAGE);
        let h = handle_at(base, 5);
        assert_eq!(bmp.get(h), 0);
        assert_eq!(bmp.inc_rv(h), 0);
        assert_eq!(bmp.inc_rv(h), 1);
        assert_eq!(bmp.inc_rv(h), 2);
        assert_eq!(bmp.get(h), MAX_RC);
        // saturated: neither inc nor dec moves the value
        assert_eq!(bmp.inc_rv(h), MAX_RC);
        assert_eq!(bmp.get(h), MAX_RC);
        assert_eq!(bmp.dec(h), MAX_RC);
        assert_eq!(bmp.get(h), MAX_RC);
        // neighbours unaffected
        assert_eq!(bmp.get(handle_at(base, 4)), 0);
        assert_eq!(bmp.get(handle_at(base, 6)), 0);
    }

    #[test]
    fn two_bit_dec_reaches_zero() {
        let base = memory::reserve_and_commit(BYTES_IN_PAGE);
        let bmp = RcBitmap::new(base, BYTES_IN_PAGE);
        let h = handle_at(base, 9);
        bmp.inc(h);
        bmp.inc(h);
        assert_eq!(bmp.dec(h), 2);
        assert_eq!(bmp.dec(h), 1);
        assert_eq!(bmp.get(h), 0);
    }

    #[test]
    fn bulk_zero_resets() {
        let base = memory::reserve_and_commit(BYTES_IN_PAGE);
        let bmp = RcBitmap::new(base, BYTES_IN_PAGE);
        let h = handle_at(base, 1);
        bmp.inc(h);
        bmp.inc(h);
        bmp.bulk_zero();
        assert_eq!(bmp.get(h), 0);
    }
}
