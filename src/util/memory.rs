//! Raw memory operations: a reserve/commit layer over `mmap`.
//!
//! The collector relies on Win32-style reserve/commit semantics: heap,
//! bitmaps, buffer chunks and the mark stack are reserved up front and
//! committed (or decommitted to bulk-zero) as needed. On posix systems
//! reservation maps `PROT_NONE` with `MAP_NORESERVE`, committing flips the
//! protection, and decommitting tells the kernel to drop the pages so that
//! the next commit observes zero-filled memory.

use std::io::Result;

use crate::util::Address;

pub fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Check whether the given OS error number indicates an out-of-memory
/// condition.
pub fn is_mmap_oom(os_errno: i32) -> bool {
    os_errno == libc::ENOMEM
}

/// Reserve `size` bytes of address space without committing backing
/// store. `hint` may suggest a placement (pass `Address::ZERO` for none);
/// the kernel is free to ignore it, and the caller must check the result.
pub fn reserve(hint: Address, size: usize) -> Result<Address> {
    let ptr = unsafe {
        libc::mmap(
            hint.to_mut_ptr(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    Ok(Address::from_mut_ptr(ptr))
}

/// Commit a reserved range for read/write access. Freshly committed (or
/// recommitted after [`decommit`]) anonymous memory reads as zero.
pub fn commit(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe {
            libc::mprotect(
                start.to_mut_ptr(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        },
        0,
    )
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// Release the backing store of a committed range and make it
        /// inaccessible. The reservation itself stays intact.
        pub fn decommit(start: Address, size: usize) -> Result<()> {
            // MADV_DONTNEED on private anonymous mappings guarantees
            // zero-fill on the next touch.
            wrap_libc_call(
                &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_DONTNEED) },
                0,
            )?;
            wrap_libc_call(
                &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, libc::PROT_NONE) },
                0,
            )
        }
    } else {
        /// Release the backing store of a committed range and make it
        /// inaccessible. The reservation itself stays intact.
        pub fn decommit(start: Address, size: usize) -> Result<()> {
            // MADV_FREE does not guarantee zeroing, so remap the range.
            let ptr = unsafe {
                libc::mmap(
                    start.to_mut_ptr(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        }
    }
}

/// Unmap a reserved range entirely.
pub fn unreserve(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

/// Reserve and commit in one step, panicking on failure. Used for
/// metadata the collector cannot run without.
pub fn reserve_and_commit(size: usize) -> Address {
    let addr = reserve(Address::ZERO, size)
        .and_then(|a| commit(a, size).map(|_| a))
        .unwrap_or_else(|e| panic!("failed to map {} bytes: {}", size, e));
    addr
}

/// Set a range of memory to 0.
pub fn zero(start: Address, len: usize) {
    set(start, 0, len);
}

/// Set a range of memory to the given value. Similar to memset.
pub fn set(start: Address, val: u8, len: usize) {
    unsafe {
        std::ptr::write_bytes(start.to_mut_ptr::<u8>(), val, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;

    #[test]
    fn commit_decommit_zeroes() {
        let size = 4 * BYTES_IN_PAGE;
        let addr = reserve(Address::ZERO, size).unwrap();
        commit(addr, size).unwrap();
        unsafe {
            addr.store::<usize>(0x55aa);
            assert_eq!(addr.load::<usize>(), 0x55aa);
        }
        decommit(addr, size).unwrap();
        commit(addr, size).unwrap();
        unsafe {
            assert_eq!(addr.load::<usize>(), 0);
        }
        unreserve(addr, size).unwrap();
    }
}
