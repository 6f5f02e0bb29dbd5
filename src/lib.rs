//! zalloc is a drop-in replacement for the C heap allocator, built on
//! anonymous page mappings.  Requests are routed into TINY, SMALL,
//! and LARGE size classes; pooled classes carve chunks out of shared
//! zones, and every caller-supplied pointer runs a validation
//! gauntlet before any header field is trusted, so double frees and
//! wild pointers degrade to no-ops instead of corruption.
mod chunk;
mod class;
mod individual;
mod manager;
mod map;
mod report;
mod stats;
mod zone;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_allocation_map;

use std::ffi::c_void;

pub use chunk::ALIGNMENT;
pub use class::SizeClass;
pub use individual::allocate;
pub use individual::cleanup;
pub use individual::destroy_all;
pub use individual::leak_count;
pub use individual::release;
pub use individual::resize;
pub use individual::stats;
pub use individual::MAX_ALLOC;
pub use map::map_stats;
pub use map::MapStats;
pub use report::dump;
pub use stats::AllocStats;

/// Allocates `size` bytes; the standard `malloc` contract.
#[no_mangle]
pub extern "C" fn zalloc_malloc(size: usize) -> *mut c_void {
    individual::allocate(size) as *mut c_void
}

/// Frees a pointer previously returned by this allocator.  Null and
/// unrecognizable pointers are silently ignored.
///
/// # Safety
///
/// This function assumes `ptr` is NULL or points into memory the
/// process may read around; the validation gauntlet reads the
/// candidate header just below it.
#[no_mangle]
pub unsafe extern "C" fn zalloc_free(ptr: *mut c_void) {
    individual::release(ptr as *mut u8)
}

/// The standard `realloc` contract.
///
/// # Safety
///
/// Same assumptions as `zalloc_free`.
#[no_mangle]
pub unsafe extern "C" fn zalloc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    individual::resize(ptr as *mut u8, size) as *mut c_void
}

/// Writes the allocation listing to standard output.
#[no_mangle]
pub extern "C" fn zalloc_show_alloc_mem() {
    report::dump()
}

/// Fills `out` with a snapshot of the allocator statistics.  Returns
/// 0 on success, -1 when `out` is NULL.
///
/// # Safety
///
/// This function assumes `out` is NULL or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn zalloc_stats(out: *mut AllocStats) -> i32 {
    if out.is_null() {
        return -1;
    }

    *out = individual::stats();
    0
}

/// Retires every zone with no allocated chunks; returns the number of
/// zones unmapped.
#[no_mangle]
pub extern "C" fn zalloc_cleanup() -> usize {
    individual::cleanup()
}

/// Returns the number of currently allocated chunks.
#[no_mangle]
pub extern "C" fn zalloc_leak_count() -> usize {
    individual::leak_count()
}

// Interposition symbols for deployments that load this library in
// place of the platform allocator.  Off by default so binaries that
// merely link the crate, the test runner included, keep the system
// allocator for their own Rust heap.
#[cfg(feature = "libc_compat")]
mod libc_compat {
    use std::ffi::c_void;

    use crate::individual;
    use crate::report;

    #[no_mangle]
    pub extern "C" fn malloc(size: usize) -> *mut c_void {
        individual::allocate(size) as *mut c_void
    }

    /// # Safety
    ///
    /// Same assumptions as `zalloc_free`.
    #[no_mangle]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        individual::release(ptr as *mut u8)
    }

    /// # Safety
    ///
    /// Same assumptions as `zalloc_free`.
    #[no_mangle]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        individual::resize(ptr as *mut u8, size) as *mut c_void
    }

    #[no_mangle]
    pub extern "C" fn show_alloc_mem() {
        report::dump()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn c_abi_round_trip() {
        let ptr = zalloc_malloc(128);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % ALIGNMENT, 0);

        unsafe {
            std::ptr::write_bytes(ptr as *mut u8, 0x42, 128);

            let grown = zalloc_realloc(ptr, 256);
            assert!(!grown.is_null());
            assert_eq!(std::ptr::read(grown as *const u8), 0x42);

            zalloc_free(grown);
            zalloc_free(std::ptr::null_mut());
        }
    }

    #[test]
    fn c_abi_stats() {
        let mut out = AllocStats::default();

        assert_eq!(unsafe { zalloc_stats(&mut out) }, 0);
        assert_eq!(unsafe { zalloc_stats(std::ptr::null_mut()) }, -1);
    }
}
