//! Thin wrappers around the anonymous page mapping syscalls.  All
//! address space used by the allocator flows through this module,
//! which also maintains mapping counters for observability.
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Snapshot of the mapping counters.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MapStats {
    pub total_mapped: usize,
    pub total_unmapped: usize,
    pub current_mapped: usize,
    pub peak_mapped: usize,
    pub map_count: u32,
    pub unmap_count: u32,
    pub map_failures: u32,
    pub unmap_failures: u32,
}

static TOTAL_MAPPED: AtomicUsize = AtomicUsize::new(0);
static TOTAL_UNMAPPED: AtomicUsize = AtomicUsize::new(0);
static CURRENT_MAPPED: AtomicUsize = AtomicUsize::new(0);
static PEAK_MAPPED: AtomicUsize = AtomicUsize::new(0);
static MAP_COUNT: AtomicU32 = AtomicU32::new(0);
static UNMAP_COUNT: AtomicU32 = AtomicU32::new(0);
static MAP_FAILURES: AtomicU32 = AtomicU32::new(0);
static UNMAP_FAILURES: AtomicU32 = AtomicU32::new(0);

fn page_size_or_default() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        // Fall back to the common 4K page when the query fails.
        4096
    } else {
        ret as usize
    }
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_default();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Rounds `size` up to the next multiple of the page size.
pub fn align_to_page(size: usize) -> usize {
    let page = page_size();
    let rem = size % page;

    if rem == 0 {
        size
    } else {
        size + (page - rem)
    }
}

fn update_peak(current: usize) {
    let mut peak = PEAK_MAPPED.load(Ordering::Relaxed);
    while current > peak {
        match PEAK_MAPPED.compare_exchange_weak(
            peak,
            current,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(observed) => peak = observed,
        }
    }
}

/// Attempts to map a fresh region of `size` bytes.
///
/// The region is page-aligned, readable, writable, zero-filled, and
/// private to the process.  The `size` argument must be a positive
/// multiple of the page size.
///
/// # Errors
///
/// Returns `Err(errno)` when the underlying mapping call fails; no
/// partial region is ever returned.
pub fn acquire(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        MAP_FAILURES.fetch_add(1, Ordering::Relaxed);
        return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(0));
    }

    MAP_COUNT.fetch_add(1, Ordering::Relaxed);
    TOTAL_MAPPED.fetch_add(size, Ordering::Relaxed);
    let current = CURRENT_MAPPED.fetch_add(size, Ordering::Relaxed) + size;
    update_peak(current);

    // mmap(NULL, ...) never returns the zero page.
    Ok(NonNull::new(base).expect("mapped region must not be NULL"))
}

/// Releases a region of `size` bytes starting at `base`.
///
/// The region must have been obtained from `acquire` and `size` must
/// be a multiple of the page size.
pub fn release(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe { libc::munmap(base.as_ptr(), size) };

    if ret != 0 {
        UNMAP_FAILURES.fetch_add(1, Ordering::Relaxed);
        return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(0));
    }

    UNMAP_COUNT.fetch_add(1, Ordering::Relaxed);
    TOTAL_UNMAPPED.fetch_add(size, Ordering::Relaxed);
    CURRENT_MAPPED.fetch_sub(size, Ordering::Relaxed);
    Ok(())
}

/// Returns a snapshot of the mapping counters.
pub fn map_stats() -> MapStats {
    MapStats {
        total_mapped: TOTAL_MAPPED.load(Ordering::Relaxed),
        total_unmapped: TOTAL_UNMAPPED.load(Ordering::Relaxed),
        current_mapped: CURRENT_MAPPED.load(Ordering::Relaxed),
        peak_mapped: PEAK_MAPPED.load(Ordering::Relaxed),
        map_count: MAP_COUNT.load(Ordering::Relaxed),
        unmap_count: UNMAP_COUNT.load(Ordering::Relaxed),
        map_failures: MAP_FAILURES.load(Ordering::Relaxed),
        unmap_failures: UNMAP_FAILURES.load(Ordering::Relaxed),
    }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert!(page_size().is_power_of_two());
}

#[test]
fn test_align_to_page() {
    let page = page_size();

    assert_eq!(align_to_page(1), page);
    assert_eq!(align_to_page(page), page);
    assert_eq!(align_to_page(page + 1), 2 * page);
}

// Map a region, confirm it is zero-filled and writable, then release
// it and check the counters moved.
#[test]
fn smoke_test() {
    let size = 4 * page_size();
    let before = map_stats();

    let region = acquire(size).expect("acquire should succeed");
    let bytes = region.as_ptr() as *mut u8;

    unsafe {
        assert_eq!(std::ptr::read(bytes), 0);
        assert_eq!(std::ptr::read(bytes.add(size - 1)), 0);

        std::ptr::write(bytes, 42u8);
        std::ptr::write(bytes.add(size - 1), 42u8);
    }

    release(region, size).expect("release should succeed");

    let after = map_stats();
    assert!(after.total_mapped >= before.total_mapped + size);
    assert!(after.total_unmapped >= before.total_unmapped + size);
    assert!(after.map_count > before.map_count);
    assert!(after.unmap_count > before.unmap_count);
}
