//! This module services individual allocation, release, and resize
//! calls, i.e., the majority of public calls into the allocator.
//! Every entry takes the process-wide lock once and performs its
//! whole operation under it; the `_locked` variants carry the actual
//! logic so tests can drive a private `Manager` deterministically.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ptr::NonNull;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_allocation_map;

use crate::chunk;
use crate::chunk::ChunkHeader;
use crate::chunk::HeaderVerdict;
use crate::class::SizeClass;
use crate::manager;
use crate::manager::Manager;
use crate::stats::AllocStats;
use crate::zone::ChainTooLong;
use crate::zone::Zone;
use crate::zone::MAX_CHUNK_WALK;

/// Requests beyond this size are rejected outright.
pub const MAX_ALLOC: usize = 1 << 30;

/// Attempts to allocate `size` bytes.
///
/// The returned pointer is 16-byte aligned and usable for `size`
/// bytes.  Returns null for `size == 0`, for over-limit requests, and
/// on resource exhaustion.
pub fn allocate(size: usize) -> *mut u8 {
    let mut mgr = manager::lock();

    unsafe { allocate_locked(&mut mgr, size) }
}

/// Releases a pointer previously returned by `allocate` or `resize`.
///
/// Null pointers and anything that fails the validation gauntlet are
/// silently dropped, so double frees and wild pointers are no-ops.
///
/// # Safety
///
/// A non-null `ptr` must point into memory this process may read
/// around: the gauntlet reads the candidate header just below it.
pub unsafe fn release(ptr: *mut u8) {
    let mut mgr = manager::lock();

    release_locked(&mut mgr, ptr)
}

/// Standard reallocate contract: grows or shrinks the allocation at
/// `ptr` to `size` bytes, preserving the common prefix.
///
/// # Safety
///
/// Same requirements as `release`.
pub unsafe fn resize(ptr: *mut u8, size: usize) -> *mut u8 {
    let mut mgr = manager::lock();

    resize_locked(&mut mgr, ptr, size)
}

/// Returns a snapshot of the allocator statistics, consistent as of
/// the moment the lock was acquired.
pub fn stats() -> AllocStats {
    manager::lock().stats
}

/// Counts currently allocated chunks across all zones.
pub fn leak_count() -> usize {
    let mgr = manager::lock();

    unsafe { leak_count_locked(&mgr) }
}

/// Retires every zone that holds no allocated chunk.  Returns the
/// number of zones unmapped.
pub fn cleanup() -> usize {
    let mut mgr = manager::lock();

    unsafe { mgr.reclaim_empty() }
}

/// Unmaps every zone unconditionally.
///
/// # Safety
///
/// All pointers handed out by the allocator dangle afterwards; the
/// caller asserts none of them will be touched again.
pub unsafe fn destroy_all() {
    let mut mgr = manager::lock();

    mgr.destroy_all()
}

#[ensures(ret.is_null() || chunk::is_aligned(ret as usize),
          "returned pointers are 16-byte aligned")]
#[ensures(!ret.is_null() -> debug_allocation_map::mark_allocated(ret as usize).is_ok(),
          "successful allocations are fresh or recycled, never live")]
pub(crate) unsafe fn allocate_locked(mgr: &mut Manager, size: usize) -> *mut u8 {
    if size == 0 || size > MAX_ALLOC {
        return std::ptr::null_mut();
    }

    let aligned = chunk::align_up(size);
    let class = SizeClass::of(aligned);

    let zone_ptr = match mgr.find_or_create(class, aligned) {
        Some(zone) => zone.as_ptr(),
        None => {
            mgr.stats.record_error();
            return std::ptr::null_mut();
        }
    };

    let zone = &mut *zone_ptr;
    let found = match zone.find_free(aligned) {
        Ok(found) => found,
        Err(ChainTooLong) => {
            mgr.stats.record_corruption();
            return std::ptr::null_mut();
        }
    };

    let target = match found.or_else(|| zone.carve_fresh(aligned)) {
        Some(target) => target,
        None => {
            // The routing layer promised this zone could serve the
            // request; a refusal here means the chain changed under
            // our feet.
            mgr.stats.record_corruption();
            return std::ptr::null_mut();
        }
    };

    zone.split(target, aligned);

    let header = &mut *target.as_ptr();
    header.stamp_allocated();
    mgr.stats.record_alloc(class, header.payload_size);

    header.user_ptr()
}

pub(crate) unsafe fn release_locked(mgr: &mut Manager, ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }

    // A misaligned pointer cannot have come from this allocator; do
    // not even read the candidate header.
    if !chunk::is_aligned(ptr as usize) {
        mgr.stats.record_error();
        return;
    }

    let header = ChunkHeader::from_user_ptr(ptr);
    match chunk::classify(header) {
        HeaderVerdict::Valid => {}
        HeaderVerdict::Stale => {
            mgr.stats.record_error();
            return;
        }
        HeaderVerdict::Invalid => {
            mgr.stats.record_corruption();
            return;
        }
    }

    #[cfg(any(
        all(test, feature = "check_contracts_in_tests"),
        feature = "check_contracts"
    ))]
    debug_allocation_map::mark_released(ptr as usize)
        .expect("pointers passing the gauntlet are live allocations");

    let zone_ptr = (*header).zone;
    let payload = (*header).payload_size;
    let class = (*zone_ptr).class();

    (*header).stamp_free();
    (*zone_ptr).coalesce(NonNull::new_unchecked(header));
    mgr.stats.record_free(payload);

    if class == SizeClass::Large {
        match (*zone_ptr).is_empty() {
            Ok(true) => {
                if mgr.detach(zone_ptr) {
                    let _ = Zone::destroy(NonNull::new_unchecked(zone_ptr));
                }
            }
            Ok(false) => {}
            Err(ChainTooLong) => mgr.stats.record_corruption(),
        }
    }
}

#[ensures(ret.is_null() || chunk::is_aligned(ret as usize),
          "returned pointers are 16-byte aligned")]
pub(crate) unsafe fn resize_locked(mgr: &mut Manager, ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return allocate_locked(mgr, size);
    }

    if size == 0 {
        release_locked(mgr, ptr);
        return std::ptr::null_mut();
    }

    if size > MAX_ALLOC {
        return std::ptr::null_mut();
    }

    if !chunk::is_aligned(ptr as usize) {
        mgr.stats.record_error();
        return std::ptr::null_mut();
    }

    let header = ChunkHeader::from_user_ptr(ptr);
    match chunk::classify(header) {
        HeaderVerdict::Valid => {}
        HeaderVerdict::Stale => {
            mgr.stats.record_error();
            return std::ptr::null_mut();
        }
        HeaderVerdict::Invalid => {
            mgr.stats.record_corruption();
            return std::ptr::null_mut();
        }
    }

    let zone_ptr = (*header).zone;
    let class = (*zone_ptr).class();
    let aligned = chunk::align_up(size);
    let old_payload = (*header).payload_size;

    if old_payload >= aligned {
        // Shrink in place.  LARGE chunks keep their full payload: a
        // remainder in a single-chunk zone could never be reused.
        if class != SizeClass::Large {
            (*zone_ptr).split(NonNull::new_unchecked(header), aligned);
        }

        mgr.stats
            .record_resize(old_payload, (*header).payload_size);
        return ptr;
    }

    if class != SizeClass::Large {
        let next = (*header).next;
        if !next.is_null()
            && (*next).is_free()
            && old_payload + chunk::HEADER_SIZE + (*next).payload_size >= aligned
            && (*zone_ptr).absorb_next(header)
        {
            (*zone_ptr).split(NonNull::new_unchecked(header), aligned);
            mgr.stats
                .record_resize(old_payload, (*header).payload_size);
            return ptr;
        }
    }

    // Cannot grow in place: move the payload to a fresh allocation.
    let fresh = allocate_locked(mgr, size);
    if fresh.is_null() {
        return std::ptr::null_mut();
    }

    std::ptr::copy_nonoverlapping(ptr, fresh, std::cmp::min(old_payload, size));
    release_locked(mgr, ptr);

    fresh
}

pub(crate) unsafe fn leak_count_locked(mgr: &Manager) -> usize {
    let mut leaks = 0;

    for class in SizeClass::ALL.iter().copied() {
        let bound = mgr.zone_count(class) as usize + 1;
        let mut zone = mgr.head(class);
        let mut zone_steps = 0;

        while !zone.is_null() && zone_steps <= bound {
            if !Zone::validate(zone) {
                break;
            }

            let mut cur = (*zone).first;
            let mut steps = 0;

            while !cur.is_null() && steps < MAX_CHUNK_WALK {
                if (*cur).is_allocated() {
                    leaks += 1;
                }
                cur = (*cur).next;
                steps += 1;
            }

            zone = (*zone).next;
            zone_steps += 1;
        }
    }

    leaks
}
