//! The zone manager owns one singly linked zone list per size class,
//! routes requests to a zone that can serve them, and retires zones
//! whose chunks are all free.  The process-wide manager instance sits
//! behind the single mutex that serializes every public entry.
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
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::class::SizeClass;
use crate::stats::AllocStats;
use crate::zone::Zone;

/// Cap on pooled zones per class.  The LARGE list is uncapped.
#[cfg(not(feature = "test_only_small_constants"))]
pub const MAX_ZONES_PER_CLASS: u32 = 1000;
#[cfg(feature = "test_only_small_constants")]
pub const MAX_ZONES_PER_CLASS: u32 = 8;

/// Upper bound on the zone-list walk when routing a request.
pub const MAX_ZONE_SEARCH: usize = 100;

pub struct Manager {
    zones: [*mut Zone; SizeClass::COUNT],
    counts: [u32; SizeClass::COUNT],
    pub stats: AllocStats,
}

// The raw zone pointers all target mappings owned by this manager,
// and every access happens behind the global mutex.
unsafe impl Send for Manager {}

lazy_static::lazy_static! {
    static ref MANAGER: Mutex<Manager> = Mutex::new(Manager::new());
}

/// Acquires the process-wide allocator lock.  A poisoned lock is
/// taken over as-is: the allocator never propagates panics past its
/// public boundary.
pub fn lock() -> MutexGuard<'static, Manager> {
    MANAGER.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Manager {
    pub fn new() -> Manager {
        Manager {
            zones: [std::ptr::null_mut(); SizeClass::COUNT],
            counts: [0; SizeClass::COUNT],
            stats: AllocStats::default(),
        }
    }

    /// Head of the zone list for `class`.
    #[inline]
    pub fn head(&self, class: SizeClass) -> *mut Zone {
        self.zones[class.index()]
    }

    /// Number of zones currently on the list for `class`.
    #[inline]
    pub fn zone_count(&self, class: SizeClass) -> u32 {
        self.counts[class.index()]
    }

    fn note_created(&mut self, class: SizeClass) {
        self.counts[class.index()] += 1;
        self.stats.zones_total += 1;
        self.stats.zones_active += 1;
    }

    fn note_retired(&mut self, class: SizeClass) {
        let count = &mut self.counts[class.index()];
        *count = count.saturating_sub(1);
        self.stats.zones_active = self.stats.zones_active.saturating_sub(1);
    }

    /// Routes a request of `need` aligned bytes to a zone.
    ///
    /// LARGE requests always get a fresh zone, prepended to the LARGE
    /// list.  Pooled requests reuse the first listed zone that can
    /// serve them, creating and appending a new zone only when none
    /// can and the per-class cap has room.
    ///
    /// # Safety
    ///
    /// Every zone reachable from this manager must be a live mapping.
    #[ensures(ret.is_some() -> Zone::validate(ret.unwrap().as_ptr()),
              "returned zones validate")]
    pub unsafe fn find_or_create(
        &mut self,
        class: SizeClass,
        need: usize,
    ) -> Option<NonNull<Zone>> {
        let index = class.index();

        if class == SizeClass::Large {
            let zone = Zone::create(class, need).ok()?;
            (*zone.as_ptr()).next = self.zones[index];
            self.zones[index] = zone.as_ptr();
            self.note_created(class);
            return Some(zone);
        }

        let mut cur = self.zones[index];
        let mut steps = 0;

        while !cur.is_null() && steps < MAX_ZONE_SEARCH {
            // A zone that fails validation also poisons its `next`
            // link; stop the walk rather than follow it.
            if !Zone::validate(cur) {
                self.stats.record_corruption();
                break;
            }

            if (*cur).can_satisfy(need) {
                return Some(NonNull::new_unchecked(cur));
            }

            cur = (*cur).next;
            steps += 1;
        }

        if self.counts[index] >= MAX_ZONES_PER_CLASS {
            return None;
        }

        let zone = Zone::create(class, need).ok()?;
        self.append(index, zone.as_ptr());
        self.note_created(class);
        Some(zone)
    }

    unsafe fn append(&mut self, index: usize, zone: *mut Zone) {
        if self.zones[index].is_null() {
            self.zones[index] = zone;
            return;
        }

        let mut tail = self.zones[index];
        let mut steps = 0;

        while !(*tail).next.is_null() && steps < MAX_ZONES_PER_CLASS as usize {
            tail = (*tail).next;
            steps += 1;
        }
        (*tail).next = zone;
    }

    /// Unlinks `zone` from its class list.  Returns false when the
    /// zone was not found, which means the back-reference that led
    /// here was stale.
    ///
    /// # Safety
    ///
    /// `zone` must be a valid zone header.
    pub unsafe fn detach(&mut self, zone: *mut Zone) -> bool {
        let class = (*zone).class();
        let index = class.index();

        let mut cur = self.zones[index];
        let mut prev: *mut Zone = std::ptr::null_mut();
        let mut steps = 0;
        let bound = self.counts[index] as usize + 1;

        while !cur.is_null() && steps <= bound {
            if cur == zone {
                if prev.is_null() {
                    self.zones[index] = (*cur).next;
                } else {
                    (*prev).next = (*cur).next;
                }
                (*zone).next = std::ptr::null_mut();
                self.note_retired(class);
                return true;
            }

            prev = cur;
            cur = (*cur).next;
            steps += 1;
        }

        false
    }

    /// Unmaps every zone with no allocated chunks, across all three
    /// lists.  Returns the number of zones reclaimed.
    ///
    /// # Safety
    ///
    /// Same requirements as `find_or_create`.
    pub unsafe fn reclaim_empty(&mut self) -> usize {
        let mut reclaimed = 0;

        for class in SizeClass::ALL.iter().copied() {
            let index = class.index();
            let bound = self.counts[index] as usize + 1;
            let mut cur = self.zones[index];
            let mut prev: *mut Zone = std::ptr::null_mut();
            let mut steps = 0;

            while !cur.is_null() && steps <= bound {
                if !Zone::validate(cur) {
                    self.stats.record_corruption();
                    break;
                }

                let next = (*cur).next;

                let empty = match (*cur).is_empty() {
                    Ok(empty) => empty,
                    Err(_) => {
                        self.stats.record_corruption();
                        false
                    }
                };

                if empty {
                    if prev.is_null() {
                        self.zones[index] = next;
                    } else {
                        (*prev).next = next;
                    }

                    self.note_retired(class);
                    let _ = Zone::destroy(NonNull::new_unchecked(cur));
                    reclaimed += 1;
                } else {
                    prev = cur;
                }

                cur = next;
                steps += 1;
            }
        }

        reclaimed
    }

    /// Unconditionally unmaps every zone.  All pointers handed out by
    /// the allocator dangle afterwards.
    ///
    /// # Safety
    ///
    /// The caller asserts that no outstanding allocation will ever be
    /// touched again.
    pub unsafe fn destroy_all(&mut self) {
        for class in SizeClass::ALL.iter().copied() {
            let index = class.index();
            let mut cur = self.zones[index];

            while !cur.is_null() {
                let next = (*cur).next;
                let _ = Zone::destroy(NonNull::new_unchecked(cur));
                cur = next;
            }

            self.zones[index] = std::ptr::null_mut();
            self.counts[index] = 0;
        }

        self.stats.zones_active = 0;
        self.stats.bytes_allocated = 0;
    }

    /// Returns `Err` when some of the manager's invariants are
    /// violated.
    #[cfg(any(test, feature = "check_contracts"))]
    pub fn check_rep_or_err(&self) -> Result<(), &'static str> {
        for class in SizeClass::ALL.iter().copied() {
            let mut cur = self.head(class);
            let mut seen = 0u32;

            while !cur.is_null() {
                if seen > self.zone_count(class) {
                    return Err("zone list longer than its count");
                }

                if !unsafe { Zone::validate(cur) } {
                    return Err("listed zone fails validation");
                }

                if unsafe { (*cur).class() } != class {
                    return Err("zone listed under the wrong class");
                }

                unsafe { check_chain_or_err(cur)? };

                cur = unsafe { (*cur).next };
                seen += 1;
            }

            if seen != self.zone_count(class) {
                return Err("zone count out of sync with its list");
            }
        }

        Ok(())
    }
}

/// Walks one zone's chunk chain checking physical adjacency, the
/// zone back-references, and that every allocated chunk passes the
/// full header gauntlet.
#[cfg(any(test, feature = "check_contracts"))]
unsafe fn check_chain_or_err(zone: *mut Zone) -> Result<(), &'static str> {
    use crate::chunk;
    use crate::zone::MAX_CHUNK_WALK;

    let mut cur = (*zone).first;
    let mut counted = 0u32;

    while !cur.is_null() {
        if counted as usize >= MAX_CHUNK_WALK {
            return Err("chunk chain exceeds the walk fuse");
        }

        if (*cur).zone != zone {
            return Err("chunk back-reference escapes its zone");
        }

        if (*cur).is_allocated() && !chunk::validate(cur) {
            return Err("allocated chunk fails the gauntlet");
        }

        let next = (*cur).next;
        if !next.is_null() {
            if (*cur).addr() + (*cur).span() != next as usize {
                return Err("chain neighbors are not physically adjacent");
            }

            if (*next).prev != cur {
                return Err("chain back-links are inconsistent");
            }
        }

        cur = next;
        counted += 1;
    }

    if counted != (*zone).chunk_count {
        return Err("chunk count out of sync with its chain");
    }

    Ok(())
}
