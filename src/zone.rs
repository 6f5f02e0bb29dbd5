//! A `Zone` is one contiguous anonymous mapping dedicated to a single
//! size class.  The zone header sits at the base of the mapping and
//! owns an address-ordered doubly linked chain of chunks carved out
//! of the rest of the region.  Fresh chunks are always carved at the
//! tail of used space (bump allocation); reuse of freed space happens
//! exclusively through the first-fit free-chunk search.
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

use std::ffi::c_void;
use std::ptr::NonNull;

use static_assertions::const_assert_eq;

use crate::chunk;
use crate::chunk::ChunkHeader;
use crate::chunk::ALIGNMENT;
use crate::chunk::HEADER_SIZE;
use crate::chunk::MAGIC_FREE;
use crate::chunk::MIN_SPLIT;
use crate::chunk::STATE_FREE;
use crate::class::SizeClass;
use crate::map;

/// Sentinel stored in `Zone::magic`.
pub const MAGIC_ZONE: u32 = 0xCAFE_BABE;

/// Upper bound on any walk over one zone's chunk chain.  A chain
/// longer than this is corrupt; walks report failure instead of
/// reading further.
pub const MAX_CHUNK_WALK: usize = 10_000;

/// The header at the base of every mapped zone.
#[repr(C)]
pub struct Zone {
    pub magic: u32,
    class_tag: u32,
    /// Total bytes in the mapping, zone header included.
    pub total: usize,
    /// Bytes consumed from the base of the mapping.  Starts at the
    /// zone header span and only grows; freed space is recycled
    /// through the chunk chain, never by rewinding this mark.
    pub used: usize,
    /// First byte available for chunks, 16-byte aligned.
    pub start: *mut u8,
    /// One past the last mapped byte.
    pub end: *mut u8,
    pub first: *mut ChunkHeader,
    pub last: *mut ChunkHeader,
    /// Intrusive link for the manager's per-class zone list.
    pub next: *mut Zone,
    pub chunk_count: u32,
}

/// Byte offset from the mapping base to the first chunk header.
pub const ZONE_HEADER_SIZE: usize = chunk::align_up(std::mem::size_of::<Zone>());

const_assert_eq!(ZONE_HEADER_SIZE % ALIGNMENT, 0);

/// Returned when a chain walk trips `MAX_CHUNK_WALK`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainTooLong;

impl Zone {
    /// Maps and initialises a zone for `class`.  Pooled classes use
    /// their fixed mapping size; LARGE zones are sized to hold one
    /// chunk of `need` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Err(errno)` when the page mapper fails.
    pub fn create(class: SizeClass, need: usize) -> Result<NonNull<Zone>, i32> {
        let total = match class.fixed_zone_size() {
            Some(fixed) => map::align_to_page(fixed),
            None => map::align_to_page(ZONE_HEADER_SIZE + HEADER_SIZE + need),
        };

        let base = map::acquire(total)?;
        let base_addr = base.as_ptr() as usize;
        let zone = base.as_ptr() as *mut Zone;

        unsafe {
            zone.write(Zone {
                magic: MAGIC_ZONE,
                class_tag: class.tag(),
                total,
                used: ZONE_HEADER_SIZE,
                start: (base_addr + ZONE_HEADER_SIZE) as *mut u8,
                end: (base_addr + total) as *mut u8,
                first: std::ptr::null_mut(),
                last: std::ptr::null_mut(),
                next: std::ptr::null_mut(),
                chunk_count: 0,
            });

            Ok(NonNull::new_unchecked(zone))
        }
    }

    /// Returns the whole mapping to the operating system.
    ///
    /// # Safety
    ///
    /// `zone` must have come from `create` and must not be reachable
    /// from any list or chunk back-reference afterwards.
    pub unsafe fn destroy(zone: NonNull<Zone>) -> Result<(), i32> {
        let total = zone.as_ref().total;

        map::release(
            NonNull::new_unchecked(zone.as_ptr() as *mut c_void),
            total,
        )
    }

    /// Address of the mapping base.
    #[inline]
    pub fn base(&self) -> usize {
        self as *const Zone as usize
    }

    /// The size class this zone serves.  Only meaningful after
    /// `validate` accepted the zone, which bounds the tag.
    pub fn class(&self) -> SizeClass {
        match self.class_tag {
            0 => SizeClass::Tiny,
            1 => SizeClass::Small,
            _ => SizeClass::Large,
        }
    }

    /// Bytes still unclaimed at the tail of the mapping.
    #[inline]
    pub fn tail_capacity(&self) -> usize {
        self.total - self.used
    }

    /// Structural validation of a candidate zone pointer: magic,
    /// class tag, address ordering, accounting bound, and the first
    /// chunk sitting at the aligned post-header offset.
    ///
    /// # Safety
    ///
    /// `zone` must be readable for `size_of::<Zone>()` bytes or null.
    pub unsafe fn validate(zone: *const Zone) -> bool {
        if zone.is_null() || !chunk::is_aligned(zone as usize) {
            return false;
        }

        let z = &*zone;

        z.magic == MAGIC_ZONE
            && SizeClass::from_tag(z.class_tag).is_some()
            && (z.start as usize) < (z.end as usize)
            && z.used <= z.total
            && (z.first.is_null() || z.first as usize == z.base() + ZONE_HEADER_SIZE)
    }

    /// First-fit search for a FREE chunk with at least `need` bytes
    /// of payload.
    ///
    /// # Safety
    ///
    /// The zone's chunk chain must only reference memory inside this
    /// zone's mapping.
    pub unsafe fn find_free(
        &self,
        need: usize,
    ) -> Result<Option<NonNull<ChunkHeader>>, ChainTooLong> {
        let mut cur = self.first;
        let mut steps = 0;

        while !cur.is_null() {
            if steps >= MAX_CHUNK_WALK {
                return Err(ChainTooLong);
            }

            let c = &*cur;
            if c.is_free() && c.payload_size >= need {
                return Ok(Some(NonNull::new_unchecked(cur)));
            }

            cur = c.next;
            steps += 1;
        }

        Ok(None)
    }

    /// Returns true iff this zone could serve a request of `need`
    /// bytes, either from a free chunk or from tail capacity.
    ///
    /// # Safety
    ///
    /// Same requirements as `find_free`.  A corrupt chain makes the
    /// zone unusable rather than an error here.
    pub unsafe fn can_satisfy(&self, need: usize) -> bool {
        match self.find_free(need) {
            Ok(Some(_)) => true,
            Ok(None) => self.tail_capacity() >= HEADER_SIZE + need,
            Err(ChainTooLong) => false,
        }
    }

    /// Places a fresh FREE chunk of `need` payload bytes at the tail
    /// of used space, or returns `None` when the remaining capacity
    /// is insufficient.
    ///
    /// # Safety
    ///
    /// The zone must be validly initialised and exclusively borrowed
    /// for the duration of the call.
    #[ensures(ret.is_some() -> self.used == old(self.used) + HEADER_SIZE + need,
              "a successful carve consumes exactly one chunk span")]
    #[ensures(ret.is_none() -> self.used == old(self.used),
              "a failed carve changes nothing")]
    pub unsafe fn carve_fresh(&mut self, need: usize) -> Option<NonNull<ChunkHeader>> {
        let span = HEADER_SIZE + need;

        if self.tail_capacity() < span {
            return None;
        }

        let header = (self.base() + self.used) as *mut ChunkHeader;

        header.write(ChunkHeader {
            magic: MAGIC_FREE,
            state: STATE_FREE,
            payload_size: need,
            prev: self.last,
            next: std::ptr::null_mut(),
            zone: self as *mut Zone,
        });

        if self.last.is_null() {
            self.first = header;
        } else {
            (*self.last).next = header;
        }
        self.last = header;

        self.used += span;
        self.chunk_count += 1;

        Some(NonNull::new_unchecked(header))
    }

    /// Shortens `target` to `need` payload bytes and inserts the
    /// remainder into the chain as a new FREE chunk, provided the
    /// remainder could still hold a viable chunk.  Otherwise the
    /// chunk keeps its full payload.
    ///
    /// # Safety
    ///
    /// `target` must be a chunk of this zone.
    pub unsafe fn split(&mut self, target: NonNull<ChunkHeader>, need: usize) {
        let c = &mut *target.as_ptr();

        if c.payload_size < need + HEADER_SIZE + MIN_SPLIT {
            return;
        }

        let rest_payload = c.payload_size - need - HEADER_SIZE;
        let rest = (c.addr() + HEADER_SIZE + need) as *mut ChunkHeader;

        rest.write(ChunkHeader {
            magic: MAGIC_FREE,
            state: STATE_FREE,
            payload_size: rest_payload,
            prev: target.as_ptr(),
            next: c.next,
            zone: c.zone,
        });

        if c.next.is_null() {
            self.last = rest;
        } else {
            (*c.next).prev = rest;
        }
        c.next = rest;
        c.payload_size = need;

        self.chunk_count += 1;
    }

    /// Absorbs the chain successor of `target` if it is FREE and
    /// physically adjacent.  Returns true when a merge happened.
    /// The absorbed header is re-stamped CORRUPTED so stale
    /// references to it are detectable.
    ///
    /// # Safety
    ///
    /// `target` must be a chunk of this zone.
    pub unsafe fn absorb_next(&mut self, target: *mut ChunkHeader) -> bool {
        let c = &mut *target;
        let next = c.next;

        if next.is_null() || !(*next).is_free() {
            return false;
        }

        // Chain neighbors should always be physically adjacent; a
        // mismatch means the chain is corrupt and must not be merged.
        if c.addr() + c.span() != next as usize {
            return false;
        }

        c.payload_size += (*next).span();
        c.next = (*next).next;
        if c.next.is_null() {
            self.last = target;
        } else {
            (*c.next).prev = target;
        }

        (*next).stamp_corrupted();
        self.chunk_count -= 1;

        true
    }

    /// Merges a freshly freed chunk with its FREE, physically
    /// adjacent neighbors.  Returns the header of the surviving
    /// chunk, which differs from `target` when the chunk was
    /// absorbed into its predecessor.
    ///
    /// # Safety
    ///
    /// `target` must be a FREE chunk of this zone.
    #[requires((*target.as_ptr()).is_free(), "only free chunks coalesce")]
    pub unsafe fn coalesce(&mut self, target: NonNull<ChunkHeader>) -> NonNull<ChunkHeader> {
        let c = target.as_ptr();

        self.absorb_next(c);

        let prev = (*c).prev;
        if !prev.is_null() && (*prev).is_free() && self.absorb_next(prev) {
            return NonNull::new_unchecked(prev);
        }

        target
    }

    /// Returns true iff the zone holds no ALLOCATED chunk.
    ///
    /// # Safety
    ///
    /// Same requirements as `find_free`.
    pub unsafe fn is_empty(&self) -> Result<bool, ChainTooLong> {
        let mut cur = self.first;
        let mut steps = 0;

        while !cur.is_null() {
            if steps >= MAX_CHUNK_WALK {
                return Err(ChainTooLong);
            }

            if (*cur).is_allocated() {
                return Ok(false);
            }

            cur = (*cur).next;
            steps += 1;
        }

        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    unsafe fn carve(zone: &mut Zone, need: usize) -> NonNull<ChunkHeader> {
        zone.carve_fresh(need).expect("carve should succeed")
    }

    #[test]
    fn create_initialises_header() {
        let zone_ptr = Zone::create(SizeClass::Tiny, 0).expect("create should succeed");
        let zone = unsafe { &mut *zone_ptr.as_ptr() };

        assert_eq!(zone.magic, MAGIC_ZONE);
        assert_eq!(zone.class(), SizeClass::Tiny);
        assert_eq!(zone.used, ZONE_HEADER_SIZE);
        assert_eq!(zone.start as usize, zone.base() + ZONE_HEADER_SIZE);
        assert_eq!(zone.end as usize, zone.base() + zone.total);
        assert!(chunk::is_aligned(zone.start as usize));
        assert!(zone.first.is_null());
        assert!(unsafe { Zone::validate(zone_ptr.as_ptr()) });

        unsafe { Zone::destroy(zone_ptr).expect("destroy should succeed") };
    }

    #[test]
    fn large_zone_sized_to_request() {
        let need = 8192;
        let zone_ptr = Zone::create(SizeClass::Large, need).expect("create should succeed");
        let zone = unsafe { &mut *zone_ptr.as_ptr() };

        assert_eq!(zone.class(), SizeClass::Large);
        assert!(zone.tail_capacity() >= HEADER_SIZE + need);

        let c = unsafe { carve(zone, need) };
        assert_eq!(unsafe { c.as_ref().payload_size }, need);

        unsafe { Zone::destroy(zone_ptr).expect("destroy should succeed") };
    }

    #[test]
    fn carve_links_chunks_in_address_order() {
        let zone_ptr = Zone::create(SizeClass::Tiny, 0).expect("create should succeed");
        let zone = unsafe { &mut *zone_ptr.as_ptr() };

        let a = unsafe { carve(zone, 64) };
        let b = unsafe { carve(zone, 64) };
        let c = unsafe { carve(zone, 64) };

        unsafe {
            assert_eq!(zone.first, a.as_ptr());
            assert_eq!(zone.last, c.as_ptr());
            assert_eq!(a.as_ref().next, b.as_ptr());
            assert_eq!(b.as_ref().prev, a.as_ptr());
            assert_eq!(b.as_ref().next, c.as_ptr());
            assert_eq!(c.as_ref().prev, b.as_ptr());

            // Physical adjacency matches the chain order.
            assert_eq!(a.as_ptr() as usize + a.as_ref().span(), b.as_ptr() as usize);
            assert_eq!(b.as_ptr() as usize + b.as_ref().span(), c.as_ptr() as usize);

            assert_eq!(a.as_ref().zone, zone_ptr.as_ptr());
        }
        assert_eq!(zone.chunk_count, 3);

        unsafe { Zone::destroy(zone_ptr).expect("destroy should succeed") };
    }

    #[test]
    fn carve_respects_capacity() {
        let zone_ptr = Zone::create(SizeClass::Tiny, 0).expect("create should succeed");
        let zone = unsafe { &mut *zone_ptr.as_ptr() };

        // A request larger than the remaining capacity must fail
        // without disturbing the zone.
        let used = zone.used;
        assert!(unsafe { zone.carve_fresh(zone.total) }.is_none());
        assert_eq!(zone.used, used);

        unsafe { Zone::destroy(zone_ptr).expect("destroy should succeed") };
    }

    #[test]
    fn find_free_is_first_fit() {
        let zone_ptr = Zone::create(SizeClass::Tiny, 0).expect("create should succeed");
        let zone = unsafe { &mut *zone_ptr.as_ptr() };

        let a = unsafe { carve(zone, 64) };
        let b = unsafe { carve(zone, 128) };
        let c = unsafe { carve(zone, 64) };

        unsafe {
            // All chunks are born FREE; the first large enough wins
            // even when a later one fits more tightly.
            (*a.as_ptr()).stamp_allocated();
            assert_eq!(zone.find_free(64), Ok(Some(b)));

            (*b.as_ptr()).stamp_allocated();
            assert_eq!(zone.find_free(64), Ok(Some(c)));

            (*c.as_ptr()).stamp_allocated();
            assert_eq!(zone.find_free(64), Ok(None));
        }

        unsafe { Zone::destroy(zone_ptr).expect("destroy should succeed") };
    }

    #[test]
    fn split_keeps_remainder_viable() {
        let zone_ptr = Zone::create(SizeClass::Tiny, 0).expect("create should succeed");
        let zone = unsafe { &mut *zone_ptr.as_ptr() };

        let a = unsafe { carve(zone, 512) };

        unsafe {
            zone.split(a, 64);

            let a_ref = a.as_ref();
            assert_eq!(a_ref.payload_size, 64);

            let rest = a_ref.next;
            assert!(!rest.is_null());
            assert!((*rest).is_free());
            assert_eq!((*rest).payload_size, 512 - 64 - HEADER_SIZE);
            assert_eq!((*rest).prev, a.as_ptr());
            assert_eq!(zone.last, rest);
            assert_eq!(zone.chunk_count, 2);

            // Too small a remainder: the chunk keeps its payload.
            let before = (*rest).payload_size;
            zone.split(
                NonNull::new_unchecked(rest),
                before - MIN_SPLIT - HEADER_SIZE + ALIGNMENT,
            );
            assert_eq!((*rest).payload_size, before);
            assert_eq!(zone.chunk_count, 2);
        }

        unsafe { Zone::destroy(zone_ptr).expect("destroy should succeed") };
    }

    #[test]
    fn coalesce_merges_both_neighbors() {
        let zone_ptr = Zone::create(SizeClass::Tiny, 0).expect("create should succeed");
        let zone = unsafe { &mut *zone_ptr.as_ptr() };

        let a = unsafe { carve(zone, 64) };
        let b = unsafe { carve(zone, 64) };
        let c = unsafe { carve(zone, 64) };
        let d = unsafe { carve(zone, 64) };

        unsafe {
            (*a.as_ptr()).stamp_allocated();
            (*b.as_ptr()).stamp_allocated();
            (*c.as_ptr()).stamp_allocated();
            (*d.as_ptr()).stamp_allocated();

            // Free the outer two, then the middle: everything merges
            // into a's chunk.
            (*a.as_ptr()).stamp_free();
            zone.coalesce(a);
            (*c.as_ptr()).stamp_free();
            zone.coalesce(c);
            assert_eq!(zone.chunk_count, 4);

            (*b.as_ptr()).stamp_free();
            let merged = zone.coalesce(b);
            assert_eq!(merged, a);
            assert_eq!(zone.chunk_count, 2);
            assert_eq!(a.as_ref().payload_size, 3 * 64 + 2 * HEADER_SIZE);

            // Absorbed headers are poisoned.
            assert_eq!(b.as_ref().magic, chunk::MAGIC_CORRUPTED);
            assert_eq!(c.as_ref().magic, chunk::MAGIC_CORRUPTED);

            // The merged chunk serves a request none of the pieces
            // could have.
            assert_eq!(zone.find_free(3 * 64), Ok(Some(a)));
        }

        unsafe { Zone::destroy(zone_ptr).expect("destroy should succeed") };
    }

    #[test]
    fn coalesce_updates_tail() {
        let zone_ptr = Zone::create(SizeClass::Tiny, 0).expect("create should succeed");
        let zone = unsafe { &mut *zone_ptr.as_ptr() };

        let a = unsafe { carve(zone, 64) };
        let b = unsafe { carve(zone, 64) };

        unsafe {
            (*a.as_ptr()).stamp_allocated();
            (*b.as_ptr()).stamp_free();
            zone.coalesce(b);

            (*a.as_ptr()).stamp_free();
            let merged = zone.coalesce(a);
            assert_eq!(merged, a);
            assert_eq!(zone.last, a.as_ptr());
            assert_eq!(zone.chunk_count, 1);
        }

        unsafe { Zone::destroy(zone_ptr).expect("destroy should succeed") };
    }

    #[test]
    fn is_empty_tracks_allocated_chunks() {
        let zone_ptr = Zone::create(SizeClass::Tiny, 0).expect("create should succeed");
        let zone = unsafe { &mut *zone_ptr.as_ptr() };

        assert_eq!(unsafe { zone.is_empty() }, Ok(true));

        let a = unsafe { carve(zone, 64) };
        assert_eq!(unsafe { zone.is_empty() }, Ok(true));

        unsafe { (*a.as_ptr()).stamp_allocated() };
        assert_eq!(unsafe { zone.is_empty() }, Ok(false));

        unsafe { (*a.as_ptr()).stamp_free() };
        assert_eq!(unsafe { zone.is_empty() }, Ok(true));

        unsafe { Zone::destroy(zone_ptr).expect("destroy should succeed") };
    }

    #[test]
    fn validate_rejects_tampering() {
        let zone_ptr = Zone::create(SizeClass::Small, 0).expect("create should succeed");
        let zone = unsafe { &mut *zone_ptr.as_ptr() };

        assert!(unsafe { Zone::validate(zone_ptr.as_ptr()) });
        assert!(!unsafe { Zone::validate(std::ptr::null()) });

        zone.magic = 0;
        assert!(!unsafe { Zone::validate(zone_ptr.as_ptr()) });
        zone.magic = MAGIC_ZONE;

        zone.class_tag = 7;
        assert!(!unsafe { Zone::validate(zone_ptr.as_ptr()) });
        zone.class_tag = SizeClass::Small.tag();

        zone.used = zone.total + 1;
        assert!(!unsafe { Zone::validate(zone_ptr.as_ptr()) });
        zone.used = ZONE_HEADER_SIZE;

        assert!(unsafe { Zone::validate(zone_ptr.as_ptr()) });

        unsafe { Zone::destroy(zone_ptr).expect("destroy should succeed") };
    }
}
