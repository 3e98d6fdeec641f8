//! Simulated virtual address space.
//!
//! Reservations are ranges of page-granular addresses. Every system page of a
//! reservation is either reserved (inaccessible) or committed; committed pages
//! read as zero until first written, at which point their contents are
//! materialized. Decommit drops contents and makes the page inaccessible again,
//! discard drops contents but keeps the page committed.
//!
//! Placement is randomized: unhinted reservations land after a random gap of
//! whole super pages, so the layout of one run does not predict the next.

use std::collections::BTreeMap;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hasher};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::error::PageError;
use crate::geometry::{
    PAGE_ALLOCATION_GRANULARITY, SUPER_PAGE_SIZE, SYSTEM_PAGE_OFFSET_MASK, SYSTEM_PAGE_SHIFT,
    SYSTEM_PAGE_SIZE, checked_align_up,
};
use crate::metrics::PageMetrics;

/// Lowest address handed out by [`AddressSpace`].
pub const ADDRESS_SPACE_START: usize = 0x0000_1000_0000_0000;
/// One past the highest address handed out by [`AddressSpace`].
pub const ADDRESS_SPACE_END: usize = 0x0000_7f00_0000_0000;

const MAX_RANDOM_GAP_SUPER_PAGES: u64 = 64;

/// Reservation / commit contract consumed by the allocator, plus byte access
/// over committed memory.
///
/// All ranges passed to `commit`, `decommit` and `discard` must be aligned to
/// the system page size.
pub trait PageAllocator: Send + Sync {
    /// Reserve `size` bytes aligned to `alignment`. The reservation is placed
    /// at `hint` when that range is free and suitably aligned.
    fn reserve(&self, size: usize, alignment: usize, hint: Option<usize>)
    -> Result<usize, PageError>;

    /// Release a whole reservation previously returned by `reserve`.
    fn release(&self, base: usize, size: usize) -> Result<(), PageError>;

    /// Make a range accessible.
    fn commit(&self, addr: usize, len: usize) -> Result<(), PageError>;

    /// Drop the contents of a range and make it inaccessible.
    fn decommit(&self, addr: usize, len: usize) -> Result<(), PageError>;

    /// Drop the contents of a committed range; it stays accessible and reads as zero.
    fn discard(&self, addr: usize, len: usize) -> Result<(), PageError>;

    /// State of the system page containing `addr`, or `None` if unreserved.
    fn page_state(&self, addr: usize) -> Option<PageState>;

    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), PageError>;

    fn write(&self, addr: usize, data: &[u8]) -> Result<(), PageError>;

    fn fill(&self, addr: usize, len: usize, byte: u8) -> Result<(), PageError>;

    /// Atomically update the 4-byte little-endian word at `addr`.
    ///
    /// Mirrors `AtomicU32::fetch_update`: `Ok(Ok(previous))` when `f` returned
    /// a new value, `Ok(Err(previous))` when it returned `None`.
    fn update_u32(
        &self,
        addr: usize,
        f: &mut dyn FnMut(u32) -> Option<u32>,
    ) -> Result<Result<u32, u32>, PageError>;

    fn read_u32(&self, addr: usize) -> Result<u32, PageError> {
        let mut bytes = [0u8; 4];
        self.read(addr, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn write_u32(&self, addr: usize, value: u32) -> Result<(), PageError> {
        self.write(addr, &value.to_le_bytes())
    }

    fn read_u64(&self, addr: usize) -> Result<u64, PageError> {
        let mut bytes = [0u8; 8];
        self.read(addr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn write_u64(&self, addr: usize, value: u64) -> Result<(), PageError> {
        self.write(addr, &value.to_le_bytes())
    }

    fn read_vec(&self, addr: usize, len: usize) -> Result<Vec<u8>, PageError> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }
}

/// Observable state of one system page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Reserved, not accessible.
    Reserved,
    /// Committed, never written since commit / discard (reads as zero).
    Committed,
    /// Committed with materialized contents.
    Resident,
}

enum Page {
    Reserved,
    Committed(Option<Box<[u8]>>),
}

struct Reservation {
    base: usize,
    size: usize,
    pages: Mutex<Vec<Page>>,
}

impl Reservation {
    fn new(base: usize, size: usize) -> Self {
        let count = size >> SYSTEM_PAGE_SHIFT;
        let mut pages = Vec::with_capacity(count);
        pages.resize_with(count, || Page::Reserved);
        Self {
            base,
            size,
            pages: Mutex::new(pages),
        }
    }

    fn end(&self) -> usize {
        self.base + self.size
    }

    fn page_index(&self, addr: usize) -> usize {
        (addr - self.base) >> SYSTEM_PAGE_SHIFT
    }

    /// Page indices covering `[addr, addr + len)`.
    fn page_range(&self, addr: usize, len: usize) -> std::ops::Range<usize> {
        let first = self.page_index(addr);
        let last = self.page_index(addr + len - 1);
        first..last + 1
    }
}

struct Placement {
    cursor: usize,
    rng: u64,
}

impl Placement {
    fn next_random(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

/// In-process simulated address space.
pub struct AddressSpace {
    reservations: RwLock<BTreeMap<usize, Arc<Reservation>>>,
    placement: Mutex<Placement>,
    limit: Option<usize>,
    metrics: PageMetrics,
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("reservations", &self.reservation_count())
            .field("limit", &self.limit)
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

impl AddressSpace {
    /// Create an address space with a randomly seeded layout.
    #[must_use]
    pub fn new() -> Self {
        let seed = RandomState::new().build_hasher().finish();
        Self::with_seed(seed)
    }

    /// Create an address space whose placement is driven by `seed`.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        let mut placement = Placement {
            cursor: ADDRESS_SPACE_START,
            rng: seed | 1,
        };
        let skew = (placement.next_random() % MAX_RANDOM_GAP_SUPER_PAGES) as usize;
        placement.cursor += skew * SUPER_PAGE_SIZE;
        Self {
            reservations: RwLock::new(BTreeMap::new()),
            placement: Mutex::new(placement),
            limit: None,
            metrics: PageMetrics::new(),
        }
    }

    /// Cap the total number of bytes that may be reserved at once.
    #[must_use]
    pub fn with_limit(mut self, max_reserved_bytes: usize) -> Self {
        self.limit = Some(max_reserved_bytes);
        self
    }

    /// Process-wide address space shared by roots that do not bring their own.
    pub fn shared() -> Arc<AddressSpace> {
        static SHARED: OnceLock<Arc<AddressSpace>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(AddressSpace::new())))
    }

    #[must_use]
    pub fn metrics(&self) -> &PageMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn reservation_count(&self) -> usize {
        self.reservations.read().len()
    }

    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        PageMetrics::get(&self.metrics.reserved_bytes) as usize
    }

    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        PageMetrics::get(&self.metrics.committed_bytes) as usize
    }

    fn range_is_free(map: &BTreeMap<usize, Arc<Reservation>>, base: usize, size: usize) -> bool {
        let Some(end) = base.checked_add(size) else {
            return false;
        };
        if base < ADDRESS_SPACE_START || end > ADDRESS_SPACE_END {
            return false;
        }
        match map.range(..end).next_back() {
            Some((_, r)) => r.end() <= base,
            None => true,
        }
    }

    fn pick_base(
        placement: &mut Placement,
        map: &BTreeMap<usize, Arc<Reservation>>,
        size: usize,
        alignment: usize,
    ) -> Result<usize, PageError> {
        let exhausted = PageError::ReservationFailed { size };
        loop {
            let gap = (placement.next_random() % MAX_RANDOM_GAP_SUPER_PAGES) as usize;
            let start = placement
                .cursor
                .checked_add(gap * SUPER_PAGE_SIZE)
                .ok_or(exhausted.clone())?;
            let candidate = checked_align_up(start, alignment).ok_or(exhausted.clone())?;
            let end = candidate.checked_add(size).ok_or(exhausted.clone())?;
            if end > ADDRESS_SPACE_END {
                return Err(exhausted);
            }
            if Self::range_is_free(map, candidate, size) {
                placement.cursor = end;
                return Ok(candidate);
            }
            // Skip past whatever occupies the candidate range.
            placement.cursor = match map.range(..end).next_back() {
                Some((_, r)) => r.end(),
                None => end,
            };
        }
    }

    fn locate(&self, addr: usize, len: usize) -> Result<Arc<Reservation>, PageError> {
        let map = self.reservations.read();
        let (_, reservation) = map
            .range(..=addr)
            .next_back()
            .ok_or(PageError::Unmapped { addr })?;
        if addr >= reservation.end() {
            return Err(PageError::Unmapped { addr });
        }
        if len > reservation.end() - addr {
            return Err(PageError::OutOfRange { addr, len });
        }
        Ok(Arc::clone(reservation))
    }

    fn check_page_aligned(addr: usize, len: usize) -> Result<(), PageError> {
        if addr & SYSTEM_PAGE_OFFSET_MASK != 0 || len & SYSTEM_PAGE_OFFSET_MASK != 0 {
            return Err(PageError::Misaligned {
                addr,
                len,
                alignment: SYSTEM_PAGE_SIZE,
            });
        }
        Ok(())
    }

    fn check_committed(
        reservation: &Reservation,
        pages: &[Page],
        addr: usize,
        len: usize,
    ) -> Result<(), PageError> {
        for index in reservation.page_range(addr, len) {
            if matches!(pages[index], Page::Reserved) {
                let page_addr = reservation.base + (index << SYSTEM_PAGE_SHIFT);
                return Err(PageError::NotCommitted {
                    addr: page_addr.max(addr),
                });
            }
        }
        Ok(())
    }

    /// Visit every page touched by `[addr, addr + len)` with the in-page
    /// offset range and the offset into the caller's buffer.
    fn for_each_chunk(
        reservation: &Reservation,
        addr: usize,
        len: usize,
        mut visit: impl FnMut(usize, std::ops::Range<usize>, usize),
    ) {
        let mut done = 0;
        while done < len {
            let cur = addr + done;
            let index = reservation.page_index(cur);
            let in_page = cur & SYSTEM_PAGE_OFFSET_MASK;
            let take = (SYSTEM_PAGE_SIZE - in_page).min(len - done);
            visit(index, in_page..in_page + take, done);
            done += take;
        }
    }

    fn materialize<'a>(page: &'a mut Page, metrics: &PageMetrics) -> Option<&'a mut [u8]> {
        match page {
            Page::Reserved => None,
            Page::Committed(contents) => {
                if contents.is_none() {
                    PageMetrics::inc(&metrics.resident_pages);
                }
                Some(contents.get_or_insert_with(|| vec![0u8; SYSTEM_PAGE_SIZE].into_boxed_slice()))
            }
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAllocator for AddressSpace {
    fn reserve(
        &self,
        size: usize,
        alignment: usize,
        hint: Option<usize>,
    ) -> Result<usize, PageError> {
        if !alignment.is_power_of_two() || alignment < PAGE_ALLOCATION_GRANULARITY {
            return Err(PageError::InvalidAlignment { alignment });
        }
        if size == 0 || size % PAGE_ALLOCATION_GRANULARITY != 0 {
            return Err(PageError::Misaligned {
                addr: 0,
                len: size,
                alignment: PAGE_ALLOCATION_GRANULARITY,
            });
        }
        if let Some(limit) = self.limit {
            if self.reserved_bytes().saturating_add(size) > limit {
                PageMetrics::inc(&self.metrics.reservation_failures);
                return Err(PageError::ReservationFailed { size });
            }
        }

        let mut placement = self.placement.lock();
        let mut map = self.reservations.write();
        let hinted = hint.filter(|h| h % alignment == 0 && Self::range_is_free(&map, *h, size));
        let base = match hinted {
            Some(base) => {
                placement.cursor = placement.cursor.max(base + size);
                base
            }
            None => match Self::pick_base(&mut placement, &map, size, alignment) {
                Ok(base) => base,
                Err(err) => {
                    PageMetrics::inc(&self.metrics.reservation_failures);
                    return Err(err);
                }
            },
        };
        map.insert(base, Arc::new(Reservation::new(base, size)));
        PageMetrics::inc(&self.metrics.reservations);
        PageMetrics::add(&self.metrics.reserved_bytes, size);
        Ok(base)
    }

    fn release(&self, base: usize, size: usize) -> Result<(), PageError> {
        let reservation = {
            let mut map = self.reservations.write();
            match map.get(&base) {
                Some(r) if r.size == size => {}
                _ => return Err(PageError::UnknownReservation { base, size }),
            }
            map.remove(&base)
                .ok_or(PageError::UnknownReservation { base, size })?
        };
        let pages = reservation.pages.lock();
        for page in pages.iter() {
            if let Page::Committed(contents) = page {
                PageMetrics::sub(&self.metrics.committed_bytes, SYSTEM_PAGE_SIZE);
                if contents.is_some() {
                    PageMetrics::sub(&self.metrics.resident_pages, 1);
                }
            }
        }
        PageMetrics::inc(&self.metrics.releases);
        PageMetrics::sub(&self.metrics.reserved_bytes, size);
        Ok(())
    }

    fn commit(&self, addr: usize, len: usize) -> Result<(), PageError> {
        Self::check_page_aligned(addr, len)?;
        if len == 0 {
            return Ok(());
        }
        let reservation = self.locate(addr, len)?;
        let mut pages = reservation.pages.lock();
        for index in reservation.page_range(addr, len) {
            if matches!(pages[index], Page::Reserved) {
                pages[index] = Page::Committed(None);
                PageMetrics::add(&self.metrics.committed_bytes, SYSTEM_PAGE_SIZE);
            }
        }
        PageMetrics::inc(&self.metrics.commits);
        Ok(())
    }

    fn decommit(&self, addr: usize, len: usize) -> Result<(), PageError> {
        Self::check_page_aligned(addr, len)?;
        if len == 0 {
            return Ok(());
        }
        let reservation = self.locate(addr, len)?;
        let mut pages = reservation.pages.lock();
        for index in reservation.page_range(addr, len) {
            if let Page::Committed(contents) = &pages[index] {
                if contents.is_some() {
                    PageMetrics::sub(&self.metrics.resident_pages, 1);
                }
                PageMetrics::sub(&self.metrics.committed_bytes, SYSTEM_PAGE_SIZE);
                pages[index] = Page::Reserved;
            }
        }
        PageMetrics::inc(&self.metrics.decommits);
        Ok(())
    }

    fn discard(&self, addr: usize, len: usize) -> Result<(), PageError> {
        Self::check_page_aligned(addr, len)?;
        if len == 0 {
            return Ok(());
        }
        let reservation = self.locate(addr, len)?;
        let mut pages = reservation.pages.lock();
        for index in reservation.page_range(addr, len) {
            if let Page::Committed(contents) = &mut pages[index] {
                if contents.take().is_some() {
                    PageMetrics::sub(&self.metrics.resident_pages, 1);
                }
            }
        }
        PageMetrics::inc(&self.metrics.discards);
        Ok(())
    }

    fn page_state(&self, addr: usize) -> Option<PageState> {
        let reservation = self.locate(addr, 1).ok()?;
        let pages = reservation.pages.lock();
        Some(match &pages[reservation.page_index(addr)] {
            Page::Reserved => PageState::Reserved,
            Page::Committed(None) => PageState::Committed,
            Page::Committed(Some(_)) => PageState::Resident,
        })
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), PageError> {
        if buf.is_empty() {
            return Ok(());
        }
        let reservation = self.locate(addr, buf.len())?;
        let pages = reservation.pages.lock();
        Self::check_committed(&reservation, &pages, addr, buf.len())?;
        Self::for_each_chunk(&reservation, addr, buf.len(), |index, range, offset| {
            let dst = &mut buf[offset..offset + range.len()];
            match &pages[index] {
                Page::Committed(Some(contents)) => dst.copy_from_slice(&contents[range]),
                _ => dst.fill(0),
            }
        });
        Ok(())
    }

    fn write(&self, addr: usize, data: &[u8]) -> Result<(), PageError> {
        if data.is_empty() {
            return Ok(());
        }
        let reservation = self.locate(addr, data.len())?;
        let mut pages = reservation.pages.lock();
        Self::check_committed(&reservation, &pages, addr, data.len())?;
        Self::for_each_chunk(&reservation, addr, data.len(), |index, range, offset| {
            if let Some(contents) = Self::materialize(&mut pages[index], &self.metrics) {
                contents[range.clone()].copy_from_slice(&data[offset..offset + range.len()]);
            }
        });
        Ok(())
    }

    fn fill(&self, addr: usize, len: usize, byte: u8) -> Result<(), PageError> {
        if len == 0 {
            return Ok(());
        }
        let reservation = self.locate(addr, len)?;
        let mut pages = reservation.pages.lock();
        Self::check_committed(&reservation, &pages, addr, len)?;
        Self::for_each_chunk(&reservation, addr, len, |index, range, _| {
            let page = &mut pages[index];
            if byte == 0 {
                let whole_page = range.len() == SYSTEM_PAGE_SIZE;
                if let Page::Committed(contents) = &mut *page {
                    match contents {
                        None => return,
                        Some(_) if whole_page => {
                            *contents = None;
                            PageMetrics::sub(&self.metrics.resident_pages, 1);
                            return;
                        }
                        Some(_) => {}
                    }
                }
            }
            if let Some(contents) = Self::materialize(page, &self.metrics) {
                contents[range].fill(byte);
            }
        });
        Ok(())
    }

    fn update_u32(
        &self,
        addr: usize,
        f: &mut dyn FnMut(u32) -> Option<u32>,
    ) -> Result<Result<u32, u32>, PageError> {
        if addr % 4 != 0 {
            return Err(PageError::Misaligned {
                addr,
                len: 4,
                alignment: 4,
            });
        }
        let reservation = self.locate(addr, 4)?;
        let mut pages = reservation.pages.lock();
        Self::check_committed(&reservation, &pages, addr, 4)?;
        let index = reservation.page_index(addr);
        let offset = addr & SYSTEM_PAGE_OFFSET_MASK;
        let current = match &pages[index] {
            Page::Committed(Some(contents)) => {
                let mut word = [0u8; 4];
                word.copy_from_slice(&contents[offset..offset + 4]);
                u32::from_le_bytes(word)
            }
            _ => 0,
        };
        match f(current) {
            Some(next) => {
                if let Some(contents) = Self::materialize(&mut pages[index], &self.metrics) {
                    contents[offset..offset + 4].copy_from_slice(&next.to_le_bytes());
                }
                Ok(Ok(current))
            }
            None => Ok(Err(current)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_respects_alignment() {
        let space = AddressSpace::with_seed(7);
        let base = space.reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, None).unwrap();
        assert_eq!(base % SUPER_PAGE_SIZE, 0);
        assert!(base >= ADDRESS_SPACE_START);
        assert_eq!(space.reserved_bytes(), SUPER_PAGE_SIZE);
    }

    #[test]
    fn hinted_reservation_lands_contiguously() {
        let space = AddressSpace::with_seed(11);
        let first = space.reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, None).unwrap();
        let second = space
            .reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, Some(first + SUPER_PAGE_SIZE))
            .unwrap();
        assert_eq!(second, first + SUPER_PAGE_SIZE);
    }

    #[test]
    fn occupied_hint_falls_back_to_fresh_range() {
        let space = AddressSpace::with_seed(3);
        let first = space.reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, None).unwrap();
        let second = space
            .reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, Some(first))
            .unwrap();
        assert_ne!(first, second);
        assert!(second >= first + SUPER_PAGE_SIZE || second + SUPER_PAGE_SIZE <= first);
    }

    #[test]
    fn invalid_alignment_rejected() {
        let space = AddressSpace::with_seed(1);
        assert_eq!(
            space.reserve(SYSTEM_PAGE_SIZE, 3000, None),
            Err(PageError::InvalidAlignment { alignment: 3000 })
        );
        assert!(matches!(
            space.reserve(100, SYSTEM_PAGE_SIZE, None),
            Err(PageError::Misaligned { .. })
        ));
    }

    #[test]
    fn limit_caps_reservations() {
        let space = AddressSpace::with_seed(5).with_limit(SUPER_PAGE_SIZE);
        assert!(space.reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, None).is_ok());
        assert_eq!(
            space.reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, None),
            Err(PageError::ReservationFailed {
                size: SUPER_PAGE_SIZE
            })
        );
        assert_eq!(space.metrics().snapshot().reservation_failures, 1);
    }

    #[test]
    fn reserved_pages_are_inaccessible_until_committed() {
        let space = AddressSpace::with_seed(9);
        let base = space.reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, None).unwrap();
        assert_eq!(
            space.write(base, &[1]),
            Err(PageError::NotCommitted { addr: base })
        );
        space.commit(base, SYSTEM_PAGE_SIZE).unwrap();
        assert_eq!(space.page_state(base), Some(PageState::Committed));
        space.write(base + 10, &[1, 2, 3]).unwrap();
        assert_eq!(space.page_state(base), Some(PageState::Resident));
        assert_eq!(space.read_vec(base + 9, 5).unwrap(), vec![0, 1, 2, 3, 0]);
    }

    #[test]
    fn access_spanning_pages() {
        let space = AddressSpace::with_seed(13);
        let base = space.reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, None).unwrap();
        space.commit(base, 2 * SYSTEM_PAGE_SIZE).unwrap();
        let data: Vec<u8> = (0..64).collect();
        let addr = base + SYSTEM_PAGE_SIZE - 32;
        space.write(addr, &data).unwrap();
        assert_eq!(space.read_vec(addr, 64).unwrap(), data);
        // The third page is still reserved.
        assert!(matches!(
            space.fill(base + SYSTEM_PAGE_SIZE, SYSTEM_PAGE_SIZE + 1, 0xAA),
            Err(PageError::NotCommitted { .. })
        ));
    }

    #[test]
    fn decommit_drops_contents_and_discard_zeroes() {
        let space = AddressSpace::with_seed(17);
        let base = space.reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, None).unwrap();
        space.commit(base, 2 * SYSTEM_PAGE_SIZE).unwrap();
        space.fill(base, 2 * SYSTEM_PAGE_SIZE, 0x5A).unwrap();
        assert_eq!(space.committed_bytes(), 2 * SYSTEM_PAGE_SIZE);

        space.discard(base, SYSTEM_PAGE_SIZE).unwrap();
        assert_eq!(space.read_vec(base, 4).unwrap(), vec![0; 4]);
        assert_eq!(space.committed_bytes(), 2 * SYSTEM_PAGE_SIZE);

        space
            .decommit(base + SYSTEM_PAGE_SIZE, SYSTEM_PAGE_SIZE)
            .unwrap();
        assert_eq!(space.committed_bytes(), SYSTEM_PAGE_SIZE);
        assert!(space.read_vec(base + SYSTEM_PAGE_SIZE, 1).is_err());
        space.commit(base + SYSTEM_PAGE_SIZE, SYSTEM_PAGE_SIZE).unwrap();
        assert_eq!(space.read_vec(base + SYSTEM_PAGE_SIZE, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn release_forgets_reservation() {
        let space = AddressSpace::with_seed(19);
        let base = space.reserve(2 * SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, None).unwrap();
        space.commit(base, SYSTEM_PAGE_SIZE).unwrap();
        assert!(matches!(
            space.release(base, SUPER_PAGE_SIZE),
            Err(PageError::UnknownReservation { .. })
        ));
        space.release(base, 2 * SUPER_PAGE_SIZE).unwrap();
        assert_eq!(space.reservation_count(), 0);
        assert_eq!(space.committed_bytes(), 0);
        assert_eq!(space.page_state(base), None);
        assert_eq!(space.read_vec(base, 1), Err(PageError::Unmapped { addr: base }));
    }

    #[test]
    fn update_u32_is_fetch_update() {
        let space = AddressSpace::with_seed(23);
        let base = space.reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, None).unwrap();
        space.commit(base, SYSTEM_PAGE_SIZE).unwrap();
        space.write_u32(base + 8, 5).unwrap();
        assert_eq!(space.update_u32(base + 8, &mut |v| Some(v + 1)), Ok(Ok(5)));
        assert_eq!(space.read_u32(base + 8), Ok(6));
        assert_eq!(space.update_u32(base + 8, &mut |_| None), Ok(Err(6)));
        assert!(space.update_u32(base + 9, &mut |v| Some(v)).is_err());
    }

    #[test]
    fn zero_fill_of_whole_page_drops_contents() {
        let space = AddressSpace::with_seed(29);
        let base = space.reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, None).unwrap();
        space.commit(base, SYSTEM_PAGE_SIZE).unwrap();
        space.fill(base, 16, 0xCD).unwrap();
        assert_eq!(space.metrics().snapshot().resident_pages, 1);
        space.fill(base, SYSTEM_PAGE_SIZE, 0).unwrap();
        assert_eq!(space.page_state(base), Some(PageState::Committed));
        assert_eq!(space.metrics().snapshot().resident_pages, 0);
    }
}
