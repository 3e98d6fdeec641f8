//! Super-page and direct-map bookkeeping.
//!
//! Every super page (and the first super page of every direct map) has a
//! metadata table with one entry per partition page. An entry packs the
//! owning span and bucket so a pointer resolves to its span without taking
//! the root lock:
//!
//! ```text
//! bits  0..8   bucket index
//! bits  8..16  partition-page offset from the span's first page
//! bits 16..48  span id + 1 (zero marks an unused page)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use partalloc_pages::geometry::{
    NUM_PARTITION_PAGES_PER_SUPER_PAGE, PARTITION_PAGE_SIZE, SUPER_PAGE_SIZE, partition_page_index,
    super_page_base,
};

use crate::slot_span::SpanId;

/// Decoded partition-page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageEntry {
    pub span: SpanId,
    pub bucket: usize,
    pub page_offset: usize,
}

impl PageEntry {
    fn encode(self) -> u64 {
        (self.bucket as u64 & 0xff)
            | ((self.page_offset as u64 & 0xff) << 8)
            | ((u64::from(self.span.0) + 1) << 16)
    }

    fn decode(raw: u64) -> Option<Self> {
        let span = (raw >> 16) & 0xffff_ffff;
        if span == 0 {
            return None;
        }
        Some(Self {
            span: SpanId((span - 1) as u32),
            bucket: (raw & 0xff) as usize,
            page_offset: ((raw >> 8) & 0xff) as usize,
        })
    }
}

/// Metadata of one super page.
#[derive(Debug)]
pub(crate) struct SuperPageMetadata {
    pub base: usize,
    /// Owning root's integrity value.
    pub root_tag: u64,
    pages: Box<[AtomicU64]>,
}

impl SuperPageMetadata {
    pub fn new(base: usize, root_tag: u64) -> Self {
        debug_assert_eq!(super_page_base(base), base);
        let pages = (0..NUM_PARTITION_PAGES_PER_SUPER_PAGE)
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            base,
            root_tag,
            pages,
        }
    }

    /// Point `num_partition_pages` pages starting at `span_base` at `span`.
    pub fn map_span(&self, span_base: usize, num_partition_pages: usize, span: SpanId, bucket: usize) {
        let first = partition_page_index(span_base);
        for offset in 0..num_partition_pages {
            let entry = PageEntry {
                span,
                bucket,
                page_offset: offset,
            };
            self.pages[first + offset].store(entry.encode(), Ordering::Release);
        }
    }

    /// Entry of the partition page containing `addr`.
    pub fn lookup(&self, addr: usize) -> Option<PageEntry> {
        if super_page_base(addr) != self.base {
            return None;
        }
        PageEntry::decode(self.pages[partition_page_index(addr)].load(Ordering::Acquire))
    }

    /// Base of the partition page containing `addr`, minus the span offset.
    pub fn span_base(addr: usize, entry: PageEntry) -> usize {
        (addr & !(PARTITION_PAGE_SIZE - 1)) - entry.page_offset * PARTITION_PAGE_SIZE
    }
}

/// Run of consecutive super pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperPageExtent {
    pub super_page_base: usize,
    pub number_of_consecutive_super_pages: usize,
}

impl SuperPageExtent {
    pub fn end(&self) -> usize {
        self.super_page_base + self.number_of_consecutive_super_pages * SUPER_PAGE_SIZE
    }
}

/// One direct-mapped allocation's reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirectMapExtent {
    pub reservation_base: usize,
    pub reservation_size: usize,
    pub span: SpanId,
}

/// Per-root extent chains and the carving cursor of the current super page.
#[derive(Debug, Default)]
pub(crate) struct Extents {
    pub super_pages: Vec<SuperPageExtent>,
    pub direct_maps: Vec<DirectMapExtent>,
    /// Where the next super page should land to extend the current extent.
    pub next_super_page: Option<usize>,
    pub next_partition_page: usize,
    pub next_partition_page_end: usize,
}

impl Extents {
    pub fn available_partition_bytes(&self) -> usize {
        self.next_partition_page_end - self.next_partition_page
    }

    /// Start carving from a freshly reserved super page. The first and the
    /// last partition page stay unused as guards.
    pub fn add_super_page(&mut self, base: usize, contiguous: bool) {
        match self.super_pages.last_mut() {
            Some(extent) if contiguous && extent.end() == base => {
                extent.number_of_consecutive_super_pages += 1;
            }
            _ => self.super_pages.push(SuperPageExtent {
                super_page_base: base,
                number_of_consecutive_super_pages: 1,
            }),
        }
        self.next_partition_page = base + PARTITION_PAGE_SIZE;
        self.next_partition_page_end = base + SUPER_PAGE_SIZE - PARTITION_PAGE_SIZE;
        self.next_super_page = Some(base + SUPER_PAGE_SIZE);
    }

    pub fn super_page_count(&self) -> usize {
        self.super_pages
            .iter()
            .map(|e| e.number_of_consecutive_super_pages)
            .sum()
    }

    /// Every super page base, in reservation order.
    pub fn super_page_bases(&self) -> impl Iterator<Item = usize> + '_ {
        self.super_pages.iter().flat_map(|extent| {
            (0..extent.number_of_consecutive_super_pages)
                .map(move |i| extent.super_page_base + i * SUPER_PAGE_SIZE)
        })
    }

    pub fn take_direct_map(&mut self, span: SpanId) -> Option<DirectMapExtent> {
        let index = self.direct_maps.iter().position(|e| e.span == span)?;
        Some(self.direct_maps.swap_remove(index))
    }

    pub fn direct_map(&self, span: SpanId) -> Option<&DirectMapExtent> {
        self.direct_maps.iter().find(|e| e.span == span)
    }
}
