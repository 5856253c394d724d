//! Heap Regions
//!
//! A region is one contiguous span of memory handed to the heap. All node
//! headers live inline in the span and are addressed by byte offset from
//! the region base, so every access is a bounds-checked load or store here
//! instead of a pointer cast somewhere else.
//!
//! # Region Layout
//! ```text
//! base                                                     base + span
//! ┌──────────┬──────────────────────────────────┬──────────┐
//! │   head   │  nodes (allocated / free) ...    │   tail   │
//! │ sentinel │                                  │ sentinel │
//! └──────────┴──────────────────────────────────┴──────────┘
//! ```

use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use super::config::{align_down, align_up, GRANULE, MAX_REGIONS};
use super::freelist::FreeIndex;

/// Borrowed backing memory for one heap region.
///
/// The base is always `GRANULE` aligned and the length a multiple of
/// `GRANULE`; construction trims the ends of the caller's span as needed.
#[derive(Debug)]
pub struct RegionMemory<'a> {
    base: NonNull<u8>,
    len: usize,
    _memory: PhantomData<&'a mut [u8]>,
}

impl<'a> RegionMemory<'a> {
    /// Wrap a mutable byte slice.
    pub fn new(bytes: &'a mut [u8]) -> Self {
        let addr = bytes.as_mut_ptr() as usize;
        let (shift, len) = trim(addr, bytes.len());
        // SAFETY: `shift <= bytes.len()`, so the result stays inside (or one
        // past the end of) the slice and is non-null.
        let base = unsafe { NonNull::new_unchecked(bytes.as_mut_ptr().add(shift)) };
        Self {
            base,
            len,
            _memory: PhantomData,
        }
    }

    /// Wrap a raw span such as a linker-provided heap window.
    ///
    /// # Safety
    /// `addr..addr + len` must be valid for reads and writes for `'a` and
    /// must not be accessed through any other path while the heap owns it.
    pub unsafe fn from_raw_parts(addr: usize, len: usize) -> Self {
        let (shift, len) = trim(addr, len);
        let (base, len) = match NonNull::new((addr + shift) as *mut u8) {
            Some(base) => (base, len),
            None => (NonNull::dangling(), 0),
        };
        Self {
            base,
            len,
            _memory: PhantomData,
        }
    }

    /// Address of the first usable byte.
    #[inline]
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Usable length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing usable remained after alignment.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `addr` falls inside this span.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.len
    }

    #[inline]
    fn in_bounds(&self, offset: usize, width: usize) -> bool {
        offset % width == 0 && offset.checked_add(width).is_some_and(|end| end <= self.len)
    }

    /// Pointer to `offset` within the span.
    #[inline]
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= self.len, "region offset {:#x} out of bounds", offset);
        // SAFETY: `offset` is within the span (or one past its end).
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Read a `u32` at an aligned offset; `None` if it lies outside the span.
    ///
    /// Loads are volatile: the interrupt-context checker may read headers
    /// while another context is rewriting them.
    #[inline]
    pub(crate) fn load_u32(&self, offset: usize) -> Option<u32> {
        if !self.in_bounds(offset, 4) {
            return None;
        }
        // SAFETY: bounds and alignment were checked above.
        Some(unsafe { ptr::read_volatile(self.base.as_ptr().add(offset) as *const u32) })
    }

    /// Write a `u32` at an aligned offset.
    ///
    /// Callers only store to offsets they have already validated; a store
    /// outside the span is a kernel bug and panics.
    #[inline]
    pub(crate) fn store_u32(&mut self, offset: usize, value: u32) {
        assert!(self.in_bounds(offset, 4), "region store at {:#x} out of bounds", offset);
        // SAFETY: bounds and alignment were checked above.
        unsafe { ptr::write(self.base.as_ptr().add(offset) as *mut u32, value) }
    }

    #[inline]
    pub(crate) fn load_u64(&self, offset: usize) -> Option<u64> {
        if !self.in_bounds(offset, 8) {
            return None;
        }
        // SAFETY: bounds and alignment were checked above.
        Some(unsafe { ptr::read_volatile(self.base.as_ptr().add(offset) as *const u64) })
    }

    #[inline]
    pub(crate) fn store_u64(&mut self, offset: usize, value: u64) {
        assert!(self.in_bounds(offset, 8), "region store at {:#x} out of bounds", offset);
        // SAFETY: bounds and alignment were checked above.
        unsafe { ptr::write(self.base.as_ptr().add(offset) as *mut u64, value) }
    }

    /// Fill `len` bytes starting at `offset`.
    pub(crate) fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        assert!(offset.checked_add(len).is_some_and(|end| end <= self.len));
        // SAFETY: range checked above.
        unsafe { ptr::write_bytes(self.base.as_ptr().add(offset), byte, len) }
    }

    /// Copy `len` bytes from `src` to `dst`; the ranges may not overlap.
    pub(crate) fn copy_nonoverlapping(&mut self, src: usize, dst: usize, len: usize) {
        assert!(src.checked_add(len).is_some_and(|end| end <= self.len));
        assert!(dst.checked_add(len).is_some_and(|end| end <= self.len));
        assert!(src + len <= dst || dst + len <= src, "overlapping copy");
        // SAFETY: both ranges are in bounds and disjoint.
        unsafe {
            ptr::copy_nonoverlapping(
                self.base.as_ptr().add(src),
                self.base.as_ptr().add(dst),
                len,
            )
        }
    }
}

/// Returns `(shift, len)` for the `GRANULE`-aligned window of a span.
fn trim(addr: usize, len: usize) -> (usize, usize) {
    let Some(end) = addr.checked_add(len) else {
        return (0, 0);
    };
    let start = align_up(addr, GRANULE);
    let end = align_down(end, GRANULE);
    if end <= start {
        return (0, 0);
    }
    (start - addr, end - start)
}

/// Public description of a region: byte range plus live node count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Address of the head sentinel.
    pub start: usize,
    /// One past the tail sentinel.
    pub end: usize,
    /// Nodes currently in the region, sentinels included.
    pub nodes: usize,
    /// Nodes linked in the region's free lists.
    pub free_nodes: usize,
}

/// One managed region: its memory, end sentinel offset, and free lists.
#[derive(Debug)]
pub(crate) struct Region<'a> {
    pub mem: RegionMemory<'a>,
    /// Offset of the tail sentinel.
    pub tail: usize,
    pub nodes: usize,
    pub free: FreeIndex,
}

impl Region<'_> {
    pub fn info(&self) -> RegionInfo {
        RegionInfo {
            start: self.mem.base(),
            end: self.mem.base() + self.span(),
            nodes: self.nodes,
            free_nodes: self.free.len(),
        }
    }

    /// Length of the span covered by nodes, both sentinels included.
    #[inline]
    pub fn span(&self) -> usize {
        self.mem.len()
    }
}

/// Fixed-capacity table of regions, append-only.
#[derive(Debug)]
pub(crate) struct RegionTable<'a> {
    slots: [Option<Region<'a>>; MAX_REGIONS],
    len: usize,
}

impl<'a> RegionTable<'a> {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_REGIONS],
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn push(&mut self, region: Region<'a>) -> usize {
        let index = self.len;
        self.slots[index] = Some(region);
        self.len += 1;
        index
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Region<'a>> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Region<'a>> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region<'a>> {
        self.slots[..self.len].iter().flatten()
    }

    /// Index of the region whose span contains `addr`.
    pub fn find_containing(&self, addr: usize) -> Option<usize> {
        self.iter().position(|region| region.mem.contains(addr))
    }

    /// Whether `[start, end)` intersects any registered region.
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.iter().any(|region| {
            let other = region.mem.base();
            start < other + region.mem.len() && other < end
        })
    }
}
