//! Boundary-Tag Heap
//!
//! The allocator core: region setup, allocate, free with coalescing, and
//! reallocation. `Heap` is the sole mutator of the node chain; it is not
//! synchronized by itself, see [`super::allocator::LockedHeap`] for the
//! locked wrapper the kernel uses.
//!
//! # Invariants
//! Hold whenever no operation is in progress:
//! - adjacent nodes `A`, `B`: `A.size == B.preceding & !ALLOC_BIT`
//! - walking by `size` from the head sentinel lands exactly on the tail
//! - sentinels are allocated and never merged
//! - every free node is linked exactly once, with symmetric links
//! - node sizes in a region sum to the region span

use core::fmt;
use core::ptr::NonNull;

use super::check::{self, CorruptionReport};
use super::config::{HeapConfig, ALLOC_BIT, GRANULE, MAX_REGION_SPAN};
use super::freelist::FreeIndex;
use super::node::{self, Header, NodeInfo, Owner};
use super::region::{Region, RegionInfo, RegionMemory, RegionTable};

/// Heap setup errors. These are configuration mistakes, not runtime
/// conditions; the kernel treats them as fatal at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration itself is unusable.
    InvalidConfig,
    /// The region table is full.
    TooManyRegions,
    /// The span cannot hold two sentinels and one free node.
    RegionTooSmall,
    /// The span exceeds what the size fields can describe.
    RegionTooLarge,
    /// The span intersects a region already managed.
    Overlap,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig => write!(f, "invalid heap configuration"),
            Self::TooManyRegions => write!(f, "region table full"),
            Self::RegionTooSmall => write!(f, "region too small"),
            Self::RegionTooLarge => write!(f, "region too large"),
            Self::Overlap => write!(f, "region overlaps an existing region"),
        }
    }
}

/// Runtime heap errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// Zero-byte requests are refused.
    ZeroSize,
    /// No free node is large enough. The heap is unchanged.
    OutOfMemory { requested: usize },
    /// The pointer does not name the payload of an allocated node.
    InvalidPointer,
    /// The pointer names a node that is already free.
    DoubleFree,
    /// A header or link the operation depends on is unreadable.
    Corrupted { region: usize, offset: usize },
    /// The heap lock is held and the caller may not block.
    WouldBlock,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize => write!(f, "zero-size allocation"),
            Self::OutOfMemory { requested } => write!(f, "out of memory ({} bytes)", requested),
            Self::InvalidPointer => write!(f, "pointer is not a live allocation"),
            Self::DoubleFree => write!(f, "double free"),
            Self::Corrupted { region, offset } => {
                write!(f, "heap corrupted in region {} at offset {:#x}", region, offset)
            }
            Self::WouldBlock => write!(f, "heap busy"),
        }
    }
}

/// Usage totals across all regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes under management, sentinels included.
    pub arena: usize,
    /// Bytes in allocated nodes, headers and sentinels included.
    pub used: usize,
    /// Bytes in free nodes.
    pub free: usize,
    /// Number of free nodes.
    pub free_chunks: usize,
    /// Size of the largest free node.
    pub largest_free: usize,
    /// Number of nodes, sentinels included.
    pub nodes: usize,
}

/// A multi-region boundary-tag heap.
pub struct Heap<'a> {
    config: HeapConfig,
    regions: RegionTable<'a>,
}

// SAFETY: The heap has exclusive access to the memory of every region it
// manages; moving it to another context moves that access with it.
unsafe impl Send for Heap<'_> {}

impl<'a> Heap<'a> {
    /// An empty heap with no regions.
    pub const fn new(config: HeapConfig) -> Self {
        Self {
            config,
            regions: RegionTable::new(),
        }
    }

    /// Build a heap over `regions`.
    pub fn initialize<I>(config: HeapConfig, regions: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = RegionMemory<'a>>,
    {
        config.validate()?;
        let mut heap = Self::new(config);
        for mem in regions {
            heap.add_region(mem)?;
        }
        Ok(heap)
    }

    /// Place sentinels in `mem` and hand the span between them to the
    /// free lists. Returns the new region index.
    pub fn add_region(&mut self, mut mem: RegionMemory<'a>) -> Result<usize, ConfigError> {
        self.config.validate()?;
        if self.regions.len() >= self.config.max_regions {
            return Err(ConfigError::TooManyRegions);
        }
        let span = mem.len();
        if span < self.config.min_region_span() {
            return Err(ConfigError::RegionTooSmall);
        }
        if span > MAX_REGION_SPAN {
            return Err(ConfigError::RegionTooLarge);
        }
        if self.regions.overlaps(mem.base(), mem.base() + span) {
            return Err(ConfigError::Overlap);
        }

        let hdr = self.config.header_size();
        let tail = span - hdr;
        let free_size = (span - 2 * hdr) as u32;

        node::write_header(&mut mem, 0, Header { size: hdr as u32, preceding: ALLOC_BIT });
        node::write_header(&mut mem, hdr, Header { size: free_size, preceding: hdr as u32 });
        node::write_header(&mut mem, tail, Header { size: hdr as u32, preceding: free_size | ALLOC_BIT });

        if self.config.track_owners {
            node::write_owner(&mut mem, 0, Owner::UNKNOWN);
            node::write_owner(&mut mem, tail, Owner::UNKNOWN);
        }

        let mut free = FreeIndex::new();
        free.insert(&mut mem, hdr, free_size);

        log::debug!(
            "kmm: region {} at {:#x}, {} bytes ({} free)",
            self.regions.len(),
            mem.base(),
            span,
            free_size
        );
        Ok(self.regions.push(Region {
            mem,
            tail,
            nodes: 3,
            free,
        }))
    }

    /// The configuration this heap was built with.
    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Number of regions.
    #[inline]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Description of region `index`.
    pub fn region(&self, index: usize) -> Option<RegionInfo> {
        self.regions.get(index).map(Region::info)
    }

    pub(crate) fn regions(&self) -> &RegionTable<'a> {
        &self.regions
    }

    #[cfg(test)]
    pub(crate) fn region_mut(&mut self, index: usize) -> Option<&mut Region<'a>> {
        self.regions.get_mut(index)
    }

    /// Chunk size needed to serve a `size`-byte request.
    fn chunk_size(&self, size: usize) -> Result<u32, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let oom = HeapError::OutOfMemory { requested: size };
        let payload = size.checked_add(GRANULE - 1).ok_or(oom)? & !(GRANULE - 1);
        let chunk = payload
            .checked_add(self.config.header_size())
            .ok_or(oom)?;
        if chunk > MAX_REGION_SPAN {
            return Err(oom);
        }
        Ok(chunk as u32)
    }

    /// Allocate `size` bytes, first fit across regions in order.
    ///
    /// The payload is `GRANULE` aligned. `owner` is recorded only when the
    /// heap tracks owners.
    pub fn allocate(&mut self, size: usize, owner: Owner) -> Result<NonNull<u8>, HeapError> {
        let required = self.chunk_size(size)?;
        let config = self.config;
        for index in 0..self.regions.len() {
            let Some(region) = self.regions.get_mut(index) else {
                continue;
            };
            let Some(offset) = region.free.find(&region.mem, required) else {
                continue;
            };
            carve(region, index, offset, required, &config)?;
            if config.track_owners {
                node::write_owner(&mut region.mem, offset, owner);
            }
            log::trace!("kmm: alloc {} bytes -> region {} offset {:#x}", size, index, offset);
            return Ok(region.mem.ptr_at(offset + config.header_size()));
        }
        log::debug!("kmm: out of memory for {} bytes", size);
        Err(HeapError::OutOfMemory { requested: size })
    }

    /// Allocate `size` bytes and zero the payload.
    pub fn allocate_zeroed(&mut self, size: usize, owner: Owner) -> Result<NonNull<u8>, HeapError> {
        let ptr = self.allocate(size, owner)?;
        let (index, offset, header) = self.locate(ptr)?;
        let hdr = self.config.header_size();
        if let Some(region) = self.regions.get_mut(index) {
            region.mem.fill(offset + hdr, header.size as usize - hdr, 0);
        }
        Ok(ptr)
    }

    /// Return an allocation to the heap, merging it with free neighbours.
    ///
    /// Pointers that do not pass the structural header checks are refused
    /// and trip a debug assertion; the heap is left unchanged. A node whose
    /// boundary tags are damaged is refused with `Corrupted` and never
    /// merged.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let (index, offset, header) = match self.locate(ptr) {
            Ok(found) => found,
            Err(err @ HeapError::Corrupted { .. }) => {
                log::error!("kmm: refused free of {:p}: {}", ptr.as_ptr(), err);
                return Err(err);
            }
            Err(err) => {
                log::warn!("kmm: rejected free of {:p}: {}", ptr.as_ptr(), err);
                debug_assert!(false, "invalid free of {:p}: {}", ptr.as_ptr(), err);
                return Err(err);
            }
        };
        let hdr = self.config.header_size();
        let region = self.regions.get_mut(index).ok_or(HeapError::InvalidPointer)?;
        release(region, index, offset, header, hdr)?;
        log::trace!("kmm: free region {} offset {:#x}", index, offset);
        Ok(())
    }

    /// Resize an allocation, in place when the node or its free successor
    /// allows it, otherwise by moving it. On failure the original
    /// allocation is untouched.
    pub fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
        owner: Owner,
    ) -> Result<NonNull<u8>, HeapError> {
        let required = self.chunk_size(size)?;
        let (index, offset, header) = self.locate(ptr)?;
        let config = self.config;
        let hdr = config.header_size();
        let region = self.regions.get_mut(index).ok_or(HeapError::InvalidPointer)?;

        if required <= header.size {
            shrink(region, index, offset, header, required, &config)?;
            return Ok(ptr);
        }
        if grow_in_place(region, index, offset, header, required, &config)? {
            return Ok(ptr);
        }

        let new_ptr = self.allocate(size, owner)?;
        let (new_index, new_offset, _) = self.locate(new_ptr)?;
        let keep = header.size as usize - hdr;
        if new_index == index {
            let region = self.regions.get_mut(index).ok_or(HeapError::InvalidPointer)?;
            region.mem.copy_nonoverlapping(offset + hdr, new_offset + hdr, keep);
        } else {
            // SAFETY: both payloads are live, disjoint allocations in
            // different regions, each at least `keep` bytes long.
            unsafe {
                core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), keep);
            }
        }
        self.free(ptr)?;
        Ok(new_ptr)
    }

    /// Usable payload bytes behind `ptr`.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let (_, _, header) = self.locate(ptr)?;
        Ok(header.size as usize - self.config.header_size())
    }

    /// Find the region, node offset and header behind a payload pointer,
    /// applying every structural check that can be made cheaply.
    fn locate(&self, ptr: NonNull<u8>) -> Result<(usize, usize, Header), HeapError> {
        let addr = ptr.as_ptr() as usize;
        let hdr = self.config.header_size();
        let index = self
            .regions
            .find_containing(addr)
            .ok_or(HeapError::InvalidPointer)?;
        let region = self.regions.get(index).ok_or(HeapError::InvalidPointer)?;
        let rel = addr - region.mem.base();
        if rel % GRANULE != 0 || rel < 2 * hdr {
            return Err(HeapError::InvalidPointer);
        }
        let offset = rel - hdr;
        if offset >= region.tail {
            return Err(HeapError::InvalidPointer);
        }
        let header = node::read_header(&region.mem, offset).ok_or(HeapError::InvalidPointer)?;
        if !header.is_allocated() {
            return Err(HeapError::DoubleFree);
        }
        let size = header.size as usize;
        if size < self.config.min_chunk() || size % GRANULE != 0 || offset + size > region.tail {
            return Err(HeapError::InvalidPointer);
        }
        let next = node::read_header(&region.mem, offset + size).ok_or(HeapError::InvalidPointer)?;
        if next.prev_size() != header.size {
            return Err(HeapError::InvalidPointer);
        }

        // The successor vouches for this node, so a bad back tag is damage,
        // not a stray pointer.
        let preceding = header.prev_size() as usize;
        let sound_prev = preceding != 0
            && preceding % GRANULE == 0
            && offset.checked_sub(preceding).is_some_and(|prev_off| {
                node::read_header(&region.mem, prev_off).is_some_and(|prev| {
                    prev.size as usize == preceding
                        && (prev.is_allocated() || preceding >= self.config.min_chunk())
                })
            });
        if !sound_prev {
            return Err(HeapError::Corrupted { region: index, offset });
        }
        Ok((index, offset, header))
    }

    /// Walk the nodes of region `index`, sentinels included.
    pub fn walk(&self, index: usize) -> Walk<'_, 'a> {
        Walk {
            heap: self,
            region: index,
            cursor: self.regions.get(index).map(|_| 0),
        }
    }

    /// Totals over every region.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();
        for index in 0..self.regions.len() {
            if let Some(region) = self.regions.get(index) {
                stats.arena += region.span();
            }
            for info in self.walk(index) {
                stats.nodes += 1;
                if info.allocated {
                    stats.used += info.size as usize;
                } else {
                    stats.free += info.size as usize;
                    stats.free_chunks += 1;
                    stats.largest_free = stats.largest_free.max(info.size as usize);
                }
            }
        }
        stats
    }

    /// Validate every region; see [`check::check_heap`].
    pub fn check(&self) -> Result<(), CorruptionReport> {
        check::check_heap(self)
    }
}

impl fmt::Debug for Heap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.config)
            .field("regions", &self.regions.len())
            .finish()
    }
}

fn corrupted(region: usize, offset: usize) -> HeapError {
    log::error!("kmm: unreadable node in region {} at offset {:#x}", region, offset);
    HeapError::Corrupted { region, offset }
}

/// Turn the free node at `offset` into an allocated node of `required`
/// bytes, splitting off the remainder when it is large enough.
fn carve(
    region: &mut Region<'_>,
    index: usize,
    offset: usize,
    required: u32,
    config: &HeapConfig,
) -> Result<(), HeapError> {
    let hdr = config.header_size();
    let header = node::read_header(&region.mem, offset).ok_or_else(|| corrupted(index, offset))?;
    region
        .free
        .remove(&mut region.mem, offset, header.size, hdr)
        .ok_or_else(|| corrupted(index, offset))?;

    let mut size = header.size;
    let remainder = header.size - required;
    if remainder as usize >= config.min_chunk() {
        let rest = offset + required as usize;
        node::write_header(&mut region.mem, rest, Header { size: remainder, preceding: required });
        node::retag_preceding(&mut region.mem, rest + remainder as usize, remainder)
            .ok_or_else(|| corrupted(index, rest))?;
        region.free.insert(&mut region.mem, rest, remainder);
        region.nodes += 1;
        size = required;
    }
    node::write_header(
        &mut region.mem,
        offset,
        Header {
            size,
            preceding: header.preceding | ALLOC_BIT,
        },
    );
    Ok(())
}

/// Free the allocated node at `offset`, merging with free neighbours.
fn release(
    region: &mut Region<'_>,
    index: usize,
    offset: usize,
    header: Header,
    hdr: usize,
) -> Result<(), HeapError> {
    let mut start = offset;
    let mut size = header.size;
    let mut preceding = header.prev_size();

    if preceding != 0 {
        let prev_off = offset - preceding as usize;
        let prev = node::read_header(&region.mem, prev_off).ok_or_else(|| corrupted(index, prev_off))?;
        if !prev.is_allocated() {
            region
                .free
                .remove(&mut region.mem, prev_off, prev.size, hdr)
                .ok_or_else(|| corrupted(index, prev_off))?;
            start = prev_off;
            size += prev.size;
            preceding = prev.prev_size();
            region.nodes -= 1;
        }
    }

    let next_off = offset + header.size as usize;
    let next = node::read_header(&region.mem, next_off).ok_or_else(|| corrupted(index, next_off))?;
    if !next.is_allocated() {
        region
            .free
            .remove(&mut region.mem, next_off, next.size, hdr)
            .ok_or_else(|| corrupted(index, next_off))?;
        size += next.size;
        region.nodes -= 1;
    }

    node::write_header(&mut region.mem, start, Header { size, preceding });
    node::retag_preceding(&mut region.mem, start + size as usize, size)
        .ok_or_else(|| corrupted(index, start))?;
    region.free.insert(&mut region.mem, start, size);
    Ok(())
}

/// Give the tail of an allocated node back, merging it with a free
/// successor.
fn shrink(
    region: &mut Region<'_>,
    index: usize,
    offset: usize,
    header: Header,
    required: u32,
    config: &HeapConfig,
) -> Result<(), HeapError> {
    let hdr = config.header_size();
    let next_off = offset + header.size as usize;
    let next = node::read_header(&region.mem, next_off).ok_or_else(|| corrupted(index, next_off))?;
    let mut rest_size = header.size - required;
    if !next.is_allocated() {
        region
            .free
            .remove(&mut region.mem, next_off, next.size, hdr)
            .ok_or_else(|| corrupted(index, next_off))?;
        rest_size += next.size;
        region.nodes -= 1;
    } else if (rest_size as usize) < config.min_chunk() {
        return Ok(());
    }

    let rest = offset + required as usize;
    node::write_header(&mut region.mem, rest, Header { size: rest_size, preceding: required });
    node::retag_preceding(&mut region.mem, rest + rest_size as usize, rest_size)
        .ok_or_else(|| corrupted(index, rest))?;
    region.free.insert(&mut region.mem, rest, rest_size);
    region.nodes += 1;
    node::write_header(
        &mut region.mem,
        offset,
        Header {
            size: required,
            preceding: header.preceding,
        },
    );
    Ok(())
}

/// Extend an allocated node into its free successor. Returns `false` when
/// the successor is allocated or too small; nothing is changed then.
fn grow_in_place(
    region: &mut Region<'_>,
    index: usize,
    offset: usize,
    header: Header,
    required: u32,
    config: &HeapConfig,
) -> Result<bool, HeapError> {
    let hdr = config.header_size();
    let next_off = offset + header.size as usize;
    let next = node::read_header(&region.mem, next_off).ok_or_else(|| corrupted(index, next_off))?;
    if next.is_allocated() || header.size + next.size < required {
        return Ok(false);
    }
    region
        .free
        .remove(&mut region.mem, next_off, next.size, hdr)
        .ok_or_else(|| corrupted(index, next_off))?;

    let combined = header.size + next.size;
    let remainder = combined - required;
    let size = if remainder as usize >= config.min_chunk() {
        let rest = offset + required as usize;
        node::write_header(&mut region.mem, rest, Header { size: remainder, preceding: required });
        node::retag_preceding(&mut region.mem, rest + remainder as usize, remainder)
            .ok_or_else(|| corrupted(index, rest))?;
        region.free.insert(&mut region.mem, rest, remainder);
        required
    } else {
        node::retag_preceding(&mut region.mem, offset + combined as usize, combined)
            .ok_or_else(|| corrupted(index, offset))?;
        region.nodes -= 1;
        combined
    };
    node::write_header(
        &mut region.mem,
        offset,
        Header {
            size,
            preceding: header.preceding,
        },
    );
    Ok(true)
}

/// Iterator over the nodes of one region, in address order.
///
/// Stops after the tail sentinel, or early if a size field would step
/// outside the region; use the checker to find out why.
pub struct Walk<'h, 'a> {
    heap: &'h Heap<'a>,
    region: usize,
    cursor: Option<usize>,
}

impl Iterator for Walk<'_, '_> {
    type Item = NodeInfo;

    fn next(&mut self) -> Option<NodeInfo> {
        let offset = self.cursor?;
        let region = self.heap.regions.get(self.region)?;
        let info = NodeInfo::read(&region.mem, offset, &self.heap.config)?;
        let next = offset + info.size as usize;
        self.cursor = if offset == region.tail
            || info.size == 0
            || info.size as usize % GRANULE != 0
            || next > region.tail
        {
            None
        } else {
            Some(next)
        };
        Some(info)
    }
}
