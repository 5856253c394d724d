//! Memory management module for PantherOS
//!
//! Provides:
//! - A multi-region boundary-tag kernel heap
//! - Online heap corruption checking
//! - A lock-protected global allocator that is safe to call from
//!   interrupt handlers
//!
//! # Security Principles
//! - All header accesses are bounds-checked against their region
//! - Corruption is detected and reported with both suspect nodes
//! - Unsafe code is minimal and confined to `region` and `allocator`

mod allocator;
mod check;
mod config;
mod freelist;
mod heap;
mod node;
mod region;

pub use allocator::{LockedHeap, DEFERRED_FREES};
pub use check::{check_heap, CorruptionKind, CorruptionReport, LinkMismatch, Suspects};
pub use config::{
    align_down, align_up, HeapConfig, ALLOC_BIT, COMPACT_HEADER, GRANULE, MAX_REGIONS,
    MAX_REGION_SPAN, TRACKED_HEADER,
};
pub use heap::{ConfigError, Heap, HeapError, HeapStats, Walk};
pub use node::{NodeInfo, Owner};
pub use region::{RegionInfo, RegionMemory};
