//! Kernel Heap Allocator
//!
//! `LockedHeap` serializes every heap mutation behind one spinlock and
//! serves as the kernel's `#[global_allocator]`.
//!
//! # Interrupt Context
//! Blocking on the heap lock from an interrupt handler can deadlock
//! against the task it interrupted, so:
//! - mutators only `try_lock` and return `HeapError::WouldBlock`
//! - `free` (and `dealloc`) park the pointer instead, and the next
//!   operation that takes the lock reclaims it
//! - the corruption checker uses the lock when it is free and otherwise
//!   walks unlocked, accepting that a mutation in flight on another core
//!   may be reported as corruption
//!
//! # Security Considerations
//! - Corruption results are returned, never acted on here
//! - Invalid frees are refused and logged
//! - Alignments above `GRANULE` are refused, not approximated

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::mutex::{SpinMutex, SpinMutexGuard};

use super::check::{self, CorruptionReport};
use super::config::{HeapConfig, GRANULE};
use super::heap::{ConfigError, Heap, HeapError, HeapStats};
use super::node::Owner;
use super::region::RegionMemory;
use crate::irq::{ExecutionContext, TaskContext};

/// Frees that can wait for the lock when issued from interrupt context.
pub const DEFERRED_FREES: usize = 32;

/// Payload addresses freed while the lock was unavailable, reclaimed by the
/// next operation that takes it. Zero marks an empty slot.
struct DeferredFrees {
    slots: [AtomicUsize; DEFERRED_FREES],
    pending: AtomicUsize,
}

impl DeferredFrees {
    const fn new() -> Self {
        Self {
            slots: [const { AtomicUsize::new(0) }; DEFERRED_FREES],
            pending: AtomicUsize::new(0),
        }
    }

    /// Park `ptr`; `false` when every slot is taken.
    fn push(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        // Counted before the slot is visible, so `drain` never underflows.
        self.pending.fetch_add(1, Ordering::AcqRel);
        let parked = self.slots.iter().any(|slot| {
            slot.compare_exchange(0, addr, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        });
        if !parked {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        parked
    }

    fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn drain(&self, heap: &mut Heap<'_>) {
        if self.len() == 0 {
            return;
        }
        for slot in &self.slots {
            let addr = slot.swap(0, Ordering::AcqRel);
            let Some(ptr) = NonNull::new(addr as *mut u8) else {
                continue;
            };
            self.pending.fetch_sub(1, Ordering::AcqRel);
            // Refusals are logged by the heap.
            let _ = heap.free(ptr);
        }
    }
}

/// A [`Heap`] behind a spinlock, aware of the execution context.
pub struct LockedHeap<'a, C = TaskContext> {
    heap: SpinMutex<Heap<'a>>,
    deferred: DeferredFrees,
    context: C,
}

impl<'a, C: ExecutionContext> LockedHeap<'a, C> {
    /// An empty heap; regions are added by `init` or `add_region`.
    pub const fn new(config: HeapConfig, context: C) -> Self {
        Self {
            heap: SpinMutex::new(Heap::new(config)),
            deferred: DeferredFrees::new(),
            context,
        }
    }

    /// Replace the heap with one built over `regions`.
    ///
    /// Intended for boot, before anything has been allocated. Must not run
    /// while an interrupt handler may call `check_corruption`: the region
    /// table is rebuilt in place and the unlocked checker reads it.
    pub fn init<I>(&self, regions: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = RegionMemory<'a>>,
    {
        let mut heap = self.heap.lock();
        *heap = Heap::initialize(*heap.config(), regions)?;
        log::info!("kmm: heap initialized, {} bytes", heap.stats().arena);
        Ok(())
    }

    /// Add one more region.
    ///
    /// Same restriction as `init`: the table must not grow under an
    /// interrupt-context check.
    pub fn add_region(&self, mem: RegionMemory<'a>) -> Result<usize, ConfigError> {
        self.heap.lock().add_region(mem)
    }

    /// Take the heap lock, without blocking in interrupt context.
    ///
    /// Frees parked from interrupt context are applied before the guard is
    /// returned.
    pub fn lock(&self) -> Result<SpinMutexGuard<'_, Heap<'a>>, HeapError> {
        let mut heap = if self.context.in_interrupt_context() {
            self.heap.try_lock().ok_or(HeapError::WouldBlock)?
        } else {
            self.heap.lock()
        };
        self.deferred.drain(&mut heap);
        Ok(heap)
    }

    /// Frees waiting for the lock.
    pub fn deferred_frees(&self) -> usize {
        self.deferred.len()
    }

    #[track_caller]
    fn owner(&self) -> Owner {
        Owner::caller(self.context.current_pid())
    }

    /// Allocate `size` bytes, attributed to the current task and caller.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let owner = self.owner();
        self.lock()?.allocate(size, owner)
    }

    /// Allocate `size` zeroed bytes.
    #[track_caller]
    pub fn allocate_zeroed(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let owner = self.owner();
        self.lock()?.allocate_zeroed(size, owner)
    }

    /// Resize an allocation; see [`Heap::reallocate`].
    #[track_caller]
    pub fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, HeapError> {
        let owner = self.owner();
        self.lock()?.reallocate(ptr, size, owner)
    }

    /// Free an allocation.
    ///
    /// In interrupt context a busy lock parks the pointer until the next
    /// locked operation; `WouldBlock` only when the parking slots are full.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let Ok(mut heap) = self.lock() else {
            if self.deferred.push(ptr) {
                log::trace!("kmm: free of {:p} deferred", ptr.as_ptr());
                return Ok(());
            }
            log::warn!("kmm: deferred frees full, {:p} not freed", ptr.as_ptr());
            return Err(HeapError::WouldBlock);
        };
        heap.free(ptr)
    }

    /// Payload bytes usable behind `ptr`.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        self.lock()?.usable_size(ptr)
    }

    /// Heap usage totals.
    pub fn stats(&self) -> Result<HeapStats, HeapError> {
        Ok(self.lock()?.stats())
    }

    /// Walk every region and report the first structural violation.
    ///
    /// In task context each region is checked under the lock. In interrupt
    /// context the lock is used only if it is free.
    pub fn check_corruption(&self) -> Result<(), CorruptionReport> {
        let interrupt = self.context.in_interrupt_context();
        let mut index = 0;
        loop {
            let guard = if interrupt {
                self.heap.try_lock()
            } else {
                Some(self.heap.lock())
            };
            let done = match guard {
                Some(heap) => check_one(&heap, index)?,
                None => {
                    log::debug!("kmm: heap busy, checking region {} unlocked", index);
                    // SAFETY: `init` and `add_region` never overlap an
                    // interrupt-context check, so the region table is
                    // stable and region memory outlives the heap. Header
                    // reads are bounds-checked volatile loads; a mutation
                    // in flight may be observed half done and is reported,
                    // never written through.
                    let heap = unsafe { &*self.heap.as_mut_ptr() };
                    check_one(heap, index)?
                }
            };
            if done {
                return Ok(());
            }
            index += 1;
        }
    }
}

/// Check region `index`; `Ok(true)` once past the last region.
fn check_one(heap: &Heap<'_>, index: usize) -> Result<bool, CorruptionReport> {
    match heap.regions().get(index) {
        Some(region) => check::check_region(region, index, heap.config()).map(|()| false),
        None => Ok(true),
    }
}

// SAFETY: `alloc` returns `GRANULE`-aligned blocks of at least
// `layout.size()` bytes or null, and blocks stay valid until `dealloc`.
unsafe impl<C: ExecutionContext> GlobalAlloc for LockedHeap<'_, C> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > GRANULE {
            return ptr::null_mut();
        }
        let owner = Owner {
            pid: self.context.current_pid(),
            ..Owner::UNKNOWN
        };
        match self.lock().and_then(|mut heap| heap.allocate(layout.size(), owner)) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > GRANULE {
            return ptr::null_mut();
        }
        let owner = Owner {
            pid: self.context.current_pid(),
            ..Owner::UNKNOWN
        };
        match self
            .lock()
            .and_then(|mut heap| heap.allocate_zeroed(layout.size(), owner))
        {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // Refusals and a full deferred queue are logged.
            let _ = self.free(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        if layout.align() > GRANULE {
            return ptr::null_mut();
        }
        let owner = Owner {
            pid: self.context.current_pid(),
            ..Owner::UNKNOWN
        };
        match self
            .lock()
            .and_then(|mut heap| heap.reallocate(ptr, new_size, owner))
        {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }
}
