//! PantherOS Kernel Memory Manager
//!
//! The kernel heap of the PantherOS microkernel, together with the pieces
//! of the kernel it leans on.
//!
//! # Components
//! - `mm`: multi-region boundary-tag heap, corruption checker, and the
//!   lock-protected global allocator
//! - `irq`: NVIC-style interrupt controller and the execution-context
//!   capability the heap uses to decide whether it may block
//! - `syscall`: errno codes and the `select` shim over poll
//! - `drivers`, `logging`: PL011 console and the `log` backend on it
//!
//! # Security Features
//! - Every header access is bounds-checked against its region
//! - Heap corruption is detected online, from task or interrupt context
//! - Faults are reported, never written through

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod drivers;
pub mod irq;
pub mod logging;
pub mod mm;
pub mod syscall;

pub use irq::{ExecutionContext, IrqController, TaskContext};
pub use mm::{CorruptionKind, CorruptionReport, Heap, HeapConfig, HeapError, LockedHeap};
