//! Device drivers for PantherOS
//!
//! All drivers follow these security principles:
//! - Minimal unsafe code, well-documented
//! - Output before initialization is dropped, not sent to unmapped MMIO

pub mod uart;
