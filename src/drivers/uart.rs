//! PL011 UART Console
//!
//! Serial output for kernel diagnostics. Two write paths share one
//! console lock:
//! - `print` waits for the lock (task context)
//! - `try_print` never waits; if the console is busy the line is dropped
//!   and counted, so an interrupt handler that logs cannot deadlock
//!   against the task it interrupted
//!
//! # Memory Map (QEMU virt)
//! - Base address: 0x0900_0000
//! - Register size: 0x1000 bytes
//!
//! # Security Considerations
//! - Output only; nothing is read from the device
//! - Writes before `init` are dropped rather than sent to an unmapped base
//! - A stuck transmitter costs a bounded wait per byte, never a hang

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

/// QEMU virt machine PL011 UART base address
pub const UART_BASE: usize = 0x0900_0000;

/// Flag-register polls before a byte is given up on.
const TX_SPIN_LIMIT: u32 = 1 << 16;

/// PL011 Register offsets
mod regs {
    /// Data Register - read/write data
    pub const DR: usize = 0x00;
    /// Flag Register - status flags
    pub const FR: usize = 0x18;
}

/// Flag Register bits
mod flags {
    /// Transmit FIFO full
    pub const TXFF: u32 = 1 << 5;
}

/// PL011 UART driver
pub struct Uart {
    base: usize,
    initialized: bool,
    lost: usize,
}

impl Uart {
    /// Create a UART at `base`; output is dropped until `init`.
    pub const fn new(base: usize) -> Self {
        Self {
            base,
            initialized: false,
            lost: 0,
        }
    }

    /// Mark the device ready for output.
    ///
    /// # Safety
    /// `base` must map a PL011 register block (at least `FR + 4` bytes)
    /// for as long as this driver is used.
    pub unsafe fn init(&mut self) {
        // The firmware leaves the PL011 configured; nothing to program.
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Bytes given up on because the transmit FIFO stayed full.
    pub fn lost_bytes(&self) -> usize {
        self.lost
    }

    /// Write a single byte. Returns `false` if the device is not ready or
    /// the FIFO did not drain within `TX_SPIN_LIMIT` polls.
    pub fn write_byte(&mut self, byte: u8) -> bool {
        if !self.initialized {
            return false;
        }

        let fr = (self.base + regs::FR) as *const u32;
        let dr = (self.base + regs::DR) as *mut u32;
        let mut polls = 0;
        // SAFETY: `init` guarantees the register block is mapped; both
        // registers are 4-byte aligned offsets from the base.
        while unsafe { core::ptr::read_volatile(fr) } & flags::TXFF != 0 {
            polls += 1;
            if polls == TX_SPIN_LIMIT {
                self.lost += 1;
                return false;
            }
            core::hint::spin_loop();
        }
        // SAFETY: as above.
        unsafe { core::ptr::write_volatile(dr, byte as u32) };
        true
    }

    /// Write a string, expanding `\n` to `\r\n`.
    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Uart::write_str(self, s);
        Ok(())
    }
}

/// Global console UART, protected by spinlock
pub static UART: Mutex<Uart> = Mutex::new(Uart::new(UART_BASE));

static DROPPED: AtomicUsize = AtomicUsize::new(0);

/// Write to the console, waiting for the console lock.
pub fn print(args: fmt::Arguments<'_>) {
    let _ = UART.lock().write_fmt(args);
}

/// Write to the console only if the lock is free. Returns `false` (and
/// counts the drop) when another context holds it.
pub fn try_print(args: fmt::Arguments<'_>) -> bool {
    match UART.try_lock() {
        Some(mut uart) => {
            let _ = uart.write_fmt(args);
            true
        }
        None => {
            DROPPED.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

/// Writes `try_print` dropped because the console was busy.
pub fn dropped() -> usize {
    DROPPED.load(Ordering::Relaxed)
}

/// Print macro for kernel output
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::drivers::uart::print(format_args!($($arg)*))
    };
}

/// Println macro for kernel output; the line is written under one lock.
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::drivers::uart::print(format_args!("\n"))
    };
    ($($arg:tt)*) => {
        $crate::drivers::uart::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}
