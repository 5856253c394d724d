//! Interrupt Controller
//!
//! A software model of an NVIC-style controller: per-line enable bits and
//! priorities, a handler registry, and a dispatcher that tracks interrupt
//! nesting. The nesting depth is what the heap consults to decide whether
//! it may block.
//!
//! # IRQ Numbering
//! - 0..16: processor exceptions (NMI = 2, HardFault = 3, ...)
//! - 16..NR_IRQS: external interrupt lines
//!
//! # Security Considerations
//! - Out-of-range IRQ numbers are rejected, never indexed
//! - Unattached lines are reported, not silently ignored
//! - Bus and usage faults are fatal by default

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

/// Processor exception numbers.
pub mod vectors {
    pub const RESET: usize = 1;
    pub const NMI: usize = 2;
    pub const HARDFAULT: usize = 3;
    pub const MEMFAULT: usize = 4;
    pub const BUSFAULT: usize = 5;
    pub const USAGEFAULT: usize = 6;
    pub const SVCALL: usize = 11;
    pub const DBGMONITOR: usize = 12;
    pub const PENDSV: usize = 14;
    pub const SYSTICK: usize = 15;
    /// First external interrupt line.
    pub const INTERRUPTS: usize = 16;
}

/// Total number of vectors, exceptions included.
pub const NR_IRQS: usize = 80;

/// Priority assigned to every line by `initialize`.
pub const PRIORITY_DEFAULT: u8 = 0x80;
/// Highest urgency.
pub const PRIORITY_MAX: u8 = 0x00;
/// Lowest urgency accepted by `set_priority`.
pub const PRIORITY_MIN: u8 = 0xE0;

/// Interrupt handler. Receives the IRQ number and the argument given to
/// `attach`.
pub type Handler = fn(irq: usize, arg: usize);

/// Interrupt controller errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// IRQ number outside the vector table.
    InvalidIrq,
    /// The exception cannot be enabled or disabled.
    NotMaskable,
    /// Priority beyond `PRIORITY_MIN`.
    InvalidPriority,
    /// No handler attached to the line.
    Unhandled,
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIrq => write!(f, "invalid IRQ number"),
            Self::NotMaskable => write!(f, "exception is not maskable"),
            Self::InvalidPriority => write!(f, "invalid priority"),
            Self::Unhandled => write!(f, "no handler attached"),
        }
    }
}

/// Where the caller is running, as far as blocking is concerned.
pub trait ExecutionContext {
    /// True while an interrupt or exception handler is executing.
    fn in_interrupt_context(&self) -> bool;

    /// Task to attribute allocations to.
    fn current_pid(&self) -> u32 {
        0
    }
}

impl<C: ExecutionContext + ?Sized> ExecutionContext for &C {
    fn in_interrupt_context(&self) -> bool {
        (**self).in_interrupt_context()
    }

    fn current_pid(&self) -> u32 {
        (**self).current_pid()
    }
}

/// Context for code that never runs inside a handler (early boot, tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskContext;

impl ExecutionContext for TaskContext {
    fn in_interrupt_context(&self) -> bool {
        false
    }
}

struct State {
    /// Enable bit per vector.
    enabled: u128,
    priorities: [u8; NR_IRQS],
    handlers: [Option<(Handler, usize)>; NR_IRQS],
}

/// NVIC-style interrupt controller.
pub struct IrqController {
    state: Mutex<State>,
    nesting: AtomicUsize,
    pid: AtomicU32,
}

impl IrqController {
    /// A controller with every line disabled and nothing attached. Call
    /// `initialize` before enabling anything.
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(State {
                enabled: 0,
                priorities: [PRIORITY_DEFAULT; NR_IRQS],
                handlers: [None; NR_IRQS],
            }),
            nesting: AtomicUsize::new(0),
            pid: AtomicU32::new(0),
        }
    }

    /// Reset the controller: all lines disabled at default priority, and
    /// fatal handlers on the fault and reserved vectors.
    pub fn initialize(&self) {
        {
            let mut state = self.state.lock();
            state.enabled = 0;
            state.priorities = [PRIORITY_DEFAULT; NR_IRQS];
            state.handlers = [None; NR_IRQS];
            state.handlers[vectors::NMI] = Some((fatal as Handler, 0));
            state.handlers[vectors::BUSFAULT] = Some((fatal as Handler, 0));
            state.handlers[vectors::USAGEFAULT] = Some((fatal as Handler, 0));
            state.handlers[vectors::PENDSV] = Some((fatal as Handler, 0));
            state.handlers[vectors::DBGMONITOR] = Some((fatal as Handler, 0));
        }
        self.nesting.store(0, Ordering::SeqCst);
        log::debug!("irq: controller initialized, {} vectors", NR_IRQS);
    }

    /// Enable an external line or a maskable exception.
    pub fn enable(&self, irq: usize) -> Result<(), IrqError> {
        check_maskable(irq)?;
        self.state.lock().enabled |= 1u128 << irq;
        Ok(())
    }

    /// Disable an external line or a maskable exception.
    pub fn disable(&self, irq: usize) -> Result<(), IrqError> {
        check_maskable(irq)?;
        self.state.lock().enabled &= !(1u128 << irq);
        Ok(())
    }

    pub fn is_enabled(&self, irq: usize) -> bool {
        irq < NR_IRQS && self.state.lock().enabled & (1u128 << irq) != 0
    }

    /// Set the priority of `irq`. Lower values are more urgent.
    pub fn set_priority(&self, irq: usize, priority: u8) -> Result<(), IrqError> {
        if !(vectors::MEMFAULT..NR_IRQS).contains(&irq) {
            return Err(IrqError::InvalidIrq);
        }
        if priority > PRIORITY_MIN {
            return Err(IrqError::InvalidPriority);
        }
        self.state.lock().priorities[irq] = priority;
        Ok(())
    }

    pub fn priority(&self, irq: usize) -> Option<u8> {
        self.state.lock().priorities.get(irq).copied()
    }

    /// Attach `handler` to `irq`, replacing any previous handler.
    pub fn attach(&self, irq: usize, handler: Handler, arg: usize) -> Result<(), IrqError> {
        let mut state = self.state.lock();
        let slot = state.handlers.get_mut(irq).ok_or(IrqError::InvalidIrq)?;
        *slot = Some((handler, arg));
        Ok(())
    }

    /// Remove the handler from `irq`.
    pub fn detach(&self, irq: usize) -> Result<(), IrqError> {
        let mut state = self.state.lock();
        let slot = state.handlers.get_mut(irq).ok_or(IrqError::InvalidIrq)?;
        *slot = None;
        Ok(())
    }

    /// Run the handler attached to `irq` in interrupt context.
    ///
    /// The registry lock is released before the handler runs, so handlers
    /// may attach, detach, or dispatch nested interrupts.
    pub fn dispatch(&self, irq: usize) -> Result<(), IrqError> {
        let _nested = Nesting::enter(&self.nesting);
        let entry = *self
            .state
            .lock()
            .handlers
            .get(irq)
            .ok_or(IrqError::InvalidIrq)?;
        let Some((handler, arg)) = entry else {
            log::warn!("irq: unhandled interrupt {}", irq);
            return Err(IrqError::Unhandled);
        };
        handler(irq, arg);
        Ok(())
    }

    /// Current interrupt nesting depth.
    pub fn nesting(&self) -> usize {
        self.nesting.load(Ordering::SeqCst)
    }

    /// Record the task now running, for allocation attribution.
    pub fn set_current_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Relaxed);
    }
}

impl Default for IrqController {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext for IrqController {
    fn in_interrupt_context(&self) -> bool {
        self.nesting() > 0
    }

    fn current_pid(&self) -> u32 {
        self.pid.load(Ordering::Relaxed)
    }
}

/// Nesting depth held for the duration of one handler.
struct Nesting<'a>(&'a AtomicUsize);

impl<'a> Nesting<'a> {
    fn enter(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::SeqCst);
        Self(depth)
    }
}

impl Drop for Nesting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn check_maskable(irq: usize) -> Result<(), IrqError> {
    if irq >= NR_IRQS {
        return Err(IrqError::InvalidIrq);
    }
    match irq {
        vectors::MEMFAULT | vectors::BUSFAULT | vectors::USAGEFAULT | vectors::SYSTICK => Ok(()),
        irq if irq >= vectors::INTERRUPTS => Ok(()),
        _ => Err(IrqError::NotMaskable),
    }
}

fn fatal(irq: usize, _arg: usize) {
    let name = match irq {
        vectors::NMI => "NMI",
        vectors::BUSFAULT => "bus fault",
        vectors::USAGEFAULT => "usage fault",
        vectors::PENDSV => "PendSV",
        vectors::DBGMONITOR => "debug monitor",
        _ => "reserved interrupt",
    };
    log::error!("irq: {} received", name);
    panic!("{} received", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicBool;

    #[test]
    fn initialize_disables_and_resets_priorities() {
        let irq = IrqController::new();
        irq.enable(20).unwrap();
        irq.set_priority(20, 0x20).unwrap();
        irq.initialize();
        assert!(!irq.is_enabled(20));
        assert_eq!(irq.priority(20), Some(PRIORITY_DEFAULT));
        assert_eq!(irq.priority(vectors::SYSTICK), Some(PRIORITY_DEFAULT));
    }

    #[test]
    fn only_some_exceptions_are_maskable() {
        let irq = IrqController::new();
        irq.initialize();
        assert_eq!(irq.enable(vectors::SYSTICK), Ok(()));
        assert_eq!(irq.enable(vectors::MEMFAULT), Ok(()));
        assert_eq!(irq.enable(vectors::SVCALL), Err(IrqError::NotMaskable));
        assert_eq!(irq.disable(vectors::HARDFAULT), Err(IrqError::NotMaskable));
        assert_eq!(irq.enable(NR_IRQS), Err(IrqError::InvalidIrq));
        assert!(irq.is_enabled(vectors::SYSTICK));
    }

    #[test]
    fn priority_bounds() {
        let irq = IrqController::new();
        assert_eq!(irq.set_priority(vectors::HARDFAULT, 0x40), Err(IrqError::InvalidIrq));
        assert_eq!(irq.set_priority(NR_IRQS, 0x40), Err(IrqError::InvalidIrq));
        assert_eq!(irq.set_priority(30, 0xF0), Err(IrqError::InvalidPriority));
        assert_eq!(irq.set_priority(30, PRIORITY_MIN), Ok(()));
        assert_eq!(irq.priority(30), Some(PRIORITY_MIN));
    }

    #[test]
    fn dispatch_runs_handler_in_interrupt_context() {
        static IRQ: IrqController = IrqController::new();
        static SEEN: AtomicBool = AtomicBool::new(false);

        fn handler(irq: usize, arg: usize) {
            assert_eq!((irq, arg), (40, 7));
            assert!(IRQ.in_interrupt_context());
            SEEN.store(true, Ordering::SeqCst);
        }

        IRQ.attach(40, handler, 7).unwrap();
        assert!(!IRQ.in_interrupt_context());
        IRQ.dispatch(40).unwrap();
        assert!(SEEN.load(Ordering::SeqCst));
        assert_eq!(IRQ.nesting(), 0);

        IRQ.detach(40).unwrap();
        assert_eq!(IRQ.dispatch(40), Err(IrqError::Unhandled));
        assert_eq!(IRQ.dispatch(NR_IRQS), Err(IrqError::InvalidIrq));
    }

    #[test]
    #[should_panic(expected = "bus fault received")]
    fn bus_fault_is_fatal() {
        let irq = IrqController::new();
        irq.initialize();
        let _ = irq.dispatch(vectors::BUSFAULT);
    }
}
