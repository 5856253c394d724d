//! An interrupt that reports heap corruption while the interrupted task is
//! in the middle of writing to the console.

use std::sync::Mutex;

use log::LevelFilter;
use pantheros_kmm::drivers::uart;
use pantheros_kmm::irq::IrqController;
use pantheros_kmm::logging::{self, KernelLogger};
use pantheros_kmm::mm::{CorruptionKind, HeapConfig, LockedHeap, RegionMemory};

const CHECK_IRQ: usize = 40;

static IRQ: IrqController = IrqController::new();
static HEAP: LockedHeap<'static, &'static IrqController> =
    LockedHeap::new(HeapConfig::DEFAULT, &IRQ);
static LOGGER: KernelLogger<&'static IrqController> = KernelLogger::new(&IRQ);

static VERDICT: Mutex<Option<Result<(), CorruptionKind>>> = Mutex::new(None);

fn run_checker(_irq: usize, _arg: usize) {
    let verdict = HEAP.check_corruption().map_err(|report| report.kind);
    *VERDICT.lock().unwrap() = Some(verdict);
}

#[test]
fn checker_reports_while_console_is_held() {
    logging::init(&LOGGER, LevelFilter::Trace).unwrap();
    IRQ.initialize();
    IRQ.enable(CHECK_IRQ).unwrap();
    IRQ.attach(CHECK_IRQ, run_checker, 0).unwrap();

    let region: &'static mut [u8] = Box::leak(vec![0u8; 8 * 1024].into_boxed_slice());
    HEAP.init([RegionMemory::new(region)]).unwrap();
    let a = HEAP.allocate(64).unwrap();
    let _b = HEAP.allocate(64).unwrap();
    // SAFETY: b's preceding word follows a's 64-byte payload, inside the
    // region.
    unsafe { core::ptr::write(a.as_ptr().add(64 + 4) as *mut u32, 0x30 | (1u32 << 31)) };

    let before = uart::dropped();
    {
        // The interrupted task owns both the console and the heap.
        let _console = uart::UART.lock();
        let _heap = HEAP.lock().unwrap();
        IRQ.dispatch(CHECK_IRQ).unwrap();
    }

    assert_eq!(
        VERDICT.lock().unwrap().take(),
        Some(Err(CorruptionKind::BoundaryBackward))
    );
    assert!(uart::dropped() > before);
}
