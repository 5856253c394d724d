//! Kernel Logger
//!
//! Routes the `log` facade to the UART console as
//! `[LEVEL] target: message` lines. The logger consults an
//! [`ExecutionContext`]: in interrupt context it never waits for the
//! console lock and drops the line if the console is busy.

use core::fmt;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::drivers::uart;
use crate::irq::{ExecutionContext, TaskContext};

/// Console logger over the PL011 UART.
pub struct KernelLogger<C = TaskContext> {
    context: C,
}

impl<C> KernelLogger<C> {
    pub const fn new(context: C) -> Self {
        Self { context }
    }
}

impl<C: ExecutionContext + Send + Sync> Log for KernelLogger<C> {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        emit(
            self.context.in_interrupt_context(),
            format_args!("[{}] {}: {}\n", label(record.level()), record.target(), record.args()),
        );
    }

    fn flush(&self) {}
}

fn emit(interrupt: bool, line: fmt::Arguments<'_>) {
    if interrupt {
        uart::try_print(line);
    } else {
        uart::print(line);
    }
}

fn label(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Install `logger` and set the maximum level.
pub fn init<C>(logger: &'static KernelLogger<C>, level: LevelFilter) -> Result<(), SetLoggerError>
where
    C: ExecutionContext + Send + Sync + 'static,
{
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}
