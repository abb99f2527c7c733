//! PL011 console.
//!
//! Output is dropped until [`init`] records the controller's base address,
//! so the engine can log freely before the console exists (and on hosts
//! that have none).

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

const UART_DR: usize = 0x00; // Data Register
const UART_FR: usize = 0x18; // Flag Register

/// Transmit FIFO full.
const UART_FR_TXFF: u32 = 1 << 5;

/// 0 while no console is configured.
static UART_BASE: AtomicUsize = AtomicUsize::new(0);

/// Start sending console output to the PL011 at `base`.
///
/// # Safety
/// `base` must be the mapped MMIO base of a PL011 that stays mapped for the
/// life of the program.
pub unsafe fn init(base: usize) {
    UART_BASE.store(base, Ordering::Release);
}

pub fn is_enabled() -> bool {
    UART_BASE.load(Ordering::Acquire) != 0
}

#[cfg(target_arch = "aarch64")]
fn putc(base: usize, c: u8) {
    // Safety: `init` promised a live PL011 at `base`.
    unsafe {
        while core::ptr::read_volatile((base + UART_FR) as *const u32) & UART_FR_TXFF != 0 {
            core::hint::spin_loop();
        }
        core::ptr::write_volatile((base + UART_DR) as *mut u32, c as u32);
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn putc(_base: usize, _c: u8) {
    let _ = (UART_DR, UART_FR, UART_FR_TXFF);
}

pub fn puts(s: &str) {
    let base = UART_BASE.load(Ordering::Acquire);
    if base == 0 {
        return;
    }
    for byte in s.bytes() {
        if byte == b'\n' {
            putc(base, b'\r');
        }
        putc(base, byte);
    }
}

/// Writer wrapper for formatting.
pub struct UartWriter;

impl fmt::Write for UartWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        puts(s);
        Ok(())
    }
}

pub fn writer() -> UartWriter {
    UartWriter
}

/// Print to the console (without newline).
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($crate::uart::writer(), $($arg)*);
    }};
}

/// Print to the console with a trailing newline.
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = writeln!($crate::uart::writer(), $($arg)*);
    }};
}
