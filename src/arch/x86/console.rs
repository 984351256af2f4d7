// SPDX-License-Identifier: MPL-2.0

//! A minimal serial-port console, used for early boot logging before any
//! higher-level device model exists.

use core::fmt::{self, Write};

use spin::Once;
use x86_64::instructions::port::Port;

use crate::sync::SpinLock;

const COM1_PORT: u16 = 0x3F8;

struct SerialPort {
    data: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    /// # Safety
    ///
    /// The caller must ensure the given I/O port is a valid, unshared UART.
    unsafe fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            line_status: Port::new(base + 5),
        }
    }

    fn is_transmit_empty(&mut self) -> bool {
        // Safety: reading the line status register has no side effect.
        (unsafe { self.line_status.read() } & 0x20) != 0
    }

    fn send(&mut self, byte: u8) {
        while !self.is_transmit_empty() {
            core::hint::spin_loop();
        }
        // Safety: the transmit holding register is ready to accept a byte.
        unsafe { self.data.write(byte) };
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.send(b'\r');
            }
            self.send(byte);
        }
        Ok(())
    }
}

static CONSOLE: Once<SpinLock<SerialPort>> = Once::new();

pub(crate) fn init() {
    // Safety: COM1 is a standard, otherwise-unused PC serial port.
    CONSOLE.call_once(|| SpinLock::new(unsafe { SerialPort::new(COM1_PORT) }));
}

pub fn print(args: fmt::Arguments) {
    if let Some(console) = CONSOLE.get() {
        let _ = console.lock().write_fmt(args);
    }
}
