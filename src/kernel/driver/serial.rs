// src/kernel/driver/serial.rs
//! 16550 UART シリアルドライバ (COM1)
//!
//! `debug_println!` の出力先。ブート初期化の最初期から、ページングすら
//! 整う前に使えることが要求される最小実装。

use crate::arch::x86_64::port::{Port, PortWriteOnly};
use crate::kernel::core::{CharDevice, Device, KernelResult};
use core::fmt;
use spin::Mutex;

const COM1_BASE: u16 = 0x3F8;

/// 16550 互換 UART
pub struct SerialPort {
    data: Port<u8>,
    interrupt_enable: PortWriteOnly<u8>,
    fifo_control: PortWriteOnly<u8>,
    line_control: PortWriteOnly<u8>,
    modem_control: PortWriteOnly<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    /// COM1 (0x3F8) に固定したドライバを作る
    pub const fn new() -> Self {
        Self {
            data: Port::new(COM1_BASE),
            interrupt_enable: PortWriteOnly::new(COM1_BASE + 1),
            fifo_control: PortWriteOnly::new(COM1_BASE + 2),
            line_control: PortWriteOnly::new(COM1_BASE + 3),
            modem_control: PortWriteOnly::new(COM1_BASE + 4),
            line_status: Port::new(COM1_BASE + 5),
        }
    }

    fn line_status_ready(&self) -> bool {
        unsafe { self.line_status.read() & 0x20 != 0 }
    }

    fn write_one(&mut self, byte: u8) {
        while !self.line_status_ready() {
            core::hint::spin_loop();
        }
        unsafe { self.data.write(byte) };
    }
}

impl Default for SerialPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for SerialPort {
    fn name(&self) -> &'static str {
        "16550 UART (COM1)"
    }

    fn init(&mut self) -> KernelResult<()> {
        unsafe {
            self.interrupt_enable.write(0x00);
            self.line_control.write(0x80); // DLAB
            self.data.write(0x01); // divisor low: 115200 baud
            self.interrupt_enable.write(0x00); // divisor high
            self.line_control.write(0x03); // 8N1, DLAB off
            self.fifo_control.write(0xC7); // enable FIFO, clear, 14-byte threshold
            self.modem_control.write(0x0B); // RTS/DSR set
        }
        Ok(())
    }

    fn reset(&mut self) -> KernelResult<()> {
        self.init()
    }
}

impl CharDevice for SerialPort {
    fn read_byte(&self) -> KernelResult<Option<u8>> {
        if unsafe { self.line_status.read() } & 0x01 != 0 {
            Ok(Some(unsafe { self.data.read() }))
        } else {
            Ok(None)
        }
    }

    fn write_byte(&mut self, byte: u8) -> KernelResult<()> {
        if byte == b'\n' {
            self.write_one(b'\r');
        }
        self.write_one(byte);
        Ok(())
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte).map_err(|_| fmt::Error)?;
        }
        Ok(())
    }
}

/// グローバル COM1 インスタンス。起動直後から使えるよう `Mutex::new` は const。
pub static SERIAL1: Mutex<SerialPort> = Mutex::new(SerialPort::new());

/// COM1 を初期化する。`init.rs` のブートシーケンスの最初に一度だけ呼ぶ。
pub fn init_serial() {
    let _ = SERIAL1.lock().init();
}
