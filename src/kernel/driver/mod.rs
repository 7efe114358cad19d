// src/kernel/driver/mod.rs
//! デバイスドライバモジュール

pub mod console;
pub mod disk;
pub mod keyboard;
pub mod pit;
pub mod serial;
pub mod vga;

pub use console::{init_console, write_console, write_debug};
pub use keyboard::PS2Keyboard;
pub use pit::PIT;
pub use serial::{SerialPort, SERIAL1};
pub use vga::{init_vga, vga, VgaTextMode};
