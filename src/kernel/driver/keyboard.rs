// src/kernel/driver/keyboard.rs
//! PS/2 キーボードドライバ
//!
//! CharDevice trait に基づいた型安全な実装。割り込みハンドラから呼ばれる
//! `read_scancode` はポーリングではなく、ステータスレジスタを一度だけ見る
//! （ISR コンテキストなので呼び出し側が駆動する）。

use crate::kernel::core::{Device, CharDevice, KernelResult};
use crate::arch::x86_64::port::{PortReadOnly, PortWriteOnly};
use spin::Mutex;

/// キーボード割り込みが積むスキャンコードのリングバッファの容量。
const SCANCODE_QUEUE_CAPACITY: usize = 128;

/// PS/2 キーボード
pub struct PS2Keyboard {
    data: PortReadOnly<u8>,
    status: PortReadOnly<u8>,
    command: PortWriteOnly<u8>,
}

impl PS2Keyboard {
    /// 新しいキーボードドライバを作成
    pub const fn new() -> Self {
        Self {
            data: PortReadOnly::new(0x60),
            status: PortReadOnly::new(0x64),
            command: PortWriteOnly::new(0x64),
        }
    }

    /// ステータスレジスタを読み取り
    fn read_status(&self) -> u8 {
        unsafe { self.status.read() }
    }

    /// 割り込みハンドラから呼ぶ。出力バッファが空ならNone。
    pub fn read_scancode(&self) -> Option<u8> {
        if self.read_status() & 0x01 != 0 {
            Some(unsafe { self.data.read() })
        } else {
            None
        }
    }
}

/// 固定長のリングバッファ。ISR から積まれ、`read_char_from_keyboard`
/// システムコールから引き抜かれる（§4.4 キーボードベクタ）。
pub struct ScancodeQueue {
    buf: [u8; SCANCODE_QUEUE_CAPACITY],
    head: usize,
    len: usize,
}

impl ScancodeQueue {
    const fn new() -> Self {
        Self { buf: [0; SCANCODE_QUEUE_CAPACITY], head: 0, len: 0 }
    }

    /// 満杯なら黙って捨てる。
    pub fn push(&mut self, scancode: u8) {
        if self.len == SCANCODE_QUEUE_CAPACITY {
            return;
        }
        let tail = (self.head + self.len) % SCANCODE_QUEUE_CAPACITY;
        self.buf[tail] = scancode;
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let value = self.buf[self.head];
        self.head = (self.head + 1) % SCANCODE_QUEUE_CAPACITY;
        self.len -= 1;
        Some(value)
    }
}

pub static KEYBOARD: Mutex<PS2Keyboard> = Mutex::new(PS2Keyboard::new());
pub static SCANCODE_QUEUE: Mutex<ScancodeQueue> = Mutex::new(ScancodeQueue::new());

/// US配列、シフトなしのセットコード→ASCII変換。キー解放（最上位ビット立ち）
/// や未対応スキャンコードは `None`。
const SCANCODE_ASCII: [u8; 58] = [
    0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 8, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ',
];

/// `read_char_from_keyboard` システムコールの下請け。キー解放イベントと
/// 変換表の範囲外は `None`。
pub fn scancode_to_ascii(scancode: u8) -> Option<u8> {
    if scancode & 0x80 != 0 {
        return None; // key release
    }
    SCANCODE_ASCII.get(scancode as usize).copied().filter(|&c| c != 0)
}

impl Device for PS2Keyboard {
    fn name(&self) -> &str {
        "PS/2 Keyboard"
    }
    
    fn init(&mut self) -> KernelResult<()> {
        // 初期化ロジック（必要なら）
        // コントローラのリセットなどはここで行う
        Ok(())
    }
    
    fn reset(&mut self) -> KernelResult<()> {
        self.init()
    }
}

impl CharDevice for PS2Keyboard {
    fn read_byte(&self) -> KernelResult<Option<u8>> {
        let status = self.read_status();
        // 出力バッファフルビット (bit 0) を確認
        if status & 0x01 != 0 {
            let scancode = unsafe { self.data.read() };
            Ok(Some(scancode))
        } else {
            Ok(None)
        }
    }
    
    fn write_byte(&mut self, _byte: u8) -> KernelResult<()> {
        // キーボードへの書き込みは通常コマンド送信だが、
        // CharDevice としてはサポートしない（またはLED制御などに使う）
        Ok(())
    }
}
