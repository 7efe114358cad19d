// src/kernel/driver/disk.rs
//! プライマリIDE/ATAドライブからの PIO 経由セクタ読み出し
//!
//! FAT16 読み出し層（§4.7）の下請け。LBA28、マスタードライブのみを対象にする
//! — このカーネルが読むブートディスクは常にプライマリマスターという前提。

use crate::arch::x86_64::port::{Port, PortReadOnly, PortWriteOnly};
use crate::kernel::constants::fat16::SECTOR_SIZE;
use spin::Mutex;

const DATA: u16 = 0x1F0;
const ERROR: u16 = 0x1F1;
const SECTOR_COUNT: u16 = 0x1F2;
const LBA_LO: u16 = 0x1F3;
const LBA_MID: u16 = 0x1F4;
const LBA_HI: u16 = 0x1F5;
const DRIVE_HEAD: u16 = 0x1F6;
const STATUS: u16 = 0x1F7;
const COMMAND: u16 = 0x1F7;

const STATUS_BSY: u8 = 0x80;
const STATUS_DRQ: u8 = 0x08;
const STATUS_ERR: u8 = 0x01;

const CMD_READ_SECTORS: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    NotPresent,
    DeviceFault,
}

struct AtaPorts {
    data: Port<u16>,
    error: PortReadOnly<u8>,
    sector_count: PortWriteOnly<u8>,
    lba_lo: PortWriteOnly<u8>,
    lba_mid: PortWriteOnly<u8>,
    lba_hi: PortWriteOnly<u8>,
    drive_head: PortWriteOnly<u8>,
    status: PortReadOnly<u8>,
    command: PortWriteOnly<u8>,
}

impl AtaPorts {
    const fn new() -> Self {
        Self {
            data: Port::new(DATA),
            error: PortReadOnly::new(ERROR),
            sector_count: PortWriteOnly::new(SECTOR_COUNT),
            lba_lo: PortWriteOnly::new(LBA_LO),
            lba_mid: PortWriteOnly::new(LBA_MID),
            lba_hi: PortWriteOnly::new(LBA_HI),
            drive_head: PortWriteOnly::new(DRIVE_HEAD),
            status: PortReadOnly::new(STATUS),
            command: PortWriteOnly::new(COMMAND),
        }
    }

    fn wait_not_busy(&self) {
        unsafe { while self.status.read() & STATUS_BSY != 0 { core::hint::spin_loop(); } }
    }

    fn wait_data_ready(&self) -> Result<(), DiskError> {
        unsafe {
            loop {
                let status = self.status.read();
                if status & STATUS_ERR != 0 {
                    let _ = self.error.read();
                    return Err(DiskError::DeviceFault);
                }
                if status & STATUS_DRQ != 0 {
                    return Ok(());
                }
                core::hint::spin_loop();
            }
        }
    }
}

static PORTS: Mutex<AtaPorts> = Mutex::new(AtaPorts::new());

/// LBA `lba` から `buf.len() / SECTOR_SIZE` セクタぶん読み込む。`buf.len()` は
/// `SECTOR_SIZE` の倍数でなければならない。
pub fn read_sectors(lba: u32, buf: &mut [u8]) -> Result<(), DiskError> {
    assert!(buf.len() % SECTOR_SIZE == 0);
    let count = buf.len() / SECTOR_SIZE;
    assert!(count <= 256);
    let sector_count_byte = if count == 256 { 0 } else { count as u8 };

    let mut ports = PORTS.lock();
    ports.wait_not_busy();
    // SAFETY: single-threaded access serialized by PORTS, valid LBA28 command sequence.
    unsafe {
        ports.drive_head.write(0xE0 | ((lba >> 24) & 0x0F) as u8);
        ports.sector_count.write(sector_count_byte);
        ports.lba_lo.write((lba & 0xFF) as u8);
        ports.lba_mid.write(((lba >> 8) & 0xFF) as u8);
        ports.lba_hi.write(((lba >> 16) & 0xFF) as u8);
        ports.command.write(CMD_READ_SECTORS);

        for sector in 0..count {
            ports.wait_not_busy();
            ports.wait_data_ready()?;
            let offset = sector * SECTOR_SIZE;
            for i in (0..SECTOR_SIZE).step_by(2) {
                let word = ports.data.read();
                buf[offset + i] = word as u8;
                buf[offset + i + 1] = (word >> 8) as u8;
            }
        }
    }
    Ok(())
}
