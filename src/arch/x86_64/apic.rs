// src/arch/x86_64/apic.rs
//! ローカル APIC / I/O APIC
//!
//! MMIO レジスタは恒等マップされたカーネル窓からオフセット経由でアクセスする。
//! ICR のデリバリモード定数と INIT/SIPI の手順は標準的な MP 起動シーケンスに
//! 従う。ファームウェアテーブルの列挙そのもの（MADT 解析）はこのカーネルの
//! 対象外で、呼び出し元が APIC ID のリストを渡してくる。

use crate::kernel::constants::KERNEL_HIGH_HALF_BASE;
use core::sync::atomic::{AtomicU64, Ordering};

const LOCAL_APIC_DEFAULT_PHYS: u64 = 0xFEE0_0000;
const IOAPIC_DEFAULT_PHYS: u64 = 0xFEC0_0000;

const REG_ID: usize = 0x020;
const REG_EOI: usize = 0x0B0;
const REG_SPURIOUS: usize = 0x0F0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;

/// ICR デリバリモード: INIT
pub const ICR_DELIVERY_MODE_INIT: u32 = 0x500;
/// ICR デリバリモード: Startup (SIPI)
pub const ICR_DELIVERY_MODE_STARTUP: u32 = 0x600;
/// レベルトリガ + アサート（INIT アサートに必要）
pub const ICR_LEVEL_ASSERT: u32 = 0x4000;
/// ICR 配送中ビット。ポーリングで 0 になるのを待つ。
pub const ICR_DELIVERY_STATUS_PENDING: u32 = 0x1000;

static LOCAL_APIC_PHYS: AtomicU64 = AtomicU64::new(LOCAL_APIC_DEFAULT_PHYS);
static IOAPIC_PHYS: AtomicU64 = AtomicU64::new(IOAPIC_DEFAULT_PHYS);

fn local_apic_virt() -> *mut u32 {
    (KERNEL_HIGH_HALF_BASE + LOCAL_APIC_PHYS.load(Ordering::Relaxed)) as *mut u32
}

fn ioapic_virt() -> *mut u32 {
    (KERNEL_HIGH_HALF_BASE + IOAPIC_PHYS.load(Ordering::Relaxed)) as *mut u32
}

unsafe fn lapic_read(reg: usize) -> u32 {
    unsafe { core::ptr::read_volatile(local_apic_virt().byte_add(reg)) }
}

unsafe fn lapic_write(reg: usize, value: u32) {
    unsafe { core::ptr::write_volatile(local_apic_virt().byte_add(reg), value) };
}

/// I/O APIC のベース物理アドレスを設定する（既定 0xFEC00000 から変わる場合）。
pub fn set_ioapic_base(phys: u64) {
    IOAPIC_PHYS.store(phys, Ordering::Relaxed);
}

/// ローカル APIC を有効化し、スプリアスベクタを設定する。恒等マップ済みの
/// 物理ウィンドウ内でしか MMIO アクセスできないため、ブート後のページング
/// 完了後に呼ぶこと。
pub fn init_local() {
    unsafe {
        // bit 8 = APIC software enable, low byte = spurious vector.
        lapic_write(REG_SPURIOUS, 0x100 | 0xFF);
    }
}

/// このコアのローカル APIC ID を読む。コア ID の導出元（§3）。
pub fn local_apic_id() -> u32 {
    unsafe { lapic_read(REG_ID) >> 24 }
}

/// 割り込み処理の最後に EOI を送る。
pub fn send_eoi() {
    unsafe { lapic_write(REG_EOI, 0) };
}

fn wait_icr_idle() {
    while unsafe { lapic_read(REG_ICR_LOW) } & ICR_DELIVERY_STATUS_PENDING != 0 {
        core::hint::spin_loop();
    }
}

/// 指定した APIC ID に INIT IPI を送る。
pub fn send_init(target_apic_id: u32) {
    unsafe {
        lapic_write(REG_ICR_HIGH, target_apic_id << 24);
        lapic_write(REG_ICR_LOW, ICR_DELIVERY_MODE_INIT | ICR_LEVEL_ASSERT);
    }
    wait_icr_idle();
}

/// 指定した APIC ID に SIPI を送る。`vector` は起動トランポリンの物理アドレス
/// を 4 KiB 単位にしたもの（下位 8 ビット）。
pub fn send_sipi(target_apic_id: u32, vector: u8) {
    unsafe {
        lapic_write(REG_ICR_HIGH, target_apic_id << 24);
        lapic_write(REG_ICR_LOW, ICR_DELIVERY_MODE_STARTUP | vector as u32);
    }
    wait_icr_idle();
}

/// IOAPIC のリダイレクションテーブルエントリを書き込む。`irq` は 0 始まり。
pub fn set_ioapic_redirection(irq: u8, vector: u8, destination_apic_id: u8) {
    let low_index = 0x10 + irq as u32 * 2;
    let high_index = low_index + 1;
    unsafe {
        core::ptr::write_volatile(ioapic_virt(), low_index);
        core::ptr::write_volatile(ioapic_virt().byte_add(0x10), high_index << 24);
        core::ptr::write_volatile(ioapic_virt(), high_index);
        core::ptr::write_volatile(
            ioapic_virt().byte_add(0x10),
            (destination_apic_id as u32) << 24,
        );
        core::ptr::write_volatile(ioapic_virt(), low_index);
        core::ptr::write_volatile(ioapic_virt().byte_add(0x10), vector as u32);
    }
}
