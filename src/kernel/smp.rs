// src/kernel/smp.rs
//! SMP ブリングアップ
//!
//! ACPI/MADT を解析して AP (Application Processor) の local APIC ID を列挙する
//! ことはこのカーネルの対象外 — 呼び出し元（ブートローダ/`init`）がリストを渡して
//! くる（§3, apic モジュールの設計方針と同じ）。ここでは渡されたリストをもとに
//! INIT-SIPI-SIPI シーケンスで AP を起こし、論理コア番号 (0..MAX_CORES) とハード
//! ウェアの local APIC ID との対応表を管理する。
//!
//! 論理コア番号は `ProcessTable`/GDT/TSS の配列のインデックスとして使われる。
//! BSP は常に論理コア 0。

use crate::arch::x86_64::apic;
use crate::kernel::constants::MAX_CORES;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

const UNASSIGNED: u32 = u32::MAX;

static APIC_IDS: [AtomicU32; MAX_CORES] = [
    AtomicU32::new(UNASSIGNED),
    AtomicU32::new(UNASSIGNED),
    AtomicU32::new(UNASSIGNED),
    AtomicU32::new(UNASSIGNED),
];

static ONLINE_CORES: AtomicUsize = AtomicUsize::new(0);

/// BSP 自身を論理コア 0 として登録する。ブートのごく初期、ページングと
/// ローカル APIC の初期化が終わった直後に一度だけ呼ぶ。
pub fn register_bsp() {
    APIC_IDS[0].store(apic::local_apic_id(), Ordering::Release);
    ONLINE_CORES.store(1, Ordering::Release);
}

/// 現在実行中のコアの論理コア番号 (0..MAX_CORES) を返す。
/// 未登録の APIC ID で呼ばれた場合は BSP (0) を返す — ブート極初期の安全な既定値。
pub fn core_index() -> usize {
    let id = apic::local_apic_id();
    for i in 0..MAX_CORES {
        if APIC_IDS[i].load(Ordering::Acquire) == id {
            return i;
        }
    }
    0
}

/// 現在までに起動を確認したコア数。
pub fn online_cores() -> usize {
    ONLINE_CORES.load(Ordering::Acquire)
}

/// `apic_ids` に列挙された AP 群を INIT-SIPI-SIPI で起動する。`trampoline_vector`
/// は 4 KiB 境界のリアルモード起動コードを指す（物理アドレス >> 12 の下位 8 ビット）。
/// `apic_ids.len()` は `MAX_CORES - 1` を超えてはならない（超えた分は無視される）。
///
/// # Safety
///
/// `trampoline_vector` が指す物理ページには、各 AP が実行できる有効なリアルモード
/// トランポリン（最終的にこのカーネルの AP エントリポイントへロングモードで
/// ジャンプするもの）が書き込まれていること。このコード自体はこのカーネルの
/// 対象外で、呼び出し元が用意する。
pub unsafe fn start_aps(apic_ids: &[u32], trampoline_vector: u8) {
    for (slot, &id) in (1..MAX_CORES).zip(apic_ids.iter()) {
        APIC_IDS[slot].store(id, Ordering::Release);

        apic::send_init(id);
        apic::send_sipi(id, trampoline_vector);
        apic::send_sipi(id, trampoline_vector);

        ONLINE_CORES.fetch_add(1, Ordering::AcqRel);
    }
}
