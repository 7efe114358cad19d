// src/init.rs
//! ブートシーケンス（§6 Boot/init ordering）
//!
//! BSP の `kernel_main` から一度だけ呼ばれる `boot_bsp`、各 AP のエントリから
//! 呼ばれる `boot_ap` の2つの入口を提供する。`original_source/src/kernel.c`
//! の `kernelStart` と同じ並び — VGA → ACPI/APIC → IDT → メモリ → GDT/TSS →
//! ページング → システムコール → FAT16 → プロセステーブル/起動プロセス →
//! AP起動 → スケジューラループ。

use crate::arch::x86_64::syscall as arch_syscall;
use crate::arch::x86_64::{apic, gdt, init_idt};
use crate::arch::ArchCpu;
use crate::kernel::constants::{
    DEFAULT_TOTAL_PROCESS_SIZE, MAX_CORES, STARTUP_PROGRAM_CODE_SECTORS, STARTUP_PROGRAMS,
};
use crate::kernel::driver::disk;
use crate::kernel::driver::serial::init_serial;
use crate::kernel::driver::vga::init_vga;
use crate::kernel::driver::{console, PIT};
use crate::kernel::fs::{fat16, files};
use crate::kernel::mm::allocator::PHYS_FRAME_ALLOCATOR;
use crate::kernel::mm::frame::MemoryRegion;
use crate::kernel::mm::paging;
use crate::kernel::mm::types::PhysAddr as KPhysAddr;
use crate::kernel::mm::{self};
use crate::kernel::scheduler;
use crate::kernel::smp;
use crate::debug_println;
use bootloader::bootinfo::{BootInfo, MemoryRegionType};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr as X86PhysAddr;

/// ファームウェアのメモリマップを一度に保持できる最大リージョン数。
/// QEMU/実機とも、通常は 20 件未満。
const MAX_MEMORY_REGIONS: usize = 64;

/// `BootInfo` のメモリマップを `kernel::mm::frame::MemoryRegion` の固定長配列に
/// 落とし込み、同時に `MemoryRegionType::Kernel` の範囲からカーネルイメージの
/// 物理境界を拾う。ヒープがまだ無いのでスタック上の固定長配列を使う。
fn init_physical_memory(boot_info: &'static BootInfo) {
    let mut regions = [MemoryRegion { start: KPhysAddr::new(0), len: 0, usable: false }; MAX_MEMORY_REGIONS];
    let mut count = 0usize;
    let mut kernel_start = u64::MAX;
    let mut kernel_end = 0u64;

    for region in boot_info.memory_map.iter() {
        let start = region.range.start_addr();
        let end = region.range.end_addr();

        if region.region_type == MemoryRegionType::Kernel {
            kernel_start = kernel_start.min(start);
            kernel_end = kernel_end.max(end);
        }

        if count < MAX_MEMORY_REGIONS {
            regions[count] = MemoryRegion {
                start: KPhysAddr::new(start as usize),
                len: (end - start) as usize,
                usable: region.region_type == MemoryRegionType::Usable,
            };
            count += 1;
        }
    }
    if kernel_end == 0 {
        kernel_start = 0;
    }

    // The heap lives inside the same identity-mapped window but isn't a
    // frame-allocator client — fold its physical range into the excluded
    // "kernel image" span so the free list never hands out a frame the
    // heap is already using.
    let heap_phys_start = crate::kernel::constants::HEAP_START - crate::kernel::constants::KERNEL_HIGH_HALF_BASE;
    let heap_phys_end = heap_phys_start + crate::kernel::constants::HEAP_SIZE as u64;
    kernel_start = kernel_start.min(heap_phys_start);
    kernel_end = kernel_end.max(heap_phys_end);

    mm::set_kernel_image_bounds(kernel_start, kernel_end);
    // SAFETY: boot_info.memory_map is the firmware map passed by the
    // bootloader, this runs once before any allocation.
    unsafe { PHYS_FRAME_ALLOCATOR.init(&regions[..count], kernel_start, kernel_end) };
}

/// FAT16 ルートディレクトリから起動プロセスのイメージを1つ読み込み、
/// `scheduler::allocate_process` でプロセステーブルへ積む。
fn load_startup_process(name: &str, code_sectors: usize) {
    let Ok(fcb_index) = files::open(name) else {
        debug_println!("init: startup program {} not found on disk", name);
        return;
    };
    let code_size = code_sectors * crate::kernel::constants::fat16::SECTOR_SIZE;
    let mut image = alloc::vec![0u8; code_size];
    let read = files::read(fcb_index, 0, &mut image).unwrap_or(0);
    files::close(fcb_index);

    match scheduler::allocate_process(&image[..read], read, DEFAULT_TOTAL_PROCESS_SIZE, None) {
        Ok(pid) => debug_println!("init: loaded {} as pid {}", name, pid.as_u32()),
        Err(e) => debug_println!("init: failed to load {}: {:?}", name, e),
    }
}

/// `boot_bsp`/`boot_for_integration_tests` が共有するセットアップ本体。
/// スケジューラループへ入る直前まで — 起動プロセスのロードまでを行う。
fn boot_common(boot_info: &'static BootInfo) {
    init_serial();
    init_vga();
    console::init_console();
    debug_println!("kernel started (core 0 / BSP)");

    apic::init_local();
    init_idt();

    init_physical_memory(boot_info);

    let kernel_space = paging::setup_kernel_space(&PHYS_FRAME_ALLOCATOR)
        .expect("setup_kernel_space must succeed at boot");
    let pml4_frame = PhysFrame::containing_address(X86PhysAddr::new(kernel_space.pml4.as_u64()));
    // SAFETY: kernel_space maps the whole identity window at the high half,
    // including the kernel image itself (linked to run from that window).
    unsafe { Cr3::write(pml4_frame, Cr3Flags::empty()) };

    gdt::init(0);
    arch_syscall::init();

    // SAFETY: the heap range is reserved and unused by anything else.
    unsafe {
        crate::init_heap(
            crate::kernel::mm::VirtAddr::new(crate::kernel::constants::HEAP_START as usize),
            crate::kernel::mm::LayoutSize::new(crate::kernel::constants::HEAP_SIZE),
        )
        .expect("heap init must succeed exactly once at boot");
    }

    PIT.lock().set_frequency(crate::kernel::constants::TIMER_HZ).ok();

    if let Err(e) = fat16::init() {
        debug_println!("init: fat16::init failed: {:?} — continuing with no filesystem", e);
    }

    scheduler::init(kernel_space);
    smp::register_bsp();
    // Idle slots must be allocated before any other process so that slot
    // index == core number (§3 idle-process invariant).
    scheduler::init_idle(MAX_CORES);

    for (name, sectors) in STARTUP_PROGRAMS.iter().zip(STARTUP_PROGRAM_CODE_SECTORS.iter()) {
        load_startup_process(name, *sectors);
    }

    // AP bring-up: the real-mode trampoline and the enumerated APIC ID list
    // come from the bootloader/ACPI layer, out of scope for this crate
    // (§4.6) — with none supplied, this crate stays single-core.
}

/// BSP（ブートストラッププロセッサ）のブート処理。戻らない — 最後に
/// このコアのスケジューラループへ入る。
pub fn boot_bsp(boot_info: &'static BootInfo) -> ! {
    boot_common(boot_info);
    debug_println!("init: BSP entering scheduler loop");
    ArchCpu::enable_interrupts();
    scheduler::run(0);
}

/// `tests/` の統合テストバイナリ用エントリポイント。`boot_bsp` と同じセットアップを
/// 行うが、スケジューラループへは入らず戻る — 呼び出し元（テストの
/// `test_kernel_main`）が `test_main()` を実行してから `hlt_loop()` する。
pub fn boot_for_integration_tests(boot_info: &'static BootInfo) {
    boot_common(boot_info);
    ArchCpu::enable_interrupts();
}

/// AP（アプリケーションプロセッサ）のエントリポイント。実モードトランポリンが
/// ロングモードへ入った直後にここへジャンプしてくる想定。戻らない。
pub fn boot_ap(core: usize) -> ! {
    assert!(core < MAX_CORES, "AP core index out of range");
    gdt::init(core);
    init_idt();
    apic::init_local();
    arch_syscall::init();

    debug_println!("init: AP {} entering scheduler loop", core);
    ArchCpu::enable_interrupts();
    scheduler::run(core);
}

/// ディスクが読めることを確認する、ごく単純な健全性チェック。起動時に
/// 一度だけ呼ばれる想定だが、今のブート列からは呼んでいない — `fat16::init`
/// がまず BPB セクタを読むので、そこで事実上の健全性チェックを兼ねる。
#[allow(dead_code)]
fn probe_disk() -> bool {
    let mut sector = [0u8; 512];
    disk::read_sectors(0, &mut sector).is_ok()
}
