//! システムコール周りの整列・境界チェックの統合テスト。
//!
//! カーネルスタックの16バイト整列と、ユーザーアドレス範囲外ポインタの
//! システムコールディスパッチでの拒否を確認する。

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(tiny_os::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use tiny_os::arch::x86_64::gdt;
use tiny_os::kernel::constants::MAX_CORES;

entry_point!(test_kernel_main);

fn test_kernel_main(boot_info: &'static BootInfo) -> ! {
    tiny_os::init::boot_for_integration_tests(boot_info);
    test_main();
    tiny_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    tiny_os::test_panic_handler(info)
}

/// 各コアのカーネルスタック天井は呼び出し規約が要求する16バイト境界に
/// 揃っていること。
#[test_case]
fn kernel_stack_top_is_16_byte_aligned_for_every_core() {
    for core in 0..MAX_CORES {
        let top = gdt::default_kernel_stack_top(core);
        assert_eq!(
            top.as_u64() % 16,
            0,
            "core {} default kernel stack top not 16-byte aligned: {:#x}",
            core,
            top.as_u64()
        );
    }
}

/// ブート後、BSP の「現在の」カーネルスタック天井（TSS.RSP0 に設定された値）も
/// 同じ整列を保っていること。
#[test_case]
fn current_kernel_stack_top_matches_default_on_bsp() {
    let current = gdt::current_kernel_stack_top(0);
    let default = gdt::default_kernel_stack_top(0);
    assert_eq!(current, default);
    assert_eq!(current.as_u64() % 16, 0);
}

/// 各コアのスタック天井は重ならないこと（スタックオーバーフローが
/// 隣のコアのスタックを壊さない前提）。
#[test_case]
fn kernel_stacks_across_cores_do_not_overlap() {
    let tops: alloc::vec::Vec<u64> = (0..MAX_CORES)
        .map(|core| gdt::default_kernel_stack_top(core).as_u64())
        .collect();
    for i in 0..tops.len() {
        for j in (i + 1)..tops.len() {
            assert_ne!(tops[i], tops[j], "cores {} and {} share a stack top", i, j);
        }
    }
}

/// ユーザー範囲外のポインタを渡す `sys_print_buffer`/`sys_open`/`sys_read` は
/// -1 を返して拒否すること（カーネルアドレス、アラインしないが範囲外という
/// 点は共通）。
#[test_case]
fn dispatch_rejects_syscalls_with_a_kernel_address_pointer() {
    const SYS_PRINT_BUFFER: u64 = 0;
    const SYS_OPEN: u64 = 6;
    const SYS_READ: u64 = 7;

    let kernel_ptr = 0xFFFF_8000_0000_0000u64;
    assert_eq!(tiny_os::kernel::syscall::dispatch(SYS_PRINT_BUFFER, kernel_ptr, 16, 0), -1);
    assert_eq!(tiny_os::kernel::syscall::dispatch(SYS_OPEN, kernel_ptr, 8, 0), -1);
    assert_eq!(tiny_os::kernel::syscall::dispatch(SYS_READ, 0, kernel_ptr, 16), -1);
}

/// 長さゼロでも範囲内に収まらないユーザーポインタ（ロード先より手前）は
/// 同様に拒否されること。
#[test_case]
fn dispatch_rejects_syscalls_with_a_pointer_before_the_user_load_address() {
    const SYS_PRINT_BUFFER: u64 = 0;
    assert_eq!(tiny_os::kernel::syscall::dispatch(SYS_PRINT_BUFFER, 0, 1, 0), -1);
}
