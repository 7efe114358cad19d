#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(tiny_os::test_runner)]
#![reexport_test_harness_main = "test_main"]

use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use tiny_os::println;

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

#[test_case]
fn test_println() {
    println!("test_println output");
}

#[test_case]
fn syscall_dispatch_rejects_unknown_number() {
    assert_eq!(tiny_os::kernel::syscall::dispatch(255, 0, 0, 0), -1);
}

#[test_case]
fn syscall_get_memory_size_reports_free_frames() {
    let size = tiny_os::kernel::syscall::dispatch(5, 0, 0, 0);
    assert!(size > 0, "boot should leave some free physical memory");
}
