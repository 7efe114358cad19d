#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(test_runner)]
#![reexport_test_harness_main = "test_main"]

use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use tiny_os::{debug_print, debug_println, exit_qemu, QemuExitCode};

entry_point!(test_kernel_main);

fn test_kernel_main(boot_info: &'static BootInfo) -> ! {
    tiny_os::init::boot_for_integration_tests(boot_info);
    test_main();
    tiny_os::hlt_loop();
}

pub fn test_runner(tests: &[&dyn Fn()]) {
    debug_println!("Running {} tests", tests.len());
    for test in tests {
        test();
        debug_println!("[test did not panic]");
        exit_qemu(QemuExitCode::Failed);
    }
    exit_qemu(QemuExitCode::Success);
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    debug_println!("[ok]");
    exit_qemu(QemuExitCode::Success);
}

#[test_case]
fn should_fail() {
    debug_print!("should_panic::should_fail...\t");
    assert_eq!(0, 1);
}
