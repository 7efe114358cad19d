#![no_std]
#![no_main]

use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use tiny_os::init::boot_bsp;

entry_point!(kernel_main);

fn kernel_main(boot_info: &'static BootInfo) -> ! {
    boot_bsp(boot_info)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    tiny_os::debug_println!("PANIC: {}", info);
    tiny_os::hlt_loop()
}
