// src/arch/x86_64/interrupts.rs
//! Interrupt Descriptor Table (IDT)
//!
//! 256 ベクタすべてにゲートディスクリプタを持つ。ring-0 スタックが壊れている
//! かもしれないベクタ（NMI・ダブルフォルト・無効TSS・スタックセグメント
//! フォルト・GPF）だけが IST スロット1に切り替わる。それ以外は IST 0
//! （現在の ring-0 スタックをそのまま使う）。

use crate::arch::x86_64::gdt;
use crate::arch::{ArchCpu, Cpu};
use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

/// タイマー割り込みの APIC ベクタ番号。
pub const TIMER_VECTOR: u8 = 32;
/// キーボード割り込みの APIC ベクタ番号。
pub const KEYBOARD_VECTOR: u8 = 33;
/// IOAPIC から配送される汎用 IRQ の先頭ベクタ（未使用の実装）。
const GENERIC_IRQ_BASE: usize = 34;
/// ローカル APIC のスプリアスベクタ。
pub const SPURIOUS_VECTOR: u8 = 255;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(user_or_kernel_fault_handler_div0);
        idt.debug.set_handler_fn(noop_handler);
        unsafe {
            idt.non_maskable_interrupt
                .set_handler_fn(nmi_handler)
                .set_stack_index(gdt::FAULT_IST_INDEX);
        }
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(user_or_kernel_fault_handler_overflow);
        idt.bound_range_exceeded.set_handler_fn(user_or_kernel_fault_handler_bound);
        idt.invalid_opcode.set_handler_fn(user_or_kernel_fault_handler_opcode);
        idt.device_not_available.set_handler_fn(user_or_kernel_fault_handler_nodev);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::FAULT_IST_INDEX);
        }
        unsafe {
            idt.invalid_tss
                .set_handler_fn(invalid_tss_handler)
                .set_stack_index(gdt::FAULT_IST_INDEX);
        }
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        unsafe {
            idt.stack_segment_fault
                .set_handler_fn(stack_segment_fault_handler)
                .set_stack_index(gdt::FAULT_IST_INDEX);
        }
        unsafe {
            idt.general_protection_fault
                .set_handler_fn(gpf_handler)
                .set_stack_index(gdt::FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(noop_fault_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point.set_handler_fn(noop_fault_handler);
        idt.virtualization.set_handler_fn(noop_fault_handler);

        idt[TIMER_VECTOR as usize].set_handler_fn(timer_interrupt_handler);
        idt[KEYBOARD_VECTOR as usize].set_handler_fn(keyboard_interrupt_handler);

        // Every other vector gets the same no-op stub. None of them carry
        // meaning until a driver claims one via set_ioapic_redirection.
        for vector in GENERIC_IRQ_BASE..256usize {
            if vector == TIMER_VECTOR as usize || vector == KEYBOARD_VECTOR as usize {
                continue;
            }
            idt[vector].set_handler_fn(generic_irq_handler);
        }

        idt
    };
}

/// IDT をロードする。ブート時、どのコアからでも呼べる（ロード自体は
/// コアローカルな LIDT 命令）。
pub fn init_idt() {
    IDT.load();
}

extern "x86-interrupt" fn noop_handler(_sf: InterruptStackFrame) {}

extern "x86-interrupt" fn breakpoint_handler(_sf: InterruptStackFrame) {
    crate::debug_println!("[int3] breakpoint");
}

extern "x86-interrupt" fn nmi_handler(_sf: InterruptStackFrame) {
    crate::debug_println!("[nmi]");
}

extern "x86-interrupt" fn double_fault_handler(sf: InterruptStackFrame, _error_code: u64) -> ! {
    ArchCpu::disable_interrupts();
    crate::debug_println!("[fault] double fault at {:#x}", sf.instruction_pointer.as_u64());
    loop {
        ArchCpu::halt();
    }
}

extern "x86-interrupt" fn invalid_tss_handler(sf: InterruptStackFrame, error_code: u64) {
    fault_from_user_or_halt(sf, error_code, "invalid tss");
}

extern "x86-interrupt" fn segment_not_present_handler(sf: InterruptStackFrame, error_code: u64) {
    fault_from_user_or_halt(sf, error_code, "segment not present");
}

extern "x86-interrupt" fn stack_segment_fault_handler(sf: InterruptStackFrame, error_code: u64) {
    fault_from_user_or_halt(sf, error_code, "stack segment fault");
}

extern "x86-interrupt" fn gpf_handler(sf: InterruptStackFrame, error_code: u64) {
    fault_from_user_or_halt(sf, error_code, "general protection fault");
}

extern "x86-interrupt" fn page_fault_handler(
    sf: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let faulting_address = x86_64::registers::control::Cr2::read();
    crate::debug_println!(
        "[fault] page fault at {:?}, error={:?}, rip={:#x}",
        faulting_address,
        error_code,
        sf.instruction_pointer.as_u64()
    );
    if is_user_mode(&sf) {
        crate::kernel::scheduler::exit_current(-1);
    } else {
        loop {
            ArchCpu::halt();
        }
    }
}

extern "x86-interrupt" fn alignment_check_handler(sf: InterruptStackFrame, error_code: u64) {
    fault_from_user_or_halt(sf, error_code, "alignment check");
}

extern "x86-interrupt" fn machine_check_handler(sf: InterruptStackFrame) -> ! {
    ArchCpu::disable_interrupts();
    crate::debug_println!("[fault] machine check");
    loop {
        ArchCpu::halt();
    }
}

extern "x86-interrupt" fn noop_fault_handler(sf: InterruptStackFrame) {
    fault_from_user_or_halt(sf, 0, "fp/simd exception");
}

extern "x86-interrupt" fn user_or_kernel_fault_handler_div0(sf: InterruptStackFrame) {
    fault_from_user_or_halt(sf, 0, "divide by zero");
}

extern "x86-interrupt" fn user_or_kernel_fault_handler_overflow(sf: InterruptStackFrame) {
    fault_from_user_or_halt(sf, 0, "overflow");
}

extern "x86-interrupt" fn user_or_kernel_fault_handler_bound(sf: InterruptStackFrame) {
    fault_from_user_or_halt(sf, 0, "bound range exceeded");
}

extern "x86-interrupt" fn user_or_kernel_fault_handler_opcode(sf: InterruptStackFrame) {
    fault_from_user_or_halt(sf, 0, "invalid opcode");
}

extern "x86-interrupt" fn user_or_kernel_fault_handler_nodev(sf: InterruptStackFrame) {
    fault_from_user_or_halt(sf, 0, "device not available");
}

fn is_user_mode(sf: &InterruptStackFrame) -> bool {
    (sf.code_segment.0 & 0x3) == 3
}

fn fault_from_user_or_halt(sf: InterruptStackFrame, error_code: u64, name: &str) {
    crate::debug_println!(
        "[fault] {} at rip={:#x} error={:#x}",
        name,
        sf.instruction_pointer.as_u64(),
        error_code
    );
    if is_user_mode(&sf) {
        crate::kernel::scheduler::exit_current(-1);
    } else {
        loop {
            ArchCpu::halt();
        }
    }
}

extern "x86-interrupt" fn timer_interrupt_handler(_sf: InterruptStackFrame) {
    crate::kernel::scheduler::on_timer_tick();
    crate::arch::x86_64::apic::send_eoi();
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_sf: InterruptStackFrame) {
    use crate::kernel::driver::keyboard::{KEYBOARD, SCANCODE_QUEUE};

    if let Some(scancode) = KEYBOARD.lock().read_scancode() {
        SCANCODE_QUEUE.lock().push(scancode);
        crate::kernel::scheduler::wake(crate::kernel::constants::TAG_KEYBOARD);
    }

    crate::arch::x86_64::apic::send_eoi();
}

extern "x86-interrupt" fn generic_irq_handler(_sf: InterruptStackFrame) {
    crate::arch::x86_64::apic::send_eoi();
}
