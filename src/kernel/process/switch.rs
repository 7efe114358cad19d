// src/kernel/process/switch.rs
//! コンテキストスイッチ
//!
//! `switch_context_asm` は callee-save レジスタと戻り先アドレスだけを保存/復元する
//! 素朴なスタックスワップ。新しいプロセスの初回実行は `process_entry_trampoline` を
//! 「戻り先」に持つ偽のスタックフレームから始まり、そこで `UserFrame` の内容を
//! 復元して iretq する（§4.3）。
//!
//! プロセスロックはスケジューラが握ったままこの切り替えに入り、再開した側が
//! ここで明け渡す（xv6 方式、§5）。`process_entry_trampoline` も例外ではなく、
//! 新規プロセスの最初の実行であっても同じ契約に従ってロックを外す。

use crate::arch::x86_64::gdt;
use crate::kernel::mm::paging::AddressSpace;
use crate::kernel::process::{UserFrame, PROCESS_TABLE};
use crate::kernel::smp;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr as X86PhysAddr, VirtAddr};

/// # C ABI
/// - RDI: prev_ctx (*mut u64) — 現在のプロセスの `context_rsp` を書き戻す先
/// - RSI: next_ctx (u64) — 次のプロセスの `context_rsp`
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context_asm(prev_ctx: *mut u64, next_ctx: u64) {
    core::arch::naked_asm!(
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "ret",
    );
}

/// 新しいプロセスの `context_rsp` が最初に「返る」先。直接呼び出されることはなく、
/// `setup_process_context` が書いた偽スタックフレームの戻りアドレスとしてのみ
/// 実行される。
unsafe extern "C" fn process_entry_trampoline() -> ! {
    // SAFETY: we are resuming into a process for the very first time. The
    // `schedule()` call that switched to us left PROCESS_TABLE locked on
    // purpose; whoever resumes is responsible for dropping it (§5).
    unsafe { PROCESS_TABLE.force_unlock() };

    let frame = {
        let table = PROCESS_TABLE.lock();
        let core = smp::core_index();
        let idx = table
            .current_slot(core)
            .expect("[trampoline] no current process assigned to this core");
        table.slots[idx].frame
    };

    unsafe { enter_user_mode(&frame) }
}

/// `frame` の内容で全汎用レジスタを復元し、iretq でユーザーモードへ入る。
///
/// rdi だけは `frame` へのポインタとして最後まで使うため、他のレジスタを
/// すべて読み終えてから最後に復元する。
#[unsafe(naked)]
unsafe extern "C" fn enter_user_mode(frame: &UserFrame) -> ! {
    core::arch::naked_asm!(
        // iretq フレームを push する (SS, RSP, RFLAGS, CS, RIP の順 — iretq は
        // RIP/CS/RFLAGS/RSP/SS の順でポップするので、逆順に積む)。
        "mov rax, [rdi + {off_ss}]",
        "push rax",
        "mov rax, [rdi + {off_rsp}]",
        "push rax",
        "mov rax, [rdi + {off_rflags}]",
        "push rax",
        "mov rax, [rdi + {off_cs}]",
        "push rax",
        "mov rax, [rdi + {off_rip}]",
        "push rax",
        // 汎用レジスタの復元 (rdi と rax は最後)
        "mov rbx, [rdi + {off_rbx}]",
        "mov rcx, [rdi + {off_rcx}]",
        "mov rdx, [rdi + {off_rdx}]",
        "mov rsi, [rdi + {off_rsi}]",
        "mov rbp, [rdi + {off_rbp}]",
        "mov r8,  [rdi + {off_r8}]",
        "mov r9,  [rdi + {off_r9}]",
        "mov r10, [rdi + {off_r10}]",
        "mov r11, [rdi + {off_r11}]",
        "mov r12, [rdi + {off_r12}]",
        "mov r13, [rdi + {off_r13}]",
        "mov r14, [rdi + {off_r14}]",
        "mov r15, [rdi + {off_r15}]",
        "mov rax, [rdi + {off_rax}]",
        "mov rdi, [rdi + {off_rdi}]",
        "iretq",
        off_ss = const core::mem::offset_of!(UserFrame, ss),
        off_rsp = const core::mem::offset_of!(UserFrame, rsp),
        off_rflags = const core::mem::offset_of!(UserFrame, rflags),
        off_cs = const core::mem::offset_of!(UserFrame, cs),
        off_rip = const core::mem::offset_of!(UserFrame, rip),
        off_rbx = const core::mem::offset_of!(UserFrame, rbx),
        off_rcx = const core::mem::offset_of!(UserFrame, rcx),
        off_rdx = const core::mem::offset_of!(UserFrame, rdx),
        off_rsi = const core::mem::offset_of!(UserFrame, rsi),
        off_rbp = const core::mem::offset_of!(UserFrame, rbp),
        off_r8 = const core::mem::offset_of!(UserFrame, r8),
        off_r9 = const core::mem::offset_of!(UserFrame, r9),
        off_r10 = const core::mem::offset_of!(UserFrame, r10),
        off_r11 = const core::mem::offset_of!(UserFrame, r11),
        off_r12 = const core::mem::offset_of!(UserFrame, r12),
        off_r13 = const core::mem::offset_of!(UserFrame, r13),
        off_r14 = const core::mem::offset_of!(UserFrame, r14),
        off_r15 = const core::mem::offset_of!(UserFrame, r15),
        off_rax = const core::mem::offset_of!(UserFrame, rax),
        off_rdi = const core::mem::offset_of!(UserFrame, rdi),
    );
}

/// 新しいプロセスのカーネルスタックへ偽のスタックフレームを書き込み、
/// `context_switch` が `process_entry_trampoline` へ「戻れる」ようにする。
/// `context_rsp` にそのフレームの先頭を書き戻す。
pub fn setup_process_context(stack_top: VirtAddr, context_rsp: &mut u64) {
    setup_kernel_context(stack_top, process_entry_trampoline, context_rsp);
}

/// `setup_process_context` の一般形。`entry` へ「戻れる」偽のスタックフレームを
/// 書き込む。`UserFrame`/`iretq` を経由しないカーネル側エントリ（アイドル
/// プロセスなど）にも使う。
pub fn setup_kernel_context(
    stack_top: VirtAddr,
    entry: unsafe extern "C" fn() -> !,
    context_rsp: &mut u64,
) {
    let top = stack_top.as_u64();
    let stack_ptr = top as *mut u64;

    // SAFETY: stack_top is this process's own freshly allocated kernel stack;
    // nothing else touches it yet.
    unsafe {
        *stack_ptr.offset(-1) = entry as usize as u64;
        *stack_ptr.offset(-2) = 0; // rbx
        *stack_ptr.offset(-3) = 0; // rbp
        *stack_ptr.offset(-4) = 0; // r12
        *stack_ptr.offset(-5) = 0; // r13
        *stack_ptr.offset(-6) = 0; // r14
        *stack_ptr.offset(-7) = 0; // r15
    }

    *context_rsp = top - 7 * 8;
}

/// 現在のコアを、あるプロセスから別のプロセスへ切り替える。
///
/// 呼び出し元（スケジューラ）は `PROCESS_TABLE` をロックしたままこの関数を呼び、
/// `mem::forget` でガードを手放す。このプロセスが再びスケジュールされて戻って
/// きた時点では、ロックは既に他の誰か（直接には `process_entry_trampoline` か、
/// 別の `context_switch` の戻り先）によって外されている。
///
/// # Safety
///
/// `prev_ctx` は現在ロックされている `PROCESS_TABLE` 内の有効なスロットの
/// `context_rsp` を指していること。`next_ctx` は `setup_process_context` 済みか、
/// 過去に一度この関数で退避された値であること。
pub unsafe fn context_switch(
    core: usize,
    prev_ctx: *mut u64,
    next_ctx: u64,
    to_stack_top: VirtAddr,
    to_space: AddressSpace,
) {
    // SAFETY: `core` is this CPU's own id; no other core touches this TSS entry.
    unsafe { gdt::set_kernel_stack(core, to_stack_top) };

    let (current_frame, flags) = Cr3::read();
    let to_frame = PhysFrame::containing_address(X86PhysAddr::new(to_space.pml4.as_u64()));
    if current_frame != to_frame {
        // SAFETY: to_frame is a PML4 built by `paging::new_process_address_space`
        // or `setup_kernel_space`, with the shared kernel half already present.
        unsafe { Cr3::write(to_frame, flags) };
    }

    // SAFETY: contract documented on this function.
    unsafe { switch_context_asm(prev_ctx, next_ctx) };
}
