// src/arch/x86_64/syscall.rs
//! `syscall`/`sysretq` によるリング0⇔リング3遷移
//!
//! `syscall` 命令は RSP を切り替えない。入口のナキッドasmが自分でユーザースタックから
//! このコアのカーネルスタックへ移り、戻りがけにユーザースタックへ戻す。
//!
//! 呼び出し規約（§6）: syscall番号はコーラー保存レジスタ（rax）、引数は最大3個
//! （rdi, rsi, rdx）、戻り値はrax。`fork` はこれに加えて、子プロセスの保存済み
//! 割り込みフレームを正しく再開できるよう、呼び出し時点のユーザー rsp/rbp/rip/
//! rflags を必要とする — これは一般の引数レジスタではなく、入口で直接捕捉して
//! コア毎のスナップショットに残し、`sys_fork` がそこから読む。

use crate::arch::x86_64::gdt;
use crate::kernel::smp;
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

/// `syscall`/`sysret` に必要な MSR 群を設定する。ブート時に一度だけ呼ぶ。
pub fn init() {
    unsafe {
        Efer::update(|flags| {
            *flags |= EferFlags::SYSTEM_CALL_EXTENSIONS;
        });

        let selectors = gdt::selectors();
        Star::write(
            selectors.kernel_code,
            selectors.kernel_data,
            selectors.user_code,
            selectors.user_data,
        )
        .unwrap();

        LStar::write(VirtAddr::new(syscall_entry as *const () as u64));

        // 割り込み中は IF をクリアする — syscall ハンドラはタイマー割り込みに
        // よる再入を受けない（§4.3 の「syscall実行中」という前提の土台）。
        SFMask::write(RFlags::INTERRUPT_FLAG);
    }
}

/// 直近の `fork` 呼び出し時点のユーザーレジスタ一式。コアごとに1組だけ持てば
/// 十分 — syscall実行中はそのコアで他のsyscallが同時に入口を通ることはない。
static FORK_RSP: [AtomicU64; crate::kernel::constants::MAX_CORES] =
    [const { AtomicU64::new(0) }; crate::kernel::constants::MAX_CORES];
static FORK_RBP: [AtomicU64; crate::kernel::constants::MAX_CORES] =
    [const { AtomicU64::new(0) }; crate::kernel::constants::MAX_CORES];
static FORK_RIP: [AtomicU64; crate::kernel::constants::MAX_CORES] =
    [const { AtomicU64::new(0) }; crate::kernel::constants::MAX_CORES];
static FORK_RFLAGS: [AtomicU64; crate::kernel::constants::MAX_CORES] =
    [const { AtomicU64::new(0) }; crate::kernel::constants::MAX_CORES];

/// 直近 `enter_syscall` が記録した、現在のコアでの fork 用スナップショットを読む。
/// `sys_fork` がこれをもとに `UserFrame` を組み立てる。
pub(crate) fn current_fork_snapshot() -> (u64, u64, u64, u64) {
    let core = smp::core_index();
    (
        FORK_RSP[core].load(Ordering::Relaxed),
        FORK_RBP[core].load(Ordering::Relaxed),
        FORK_RIP[core].load(Ordering::Relaxed),
        FORK_RFLAGS[core].load(Ordering::Relaxed),
    )
}

/// syscall入口から呼ばれる。ユーザーの生レジスタをコア別スナップショットへ
/// 書き残し、このコアのカーネルスタック頂上を返す。まだユーザースタックの
/// 上にいる間に呼ばれるので、このRust関数自体はごく短く、他に何もしない。
extern "C" fn enter_syscall(user_rsp: u64, user_rbp: u64, user_rip: u64, user_rflags: u64) -> u64 {
    let core = smp::core_index();
    FORK_RSP[core].store(user_rsp, Ordering::Relaxed);
    FORK_RBP[core].store(user_rbp, Ordering::Relaxed);
    FORK_RIP[core].store(user_rip, Ordering::Relaxed);
    FORK_RFLAGS[core].store(user_rflags, Ordering::Relaxed);
    gdt::current_kernel_stack_top(core).as_u64()
}

/// syscall入口。`syscall` 命令が実行されるとここへ飛んでくる。
///
/// 入口時点のレジスタ（CPUが保存するもの）:
/// - rax = syscall番号、rdi/rsi/rdx = 引数1-3
/// - rcx = ユーザーrip、r11 = ユーザーrflags
/// - rsp はまだユーザースタックを指している
///
/// ユーザーの呼び出し規約上、rbp/rbx/r12-r15 はコーラー保存（callee-saved）
/// なので、syscall をまたいで値が保たれていなければならない。このasmは
/// それらを一時的な作業レジスタとして使い回す前にユーザースタックへ退避し、
/// 戻る直前に元の値を復元する。
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() -> ! {
    core::arch::naked_asm!(
        // ユーザーの callee-saved レジスタと、CPUが保存した rip/rflags を
        // ユーザースタックへ退避する（まだカーネルスタックの場所が分からない）。
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "push rcx", // user rip
        "push r11", // user rflags

        // syscall番号と引数を、いま空いた callee-saved レジスタへ移しておく
        // （この先の Rust 呼び出しで rax/rdi/rsi/rdx は破壊されるため）。
        "mov rbx, rax", // syscall番号
        "mov r12, rdi", // arg1
        "mov r13, rsi", // arg2
        "mov r14, rdx", // arg3

        // 元のユーザー rsp を再構成する（8回pushした分だけ戻す）。
        "mov r15, rsp",
        "add r15, 64",

        // enter_syscall(user_rsp, user_rbp, user_rip, user_rflags) -> kernel_stack_top
        // rbp はまだユーザーの値のまま、rcx/r11 はスタック上の退避値から読む。
        "mov rdi, r15",
        "mov rsi, [rsp + 56]", // 退避した user rbp
        "mov rdx, [rsp + 8]",  // 退避した user rip
        "mov rcx, [rsp + 0]",  // 退避した user rflags
        "and rsp, -16",
        "call {enter_syscall}",

        // rax = このコアのカーネルスタック頂上へ切り替える。
        "mov rsp, rax",

        // dispatch(num, a1, a2, a3) -> i64
        "mov rdi, rbx",
        "mov rsi, r12",
        "mov rdx, r13",
        "mov rcx, r14",
        "push r15", // ユーザーrspのアンカーを退避しつつ16バイト境界に揃える
        "sub rsp, 8",
        "call {dispatch}",
        "add rsp, 8",
        "pop r15",

        // ユーザースタックへ戻り、退避した8つの値を逆順に復元する。
        "mov rsp, r15",
        "sub rsp, 64",
        "pop r11", // user rflags
        "pop rcx", // user rip
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",

        "sysretq",

        enter_syscall = sym enter_syscall,
        dispatch = sym dispatch_trampoline,
    );
}

/// `kernel::syscall::dispatch` への薄い `extern "C"` 橋渡し。naked asm から
/// `sym` で直接呼べるよう、戻り値を `i64` のまま公開しておく。
extern "C" fn dispatch_trampoline(num: u64, a1: u64, a2: u64, a3: u64) -> i64 {
    crate::kernel::syscall::dispatch(num, a1, a2, a3)
}
