// src/kernel/scheduler/mod.rs
//! ラウンドロビンスケジューラ
//!
//! xv6 方式: 各コアは自身の「スケジューラコンテキスト」(`SCHEDULER_CONTEXT`) を
//! 持ち、`run()` のループがそれを起点にプロセスを選んでは `context_switch` で
//! 飛び込む。プロセス側が `yield_now`/`sleep`/`exit_current`/`wait` を呼ぶと、
//! 同じ `context_switch` で自分のコアのスケジューラコンテキストへ戻ってくる
//! （§4.3, §5）。`PROCESS_TABLE` のロックはスケジューラが握ったまま切り替えに
//! 入り、再開した側が明け渡す。

use crate::arch::x86_64::gdt;
use crate::kernel::constants::{
    MAX_CORES, PAGE_SIZE, PROC_RFLAGS, PROCESS_KERNEL_STACK_SIZE, TAG_PROCESS_EXIT,
    TAG_TIMER_TICK, USER_LOAD_ADDRESS,
};
use crate::kernel::mm::allocator::PHYS_FRAME_ALLOCATOR;
use crate::kernel::mm::kernel_image_bounds;
use crate::kernel::mm::paging::{self, AddressSpace, PagingError};
use crate::kernel::mm::FrameError;
use crate::kernel::process::switch::{self, context_switch};
use crate::kernel::process::{ProcessId, ProcessState, UserFrame, PROCESS_TABLE};
use crate::kernel::smp;
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::VirtAddr;

/// プロセス生成に失敗しうる理由。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// プロセステーブルに空きスロットがない
    NoFreeSlots,
    /// アドレス空間の構築に失敗
    Paging(PagingError),
    /// 物理フレームが枯渇
    OutOfMemory,
    /// イメージが `total_size` に収まらない
    ImageTooLarge,
}

impl From<PagingError> for SchedulerError {
    fn from(e: PagingError) -> Self {
        SchedulerError::Paging(e)
    }
}

impl From<FrameError> for SchedulerError {
    fn from(_: FrameError) -> Self {
        SchedulerError::OutOfMemory
    }
}

/// コアごとのスケジューラコンテキスト（そのコアの `run()` ループの一時停止点）。
/// 各コアは自分のスロットしか触らないので `UnsafeCell` で十分。
struct CoreContext(UnsafeCell<u64>);
// SAFETY: each logical core only ever reads/writes its own `CoreContext`
// slot, both from `run()` and from the switch-back path in this module.
unsafe impl Sync for CoreContext {}

static SCHEDULER_CONTEXT: [CoreContext; MAX_CORES] =
    [const { CoreContext(UnsafeCell::new(0)) }; MAX_CORES];

static TICKS: [AtomicU64; MAX_CORES] = [const { AtomicU64::new(0) }; MAX_CORES];

static KERNEL_SPACE: spin::Once<AddressSpace> = spin::Once::new();

fn kernel_space() -> AddressSpace {
    *KERNEL_SPACE.get().expect("scheduler::init must run before scheduling starts")
}

fn kernel_stack_layout() -> Layout {
    Layout::from_size_align(PROCESS_KERNEL_STACK_SIZE, 16)
        .expect("PROCESS_KERNEL_STACK_SIZE/16 is a valid layout")
}

/// カーネルの共有アドレス空間を記録する。ブートの非常に早い段階、
/// `paging::setup_kernel_space` の直後に一度だけ呼ぶ。
pub fn init(space: AddressSpace) {
    KERNEL_SPACE.call_once(|| space);
}

/// 各コアのアイドルプロセスを確保する。`scheduler::init` の直後、他のどんな
/// プロセスも読み込む前に一度だけ呼ぶこと — スロットは確保順に 0 から割り振られる
/// ので、これを最初に呼ぶことでスロットインデックス == コア番号という不変条件
/// （§3 アイドルプロセス不変条件）が成り立つ。アイドルスロットは ready キューには
/// 一切載らず、`run()` がキューが空のときだけコア番号そのものをインデックスとして
/// 直接選ぶ。
pub fn init_idle(core_count: usize) {
    for core in 0..core_count {
        let idx = {
            let mut table = PROCESS_TABLE.lock();
            table.allocate_slot().expect("idle slots are allocated before anything else")
        };
        debug_assert_eq!(idx, core, "idle slot index must equal its core number");

        // SAFETY: kernel_stack_layout() has non-zero size and a valid alignment.
        let stack_base = unsafe { alloc_zeroed(kernel_stack_layout()) };
        assert!(!stack_base.is_null(), "out of memory allocating an idle process's kernel stack");
        let kernel_stack_top = stack_base as u64 + PROCESS_KERNEL_STACK_SIZE as u64;

        let mut table = PROCESS_TABLE.lock();
        table.slots[idx].address_space = Some(kernel_space());
        table.slots[idx].kernel_stack_top = kernel_stack_top;
        table.slots[idx].is_idle = true;
        table.slots[idx].state = ProcessState::Ready;
        switch::setup_kernel_context(
            VirtAddr::new(kernel_stack_top),
            idle_entry,
            &mut table.slots[idx].context_rsp,
        );
    }
}

/// アイドルプロセスの本体。`run()` がスケジューラコンテキストから直接ここへ
/// 飛び込む。割り込みを有効にして `hlt` するだけ — タイマー割り込みが
/// `on_timer_tick` を呼び、ready キューに何か積まれていればそちらを起こして
/// `yield_now` 経由でスケジューラへ戻る（このスロット自身は ready に積まれない）。
unsafe extern "C" fn idle_entry() -> ! {
    // SAFETY: mirrors process_entry_trampoline's contract — run() forgot the
    // PROCESS_TABLE guard before switching here; the resuming side drops it.
    unsafe { PROCESS_TABLE.force_unlock() };
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

/// 新しいプロセスをプロセステーブルに確保し、ready キューへ積む。
/// `image` の先頭 `code_size` バイトがユーザー範囲の先頭へコピーされる。
pub fn allocate_process(
    image: &[u8],
    code_size: usize,
    total_size: usize,
    parent: Option<ProcessId>,
) -> Result<ProcessId, SchedulerError> {
    if code_size > total_size {
        return Err(SchedulerError::ImageTooLarge);
    }

    let idx = {
        let mut table = PROCESS_TABLE.lock();
        table.allocate_slot().ok_or(SchedulerError::NoFreeSlots)?
    };

    let space = paging::new_process_address_space(&PHYS_FRAME_ALLOCATOR, kernel_space())?;
    paging::init_user_space(&PHYS_FRAME_ALLOCATOR, space, image, code_size, total_size)?;

    // SAFETY: kernel_stack_layout() has non-zero size and a valid alignment.
    let stack_base = unsafe { alloc_zeroed(kernel_stack_layout()) };
    if stack_base.is_null() {
        return Err(SchedulerError::OutOfMemory);
    }
    let kernel_stack_top = stack_base as u64 + PROCESS_KERNEL_STACK_SIZE as u64;

    let selectors = gdt::selectors();
    let frame = UserFrame {
        rax: 0, rbx: 0, rcx: 0, rdx: 0, rsi: 0, rdi: 0, rbp: 0,
        r8: 0, r9: 0, r10: 0, r11: 0, r12: 0, r13: 0, r14: 0, r15: 0,
        rip: USER_LOAD_ADDRESS,
        cs: u64::from(selectors.user_code.0),
        rflags: PROC_RFLAGS,
        // The user range has no separate stack segment; rsp starts at the
        // top of the same [USER_LOAD_ADDRESS, USER_LOAD_ADDRESS+total_size)
        // window the image was loaded into (§4.3, exec test property).
        rsp: USER_LOAD_ADDRESS + total_size as u64,
        ss: u64::from(selectors.user_data.0),
    };

    let mut table = PROCESS_TABLE.lock();
    let pid = table.slots[idx].pid;
    table.slots[idx].address_space = Some(space);
    table.slots[idx].total_user_size = total_size;
    table.slots[idx].kernel_stack_top = kernel_stack_top;
    table.slots[idx].frame = frame;
    table.slots[idx].parent = parent;
    switch::setup_process_context(VirtAddr::new(kernel_stack_top), &mut table.slots[idx].context_rsp);
    table.enqueue_ready(idx);
    Ok(pid)
}

/// このコアのスケジューラループ。`init` 済みであることが前提で、戻らない。
pub fn run(core: usize) -> ! {
    loop {
        // An empty ready queue falls back to this core's own idle slot
        // (slot index == core number, see init_idle) rather than halting
        // the scheduler loop itself.
        let idx = {
            let mut table = PROCESS_TABLE.lock();
            table.dequeue_ready().unwrap_or(core)
        };

        let mut table = PROCESS_TABLE.lock();
        table.set_current_slot(core, Some(idx));
        let stack_top = table.slots[idx].kernel_stack_top();
        let space = table.slots[idx]
            .address_space
            .expect("a ready process always owns an address space");
        let next_ctx = table.slots[idx].context_rsp;
        let prev_ctx = SCHEDULER_CONTEXT[core].0.get();
        // Carried into the switch; the resuming side drops it (§5).
        core::mem::forget(table);

        // SAFETY: prev_ctx is this core's own scheduler-context slot; next_ctx
        // was set up by allocate_process/fork or saved by a prior switch-out.
        unsafe { context_switch(core, prev_ctx, next_ctx, stack_top, space) };

        // SAFETY: resuming side of the lock handoff described above.
        unsafe { PROCESS_TABLE.force_unlock() };
        PROCESS_TABLE.lock().set_current_slot(core, None);
    }
}

/// 現在のプロセスの実行コンテキストを保存し、このコアのスケジューラへ戻る。
/// 呼び出し元は、自分のスロットを ready/wait/killed のどれかへ積んでから呼ぶこと。
fn switch_to_scheduler(core: usize, idx: usize) {
    {
        let mut table = PROCESS_TABLE.lock();
        let prev_ctx: *mut u64 = &mut table.slots[idx].context_rsp;
        let next_ctx = unsafe { *SCHEDULER_CONTEXT[core].0.get() };
        let scheduler_stack = gdt::default_kernel_stack_top(core);
        let space = kernel_space();
        core::mem::forget(table);
        // SAFETY: next_ctx is this core's scheduler context, saved the last
        // time run() switched away from it; scheduler_stack/space belong to
        // the shared kernel address space, valid for any ring-0 re-entry.
        unsafe { context_switch(core, prev_ctx, next_ctx, scheduler_stack, space) };
    }
    // SAFETY: resuming side of the lock handoff (§5).
    unsafe { PROCESS_TABLE.force_unlock() };
}

/// 現在のプロセスを ready キューへ戻し、自発的に CPU を明け渡す。
/// アイドルプロセスは ready キューへは載せない（§3 アイドルプロセス不変条件）—
/// `run()` がキューの空を見て直接アイドルへ戻ってくる。
pub fn yield_now() {
    let core = smp::core_index();
    let idx = {
        let mut table = PROCESS_TABLE.lock();
        let idx = table
            .current_slot(core)
            .expect("yield_now called with no current process");
        if !table.slots[idx].is_idle {
            table.enqueue_ready(idx);
        }
        idx
    };
    switch_to_scheduler(core, idx);
}

/// 現在のプロセスを `tag` を待つ event-wait キューへ入れ、CPU を明け渡す。
pub fn sleep(tag: i64) {
    let core = smp::core_index();
    let idx = {
        let mut table = PROCESS_TABLE.lock();
        let idx = table
            .current_slot(core)
            .expect("sleep called with no current process");
        table.enqueue_wait(idx, tag);
        idx
    };
    switch_to_scheduler(core, idx);
}

/// `tag` を待っているすべてのプロセスを起こす。
pub fn wake(tag: i64) {
    PROCESS_TABLE.lock().wake(tag);
}

/// タイマー割り込みのたびに呼ばれる。協調的ラウンドロビン: tick を数え、
/// 実行中のプロセスがあれば明け渡させる（§4.4）。
pub fn on_timer_tick() {
    let core = smp::core_index();
    TICKS[core].fetch_add(1, Ordering::Relaxed);
    PROCESS_TABLE.lock().wake(TAG_TIMER_TICK);
    if PROCESS_TABLE.lock().current_slot(core).is_some() {
        yield_now();
    }
}

/// 現在のコアでこれまでに処理したタイマー割り込みの回数（診断用）。
pub fn ticks(core: usize) -> u64 {
    TICKS[core].load(Ordering::Relaxed)
}

/// 子プロセスのカーネルスタックを解放する。`wait()` が killed な子を
/// 回収するとき、`release_slot` の直前に呼ぶ。
fn free_kernel_stack(kernel_stack_top: u64) {
    if kernel_stack_top == 0 {
        return;
    }
    let base = (kernel_stack_top - PROCESS_KERNEL_STACK_SIZE as u64) as *mut u8;
    // SAFETY: kernel_stack_top was produced by allocate_process/fork with
    // this exact layout, and the owning process is Killed (no longer
    // running) by the time wait() reaps it.
    unsafe { dealloc(base, kernel_stack_layout()) };
}

/// 現在のプロセスを終了させる。ユーザーアドレス空間を即座に解放し、
/// killed キューへ移して親を起こす。カーネルスタック自体は親の `wait()`
/// が回収するまで残る（§4.3）。
pub fn exit_current(code: i32) -> ! {
    let core = smp::core_index();

    let mut table = PROCESS_TABLE.lock();
    let idx = table
        .current_slot(core)
        .expect("exit_current called with no current process");

    if let Some(space) = table.slots[idx].address_space.take() {
        let total = table.slots[idx].total_user_size;
        let (image_start, image_end) = kernel_image_bounds();
        let _ = paging::free_tree(&PHYS_FRAME_ALLOCATOR, space, total, image_start, image_end);
    }

    table.slots[idx].exit_code = code;
    table.enqueue_killed(idx);
    table.wake(TAG_PROCESS_EXIT);

    let next_ctx = unsafe { *SCHEDULER_CONTEXT[core].0.get() };
    let scheduler_stack = gdt::default_kernel_stack_top(core);
    let space = kernel_space();
    let mut unused_ctx: u64 = 0;
    core::mem::forget(table);
    // SAFETY: this slot never resumes, so `unused_ctx` is a throwaway save
    // target; next_ctx/scheduler_stack/space are the scheduler's own.
    unsafe { context_switch(core, &mut unused_ctx, next_ctx, scheduler_stack, space) };
    unreachable!("a killed process's context was resumed")
}

/// `pid` に一致する killed エントリを1つ回収して終了コードを返す。その pid を
/// 持つスロットがもう存在しなければ -1。まだ生きているが killed ではなければ、
/// いずれかが終了するまで眠る（killed リストは tag ではなく pid そのもので
/// 照合する — exit() が自分の pid を刻むので、親子関係は見ない）。
pub fn wait(pid: u64) -> i64 {
    let core = smp::core_index();
    let target = ProcessId::new(pid as u32);
    loop {
        let mut table = PROCESS_TABLE.lock();
        let idx = table.current_slot(core).expect("wait called with no current process");

        if let Some(child_idx) = table.take_killed_by_pid(target) {
            let exit_code = table.slots[child_idx].exit_code;
            free_kernel_stack(table.slots[child_idx].kernel_stack_top);
            for of in table.slots[child_idx].open_files.iter().flatten() {
                crate::kernel::fs::files::close(of.fcb_index);
            }
            table.release_slot(child_idx);
            return i64::from(exit_code);
        }

        if !table.pid_exists(target) {
            return -1;
        }

        table.enqueue_wait(idx, TAG_PROCESS_EXIT);
        drop(table);
        switch_to_scheduler(core, idx);
        // Woken by exit_current's wake(TAG_PROCESS_EXIT); loop around and
        // re-check for the targeted pid in the killed list.
    }
}

/// 現在のプロセスを複製する。`parent_frame` は syscall 入口が捕捉した、
/// 呼び出し時点のユーザーレジスタ一式（§4.3: fork はこれをコピーし rax だけ
/// 書き換える）。子の pid を返す。失敗時は -1。
pub fn fork(parent_frame: &UserFrame) -> i64 {
    let core = smp::core_index();

    let (parent_pid, parent_space, total_size, parent_open_files) = {
        let table = PROCESS_TABLE.lock();
        let idx = table.current_slot(core).expect("fork called with no current process");
        (
            table.slots[idx].pid,
            table.slots[idx]
                .address_space
                .expect("forking process always owns an address space"),
            table.slots[idx].total_user_size,
            table.slots[idx].open_files,
        )
    };

    let idx = {
        let mut table = PROCESS_TABLE.lock();
        match table.allocate_slot() {
            Some(idx) => idx,
            None => return -1,
        }
    };

    let child_space = match paging::new_process_address_space(&PHYS_FRAME_ALLOCATOR, kernel_space()) {
        Ok(space) => space,
        Err(_) => {
            PROCESS_TABLE.lock().release_slot(idx);
            return -1;
        }
    };
    if paging::copy_user_space(
        &PHYS_FRAME_ALLOCATOR,
        child_space,
        parent_space,
        VirtAddr::new(USER_LOAD_ADDRESS),
        total_size,
    )
    .is_err()
    {
        PROCESS_TABLE.lock().release_slot(idx);
        return -1;
    }

    // SAFETY: kernel_stack_layout() has non-zero size and a valid alignment.
    let stack_base = unsafe { alloc_zeroed(kernel_stack_layout()) };
    if stack_base.is_null() {
        PROCESS_TABLE.lock().release_slot(idx);
        return -1;
    }
    let kernel_stack_top = stack_base as u64 + PROCESS_KERNEL_STACK_SIZE as u64;

    let mut child_frame = *parent_frame;
    child_frame.rax = 0;

    let mut table = PROCESS_TABLE.lock();
    let pid = table.slots[idx].pid;
    table.slots[idx].address_space = Some(child_space);
    table.slots[idx].total_user_size = total_size;
    table.slots[idx].kernel_stack_top = kernel_stack_top;
    table.slots[idx].frame = child_frame;
    table.slots[idx].parent = Some(parent_pid);
    table.slots[idx].open_files = parent_open_files;
    for of in parent_open_files.iter().flatten() {
        crate::kernel::fs::files::bump_ref_count(of.fcb_index);
    }
    switch::setup_process_context(VirtAddr::new(kernel_stack_top), &mut table.slots[idx].context_rsp);
    table.enqueue_ready(idx);
    i64::from(pid.as_u32())
}

/// 現在のプロセスのイメージを `image` で置き換える（exec、§4.3）。アドレス空間は
/// 新規に作らず、既存のユーザー範囲をゼロ化してから上書きする。
/// `image.len()` が `total_process_size - 1ページ` を超える場合は失敗し、
/// 呼び出し元（syscall ディスパッチ）がプロセスを終了させる責任を持つ。
pub fn exec_current(image: &[u8], code_size: usize) -> Result<(), SchedulerError> {
    let core = smp::core_index();

    let (space, total_size) = {
        let table = PROCESS_TABLE.lock();
        let idx = table.current_slot(core).expect("exec_current called with no current process");
        (
            table.slots[idx]
                .address_space
                .expect("execing process always owns an address space"),
            table.slots[idx].total_user_size,
        )
    };

    if code_size > total_size.saturating_sub(PAGE_SIZE) {
        return Err(SchedulerError::ImageTooLarge);
    }

    paging::reload_user_image(space, image, code_size, total_size)?;

    let selectors = gdt::selectors();
    let mut table = PROCESS_TABLE.lock();
    let idx = table.current_slot(core).expect("exec_current called with no current process");
    table.slots[idx].frame = UserFrame {
        rax: 0, rbx: 0, rcx: 0, rdx: 0, rsi: 0, rdi: 0, rbp: 0,
        r8: 0, r9: 0, r10: 0, r11: 0, r12: 0, r13: 0, r14: 0, r15: 0,
        rip: USER_LOAD_ADDRESS,
        cs: u64::from(selectors.user_code.0),
        rflags: PROC_RFLAGS,
        rsp: USER_LOAD_ADDRESS + total_size as u64,
        ss: u64::from(selectors.user_data.0),
    };
    Ok(())
}
