// src/kernel/process/mod.rs
//! プロセス管理モジュール
//!
//! プロセステーブルは固定長配列 `[ProcessSlot; MAX_PROCESSES]` で、ヒープ確保を
//! 一切行わない。3つの侵入的単方向リスト（ready・event-wait・killed）がスロット
//! インデックスをリンクとして使い回す（§3, §4.3）。

pub mod lifecycle;
pub mod switch;

pub use lifecycle::{exec_process, fork_process, spawn_initial_process, terminate_process, wait_for_child};
pub use switch::context_switch;

use crate::kernel::constants::MAX_FILES_PER_PROCESS;
use crate::kernel::mm::paging::AddressSpace;
use spin::Mutex;
use x86_64::VirtAddr;

/// プロセスID。スロットインデックスとは独立に単調増加する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// プロセスの状態（§3, §4.3 の6状態）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// スロット未使用
    Unused,
    /// アドレス空間構築中、まだどの実行キューにも載っていない
    Init,
    /// ready キューで実行を待っている
    Ready,
    /// このコアで現在実行中
    Running,
    /// ある tag を待って event-wait キューに入っている
    Sleeping,
    /// exit 済みで親の wait() を待っている
    Killed,
}

/// ユーザーモードへ復帰する際に iretq が読む保存済みレジスタ一式。
/// fork はこの構造体をコピーしたうえで rax/rsp/rbp/rip/rflags を上書きする（§4.3）。
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UserFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl UserFrame {
    const fn new() -> Self {
        Self {
            rax: 0, rbx: 0, rcx: 0, rdx: 0, rsi: 0, rdi: 0, rbp: 0,
            r8: 0, r9: 0, r10: 0, r11: 0, r12: 0, r13: 0, r14: 0, r15: 0,
            rip: 0, cs: 0, rflags: crate::kernel::constants::PROC_RFLAGS, rsp: 0, ss: 0,
        }
    }
}

/// プロセスが開いているファイル1件分。FAT16 の FCB/FD テーブルの実体は
/// `kernel::fs::fat16` 側にあり、ここではそのインデックスと現在位置だけを持つ。
#[derive(Debug, Clone, Copy)]
pub struct OpenFile {
    pub fcb_index: usize,
    pub position: usize,
}

/// 任意のGUIウィンドウ属性（`guiInfo`、§3）。コアはこれを読み書きも解釈もしない —
/// ウィンドウシステム（対象外）が将来ここへ読み書きするための置き場所でしかない。
#[derive(Debug, Clone, Copy)]
pub struct GuiAttributes {
    pub win_x: i64,
    pub win_y: i64,
    pub win_width: i64,
    pub win_height: i64,
    pub owns_mouse: bool,
    pub mouse_left_button_clicked: bool,
    pub win_r: u8,
    pub win_g: u8,
    pub win_b: u8,
    pub exit_button_clicked: bool,
}

impl GuiAttributes {
    const fn new() -> Self {
        Self {
            win_x: 0,
            win_y: 0,
            win_width: 0,
            win_height: 0,
            owns_mouse: false,
            mouse_left_button_clicked: false,
            win_r: 0,
            win_g: 0,
            win_b: 0,
            exit_button_clicked: false,
        }
    }
}

/// プロセス制御ブロック。`Copy` にして配列初期化を `[ProcessSlot::unused(); N]` の
/// 単純な繰り返し式で済ませる。
#[derive(Clone, Copy)]
pub struct ProcessSlot {
    pub pid: ProcessId,
    pub state: ProcessState,
    pub address_space: Option<AddressSpace>,
    pub total_user_size: usize,
    pub kernel_stack_top: u64,
    pub context_rsp: u64,
    pub frame: UserFrame,
    /// Sleeping のときに待っているタグ。他の状態では無視される。
    pub wait_tag: i64,
    pub exit_code: i32,
    pub parent: Option<ProcessId>,
    pub open_files: [Option<OpenFile>; MAX_FILES_PER_PROCESS],
    pub gui: GuiAttributes,
    pub is_idle: bool,
    pub owning_core: Option<usize>,
    next_ready: Option<usize>,
    next_wait: Option<usize>,
    next_killed: Option<usize>,
}

impl ProcessSlot {
    const fn unused() -> Self {
        Self {
            pid: ProcessId::new(0),
            state: ProcessState::Unused,
            address_space: None,
            total_user_size: 0,
            kernel_stack_top: 0,
            context_rsp: 0,
            frame: UserFrame::new(),
            wait_tag: 0,
            exit_code: 0,
            parent: None,
            open_files: [None; MAX_FILES_PER_PROCESS],
            gui: GuiAttributes::new(),
            is_idle: false,
            owning_core: None,
            next_ready: None,
            next_wait: None,
            next_killed: None,
        }
    }

    #[must_use]
    pub fn kernel_stack_top(&self) -> VirtAddr {
        VirtAddr::new(self.kernel_stack_top)
    }
}

/// 固定長プロセステーブルと、その上に載る3本の侵入的キュー。
pub struct ProcessTable {
    pub slots: [ProcessSlot; crate::kernel::constants::MAX_PROCESSES],
    ready_head: Option<usize>,
    ready_tail: Option<usize>,
    wait_head: Option<usize>,
    killed_head: Option<usize>,
    killed_tail: Option<usize>,
    next_pid: u32,
    /// コアごとに現在実行中のスロット番号。
    current: [Option<usize>; crate::kernel::constants::MAX_CORES],
}

impl ProcessTable {
    const fn new() -> Self {
        Self {
            slots: [ProcessSlot::unused(); crate::kernel::constants::MAX_PROCESSES],
            ready_head: None,
            ready_tail: None,
            wait_head: None,
            killed_head: None,
            killed_tail: None,
            next_pid: 1,
            current: [None; crate::kernel::constants::MAX_CORES],
        }
    }

    /// 未使用スロットを1つ確保し、`Init` 状態で返す。queue には載せない
    /// （呼び出し元がアドレス空間を組み終えてから `enqueue_ready` する）。
    pub fn allocate_slot(&mut self) -> Option<usize> {
        let idx = self.slots.iter().position(|s| s.state == ProcessState::Unused)?;
        let pid = ProcessId::new(self.next_pid);
        self.next_pid += 1;
        self.slots[idx] = ProcessSlot::unused();
        self.slots[idx].pid = pid;
        self.slots[idx].state = ProcessState::Init;
        Some(idx)
    }

    pub fn enqueue_ready(&mut self, idx: usize) {
        self.slots[idx].state = ProcessState::Ready;
        self.slots[idx].next_ready = None;
        match self.ready_tail {
            Some(tail) => {
                self.slots[tail].next_ready = Some(idx);
                self.ready_tail = Some(idx);
            }
            None => {
                self.ready_head = Some(idx);
                self.ready_tail = Some(idx);
            }
        }
    }

    pub fn dequeue_ready(&mut self) -> Option<usize> {
        let head = self.ready_head?;
        self.ready_head = self.slots[head].next_ready;
        if self.ready_head.is_none() {
            self.ready_tail = None;
        }
        self.slots[head].next_ready = None;
        Some(head)
    }

    pub fn enqueue_wait(&mut self, idx: usize, tag: i64) {
        self.slots[idx].state = ProcessState::Sleeping;
        self.slots[idx].wait_tag = tag;
        self.slots[idx].next_wait = self.wait_head;
        self.wait_head = Some(idx);
    }

    /// `tag` を待っているすべてのスロットを wait キューから外し、ready へ積む。
    pub fn wake(&mut self, tag: i64) {
        let mut cur = self.wait_head;
        let mut prev: Option<usize> = None;
        let mut new_head = None;
        // Rebuild the wait list, skipping (and readying) matching entries.
        while let Some(idx) = cur {
            let next = self.slots[idx].next_wait;
            if self.slots[idx].wait_tag == tag {
                self.enqueue_ready(idx);
            } else {
                self.slots[idx].next_wait = new_head;
                new_head = Some(idx);
                let _ = prev;
            }
            prev = Some(idx);
            cur = next;
        }
        let _ = prev;
        self.wait_head = new_head;
    }

    pub fn enqueue_killed(&mut self, idx: usize) {
        self.slots[idx].state = ProcessState::Killed;
        self.slots[idx].next_killed = None;
        match self.killed_tail {
            Some(tail) => {
                self.slots[tail].next_killed = Some(idx);
                self.killed_tail = Some(idx);
            }
            None => {
                self.killed_head = Some(idx);
                self.killed_tail = Some(idx);
            }
        }
    }

    /// killed リストから自分自身の pid が `pid` に一致するエントリを外す
    /// （exit() が自分の pid を killed エントリに刻むので、親子関係は見ない。
    /// `wait(pid)` の契約そのもの — original_source の `exit()`/`wait()` 参照）。
    pub fn take_killed_by_pid(&mut self, pid: ProcessId) -> Option<usize> {
        let mut cur = self.killed_head;
        let mut prev: Option<usize> = None;
        while let Some(idx) = cur {
            let next = self.slots[idx].next_killed;
            if self.slots[idx].pid == pid {
                match prev {
                    Some(p) => self.slots[p].next_killed = next,
                    None => self.killed_head = next,
                }
                if self.killed_tail == Some(idx) {
                    self.killed_tail = prev;
                }
                self.slots[idx].next_killed = None;
                return Some(idx);
            }
            prev = Some(idx);
            cur = next;
        }
        None
    }

    /// `pid` を持つスロットがまだテーブルに存在するか（killed 含む、Unused は除く）。
    pub fn pid_exists(&self, pid: ProcessId) -> bool {
        self.slots.iter().any(|s| s.state != ProcessState::Unused && s.pid == pid)
    }

    /// スロットを `Unused` へ戻し、プロセステーブルに再利用可能にする。
    /// `wait()` が killed な子を回収した後に呼ぶ。
    pub fn release_slot(&mut self, idx: usize) {
        self.slots[idx] = ProcessSlot::unused();
    }

    pub fn current_slot(&self, core: usize) -> Option<usize> {
        self.current[core]
    }

    pub fn set_current_slot(&mut self, core: usize, idx: Option<usize>) {
        self.current[core] = idx;
        if let Some(idx) = idx {
            self.slots[idx].owning_core = Some(core);
            self.slots[idx].state = ProcessState::Running;
        }
    }
}

/// グローバルプロセステーブル。物理アロケータ・FAT16・ディスクロックより先に
/// 取られ得る（§5 のロックネスト順序）。
pub static PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn allocate_slot_assigns_monotonic_pids() {
        let mut table = ProcessTable::new();
        let a = table.allocate_slot().expect("slot available");
        let b = table.allocate_slot().expect("slot available");
        assert!(table.slots[b].pid.as_u32() > table.slots[a].pid.as_u32());
        assert_eq!(table.slots[a].state, ProcessState::Init);
    }

    #[test_case]
    fn ready_queue_is_fifo() {
        let mut table = ProcessTable::new();
        let a = table.allocate_slot().unwrap();
        let b = table.allocate_slot().unwrap();
        let c = table.allocate_slot().unwrap();
        table.enqueue_ready(a);
        table.enqueue_ready(b);
        table.enqueue_ready(c);

        assert_eq!(table.dequeue_ready(), Some(a));
        assert_eq!(table.dequeue_ready(), Some(b));
        assert_eq!(table.dequeue_ready(), Some(c));
        assert_eq!(table.dequeue_ready(), None);
    }

    #[test_case]
    fn wake_only_moves_matching_tags_to_ready() {
        let mut table = ProcessTable::new();
        let a = table.allocate_slot().unwrap();
        let b = table.allocate_slot().unwrap();
        let c = table.allocate_slot().unwrap();
        table.enqueue_wait(a, 10);
        table.enqueue_wait(b, 20);
        table.enqueue_wait(c, 10);

        table.wake(10);

        assert_eq!(table.slots[a].state, ProcessState::Ready);
        assert_eq!(table.slots[c].state, ProcessState::Ready);
        assert_eq!(table.slots[b].state, ProcessState::Sleeping);

        // b is still waiting on tag 20 and must still be woken later.
        table.wake(20);
        assert_eq!(table.slots[b].state, ProcessState::Ready);
    }

    #[test_case]
    fn take_killed_by_pid_matches_the_slots_own_pid_not_its_parent() {
        let mut table = ProcessTable::new();
        let parent = table.allocate_slot().unwrap();
        let parent_pid = table.slots[parent].pid;
        let child_a = table.allocate_slot().unwrap();
        let child_b = table.allocate_slot().unwrap();
        let child_a_pid = table.slots[child_a].pid;
        let child_b_pid = table.slots[child_b].pid;
        table.slots[child_a].parent = Some(parent_pid);
        table.slots[child_b].parent = Some(parent_pid);
        table.enqueue_killed(child_a);
        table.enqueue_killed(child_b);

        // Waiting on the parent's own pid must not match either child.
        assert_eq!(table.take_killed_by_pid(parent_pid), None);

        let taken = table.take_killed_by_pid(child_a_pid).expect("child_a is killed");
        assert_eq!(taken, child_a);
        // child_a has already been taken; child_b is unaffected and still queued.
        assert_eq!(table.take_killed_by_pid(child_a_pid), None);
        assert_eq!(table.take_killed_by_pid(child_b_pid), Some(child_b));
    }

    #[test_case]
    fn pid_exists_ignores_unused_slots() {
        let mut table = ProcessTable::new();
        let idx = table.allocate_slot().unwrap();
        let pid = table.slots[idx].pid;
        assert!(table.pid_exists(pid));

        table.release_slot(idx);
        assert!(!table.pid_exists(pid));
    }

    #[test_case]
    fn release_slot_allows_reuse() {
        let mut table = ProcessTable::new();
        let idx = table.allocate_slot().unwrap();
        table.release_slot(idx);
        assert_eq!(table.slots[idx].state, ProcessState::Unused);
        // the freed slot (or an equivalent one) must be allocatable again.
        assert!(table.allocate_slot().is_some());
    }

    #[test_case]
    fn set_current_slot_marks_owning_core_and_running() {
        let mut table = ProcessTable::new();
        let idx = table.allocate_slot().unwrap();
        table.set_current_slot(0, Some(idx));
        assert_eq!(table.current_slot(0), Some(idx));
        assert_eq!(table.slots[idx].owning_core, Some(0));
        assert_eq!(table.slots[idx].state, ProcessState::Running);
    }
}
