// src/arch/x86_64/gdt.rs
//! Global Descriptor Table (GDT) / per-core Task State Segment (TSS)
//!
//! コアごとに独立した TSS を持つが、GDT 自体は 1 個だけ確保し、コアの数だけ
//! TSS ディスクリプタを追加する。IST スロット 1 は各コア固有の緊急スタックを
//! 指し、フォールト系ベクタ (NMI/ダブルフォルト/無効TSS/スタックセグメント
//! フォルト/GPF) はそこへ切り替わる（§4.4）。

use crate::kernel::constants::{CORE_IST1_STACK_SIZE, CORE_STACK_SIZE, MAX_CORES};
use lazy_static::lazy_static;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// フォールトが信頼できないスタック状態で発生し得るベクタに使う IST スロット。
pub const FAULT_IST_INDEX: u16 = 1;

#[repr(C, align(4096))]
struct AlignedStack<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> AlignedStack<N> {
    const fn new() -> Self {
        Self { data: [0; N] }
    }

    fn top(&self) -> VirtAddr {
        VirtAddr::from_ptr(core::ptr::addr_of!(self.data)) + N as u64
    }
}

static mut IST1_STACKS: [AlignedStack<CORE_IST1_STACK_SIZE>; MAX_CORES] = [
    AlignedStack::new(),
    AlignedStack::new(),
    AlignedStack::new(),
    AlignedStack::new(),
];

/// ブート直後／まだどのプロセスにも割り当てられていないコアが使う既定の
/// ring-0 スタック。スケジューラがプロセスを走らせ始めたら、そのプロセスの
/// ring-0 スタック頂上に差し替えられる。
static mut DEFAULT_KERNEL_STACKS: [AlignedStack<CORE_STACK_SIZE>; MAX_CORES] = [
    AlignedStack::new(),
    AlignedStack::new(),
    AlignedStack::new(),
    AlignedStack::new(),
];

static mut TSS: [TaskStateSegment; MAX_CORES] = [
    TaskStateSegment::new(),
    TaskStateSegment::new(),
    TaskStateSegment::new(),
    TaskStateSegment::new(),
];

/// GDT とセグメントセレクタ
pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    pub tss: [SegmentSelector; MAX_CORES],
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();

        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());

        let mut tss_selectors = [kernel_code; MAX_CORES];
        for core in 0..MAX_CORES {
            // SAFETY: TSS is fixed at a 'static address and only this init
            // path (run once per core, before that core's GDT is loaded)
            // takes a reference to its own slot.
            let tss_ref: &'static TaskStateSegment =
                unsafe { &*core::ptr::addr_of!(TSS[core]) };
            tss_selectors[core] = gdt.append(Descriptor::tss_segment(tss_ref));
        }

        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                user_code,
                user_data,
                tss: tss_selectors,
            },
        )
    };
}

/// セグメントセレクタを取得
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// このコアの ring-0 スタック（TSS の `privilege_stack_table[0]`）を差し替える。
/// スケジューラが次のプロセスへ切り替えるたびに呼ぶ（§4.3）。
///
/// # Safety
/// `core` が呼び出し中のコア自身の ID であること。他コアの TSS を書き換える
/// のは、そのコアが現在それを使っていないことを呼び出し元が保証する場合のみ
/// 安全。
pub unsafe fn set_kernel_stack(core: usize, top: VirtAddr) {
    // SAFETY: each core only ever touches its own TSS entry during normal
    // operation; see the function's own safety contract for the rest.
    unsafe {
        let tss = &mut *core::ptr::addr_of_mut!(TSS[core]);
        tss.privilege_stack_table[0] = top;
    }
}

/// このコアの TSS に現在設定されている ring-0 スタック頂上（RSP0）を読む。
/// `set_kernel_stack` が直前に書いた値、すなわち今走っているプロセスの
/// カーネルスタック頂上を返す。syscall 入口がこのコアのカーネルスタックへ
/// 切り替える際に使う（§4.5）。
pub fn current_kernel_stack_top(core: usize) -> VirtAddr {
    // SAFETY: reads only this core's own TSS slot.
    unsafe { core::ptr::addr_of!(TSS[core]).as_ref().unwrap().privilege_stack_table[0] }
}

/// このコアの既定 ring-0 スタックの頂上。スケジューラ自身の実行コンテキスト
/// （どのプロセスも実行していない間の TSS RSP0）に戻すときに使う。
pub fn default_kernel_stack_top(core: usize) -> VirtAddr {
    // SAFETY: each core only reads its own slot; the array is 'static and
    // initialized to zeroed stacks at link time.
    unsafe { core::ptr::addr_of!(DEFAULT_KERNEL_STACKS[core]).as_ref().unwrap().top() }
}

/// このコアの GDT/TSS を初期化し、ロードする。ブート時に一度だけ、各コアの
/// 実行が始まった直後に呼ぶ。
pub fn init(core: usize) {
    use x86_64::instructions::segmentation::{Segment, CS};
    use x86_64::instructions::tables::load_tss;

    // SAFETY: each core writes only its own TSS/stack slots before loading
    // its own TSS selector; no other core observes this memory concurrently.
    unsafe {
        let ist1_top = core::ptr::addr_of!(IST1_STACKS[core]).as_ref().unwrap().top();
        let default_stack_top =
            core::ptr::addr_of!(DEFAULT_KERNEL_STACKS[core]).as_ref().unwrap().top();

        let tss = &mut *core::ptr::addr_of_mut!(TSS[core]);
        tss.interrupt_stack_table[FAULT_IST_INDEX as usize] = ist1_top;
        tss.privilege_stack_table[0] = default_stack_top;

        GDT.0.load();
        CS::set_reg(GDT.1.kernel_code);
        load_tss(GDT.1.tss[core]);
    }
}
