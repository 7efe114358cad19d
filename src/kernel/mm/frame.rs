// src/kernel/mm/frame.rs
//! 物理フレームアロケータ
//!
//! カーネルのアイデンティティマップされたウィンドウ内にある 4 KiB フレームの
//! 単方向連結フリーリストを管理します。フリーフレームは自分自身の先頭 8 バイトに
//! 次のフリーフレームへのリンクを保持します — 専用のメタデータ領域は確保しません。

use spin::Mutex;

use super::types::PhysAddr;
use crate::kernel::constants::{KERNEL_HIGH_HALF_BASE, KERNEL_WINDOW_END, PAGE_SIZE};

/// フレームアロケータのエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// フリーリストが空
    OutOfMemory,
    /// 指定アドレスがカーネルウィンドウの外
    AddressOutOfKernelWindow,
    /// アラインメントが 4 KiB 境界に揃っていない
    Misaligned,
    /// 解放しようとしたアドレスがカーネルイメージ自身の領域
    InsideKernelImage,
    /// 解放しようとしたアドレスがカーネルウィンドウの上限を超えている
    AboveKernelLimit,
}

/// 一件のメモリマップエントリ（ファームウェアから渡されるものを抽象化したもの）。
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// 物理アドレスの先頭
    pub start: PhysAddr,
    /// リージョンの長さ（バイト）
    pub len: usize,
    /// ファームウェアが usable RAM として報告したか
    pub usable: bool,
}

/// フリーフレームの先頭に書き込むリンク。フレームそのものをノードとして再利用する。
#[repr(C)]
struct FreeFrameNode {
    next: u64, // 0 = リストの終端
}

struct FreeList {
    head: u64, // 物理アドレス、0 = 空
    free_count: u64,
    allocated_count: u64,
}

/// 物理フレームアロケータ本体。単一のスピンロックで直列化される（§4.1, §5）。
pub struct FrameAllocator {
    list: Mutex<FreeList>,
    /// フレームを物理アドレスから読み書きする際のオフセット（物理→仮想）。
    /// カーネルの恒等マッピング窓の高位半分ベースに固定。
    phys_offset: u64,
}

impl FrameAllocator {
    /// 初期化前の空のアロケータを作成する。
    pub const fn new() -> Self {
        Self {
            list: Mutex::new(FreeList {
                head: 0,
                free_count: 0,
                allocated_count: 0,
            }),
            phys_offset: KERNEL_HIGH_HALF_BASE,
        }
    }

    fn phys_to_virt(&self, phys: u64) -> u64 {
        self.phys_offset + phys
    }

    /// ファームウェアのメモリマップを走査し、カーネルの物理ウィンドウ内にある
    /// usable なリージョンのフレームだけをフリーリストへ投入する。
    /// `kernel_image_start`/`kernel_image_end` に重なるフレームはスキップする。
    ///
    /// # Safety
    ///
    /// `regions` が実際のファームウェアメモリマップを正確に表しており、
    /// この関数がブート時に一度だけ呼ばれることを呼び出し元が保証する必要がある。
    pub unsafe fn init(
        &self,
        regions: &[MemoryRegion],
        kernel_image_start: u64,
        kernel_image_end: u64,
    ) {
        let mut list = self.list.lock();
        for region in regions {
            if !region.usable {
                continue;
            }
            let mut addr = region.start.as_u64();
            let end = addr.saturating_add(region.len as u64);
            while addr + PAGE_SIZE as u64 <= end {
                if addr >= KERNEL_WINDOW_END {
                    break;
                }
                let overlaps_image = addr < kernel_image_end && addr + PAGE_SIZE as u64 > kernel_image_start;
                if !overlaps_image {
                    // SAFETY: addr is inside the usable, non-image region just validated.
                    unsafe { self.push_locked(&mut list, addr) };
                }
                addr += PAGE_SIZE as u64;
            }
        }
    }

    unsafe fn push_locked(&self, list: &mut FreeList, phys: u64) {
        let virt = self.phys_to_virt(phys);
        // SAFETY: virt points at a frame just validated as free RAM inside the
        // kernel window; writing a FreeFrameNode there is exclusive at init time.
        unsafe {
            let node = virt as *mut FreeFrameNode;
            (*node).next = list.head;
        }
        list.head = phys;
        list.free_count += 1;
    }

    /// フリーリストの先頭を取り出す。返される仮想アドレスの内容はゼロ化されて
    /// いない — 呼び出し元がゼロ化の責任を持つ（§4.1）。
    pub fn alloc_page(&self) -> Result<PhysAddr, FrameError> {
        let mut list = self.list.lock();
        if list.head == 0 {
            return Err(FrameError::OutOfMemory);
        }
        let phys = list.head;
        let virt = self.phys_to_virt(phys);
        // SAFETY: phys is the current free-list head, guaranteed to hold a
        // valid FreeFrameNode written by a prior push.
        let next = unsafe { (*(virt as *const FreeFrameNode)).next };
        list.head = next;
        list.free_count -= 1;
        list.allocated_count += 1;
        Ok(PhysAddr::new(phys as usize))
    }

    /// フレームをフリーリストの先頭へ戻す。
    pub fn free_page(
        &self,
        phys: PhysAddr,
        kernel_image_start: u64,
        kernel_image_end: u64,
    ) -> Result<(), FrameError> {
        let addr = phys.as_u64();
        if addr % PAGE_SIZE as u64 != 0 {
            return Err(FrameError::Misaligned);
        }
        if addr >= kernel_image_start && addr < kernel_image_end {
            return Err(FrameError::InsideKernelImage);
        }
        if addr >= KERNEL_WINDOW_END {
            return Err(FrameError::AboveKernelLimit);
        }
        let mut list = self.list.lock();
        // SAFETY: addr just passed the bounds/alignment/overlap checks above.
        unsafe { self.push_locked(&mut list, addr) };
        Ok(())
    }

    /// 診断用のフリー/割り当て済みフレーム数。正当性の判断には使わない（§4.1）。
    pub fn counters(&self) -> (u64, u64) {
        let list = self.list.lock();
        (list.free_count, list.allocated_count)
    }
}

unsafe impl Send for FrameAllocator {}
unsafe impl Sync for FrameAllocator {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn alloc_then_free_round_trips_counters() {
        let alloc = FrameAllocator::new();
        let regions = [MemoryRegion {
            start: PhysAddr::new(0x10_0000),
            len: PAGE_SIZE * 4,
            usable: true,
        }];
        unsafe { alloc.init(&regions, 0, 0) };
        let (free0, used0) = alloc.counters();
        assert_eq!(free0, 4);
        assert_eq!(used0, 0);

        let frame = alloc.alloc_page().expect("frame available");
        let (free1, used1) = alloc.counters();
        assert_eq!(free1, 3);
        assert_eq!(used1, 1);

        alloc.free_page(frame, 0, 0).expect("free succeeds");
        let (free2, used2) = alloc.counters();
        assert_eq!(free2, free0);
        assert_eq!(used2, used0);
    }

    #[test_case]
    fn init_skips_kernel_image_overlap() {
        let alloc = FrameAllocator::new();
        let regions = [MemoryRegion {
            start: PhysAddr::new(0),
            len: PAGE_SIZE * 4,
            usable: true,
        }];
        unsafe { alloc.init(&regions, 0, PAGE_SIZE as u64 * 2) };
        let (free, _) = alloc.counters();
        assert_eq!(free, 2);
    }

    #[test_case]
    fn free_page_rejects_misaligned_address() {
        let alloc = FrameAllocator::new();
        let err = alloc.free_page(PhysAddr::new(1), 0, 0).unwrap_err();
        assert_eq!(err, FrameError::Misaligned);
    }
}
