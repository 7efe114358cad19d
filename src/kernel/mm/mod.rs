// src/kernel/mm/mod.rs
//! メモリ管理モジュール

pub mod paging;
pub mod allocator;
pub mod frame;
pub mod types;

pub use allocator::{LockedHeap, LinkedListAllocator};
pub use frame::{FrameAllocator, FrameError, MemoryRegion};
pub use paging::{AddressSpace, PagingError};
pub use types::{LayoutSize, PageFrameNumber, PhysAddr, VirtAddr};

use core::sync::atomic::{AtomicU64, Ordering};

static KERNEL_IMAGE_START: AtomicU64 = AtomicU64::new(0);
static KERNEL_IMAGE_END: AtomicU64 = AtomicU64::new(0);

/// ブート時に一度だけ、リンカスクリプトが報告するカーネルイメージの物理範囲を
/// 記録する。`FrameAllocator`/`paging::free_tree` がこの範囲を誤って解放の対象に
/// しないようにするため（§4.1）。
pub fn set_kernel_image_bounds(start: u64, end: u64) {
    KERNEL_IMAGE_START.store(start, Ordering::Release);
    KERNEL_IMAGE_END.store(end, Ordering::Release);
}

/// 現在記録されているカーネルイメージの物理範囲 `(start, end)`。
pub fn kernel_image_bounds() -> (u64, u64) {
    (
        KERNEL_IMAGE_START.load(Ordering::Acquire),
        KERNEL_IMAGE_END.load(Ordering::Acquire),
    )
}
