// src/kernel/mm/paging.rs
//! アドレス空間マネージャ
//!
//! PML4 に根ざした 4 レベルページテーブルを構築・編集する。カーネルの物理窓は
//! 恒等マッピングされているため、どのテーブルも `phys_to_virt` で素直に辿れる。
//! プロセススワップは新しい PML4 をロードするだけでよい — 共有カーネルマッピングが
//! どのアドレス空間からも同じ高位半分を指すことを保証する（§4.2）。

use x86_64::structures::paging::{PageTable, PageTableFlags, PageTableIndex};
use x86_64::{PhysAddr as X86PhysAddr, VirtAddr as X86VirtAddr};

use super::frame::{FrameError, FrameAllocator};
use super::types::{PhysAddr, VirtAddr};
use crate::kernel::constants::{KERNEL_HIGH_HALF_BASE, KERNEL_WINDOW_END, PAGE_SIZE};

/// アドレス空間操作のエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// 物理アドレスが 4 KiB に揃っていない
    MisalignedPhys,
    /// 終端が開始より前にある範囲
    NegativeRange,
    /// 範囲がカーネルウィンドウの上限を超えている
    AboveKernelLimit,
    /// 最終 PT エントリが既に present
    AlreadyMapped,
    /// 中間テーブルまたはフレームの確保に失敗
    Alloc,
}

impl From<FrameError> for PagingError {
    fn from(_: FrameError) -> Self {
        PagingError::Alloc
    }
}

#[inline]
fn phys_to_virt(phys: u64) -> u64 {
    KERNEL_HIGH_HALF_BASE + phys
}

#[inline]
unsafe fn table_at<'a>(phys: u64) -> &'a mut PageTable {
    // SAFETY: phys is the physical address of a frame allocated as a page
    // table by this module; the kernel window identity-maps it at +KERNEL_HIGH_HALF_BASE.
    unsafe { &mut *(phys_to_virt(phys) as *mut PageTable) }
}

fn table_indices(addr: u64) -> (PageTableIndex, PageTableIndex, PageTableIndex, PageTableIndex) {
    let v = X86VirtAddr::new(addr);
    (v.p4_index(), v.p3_index(), v.p2_index(), v.p1_index())
}

/// PML4 フレームの薄いラッパー。プロセススロットが所有する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    pub pml4: PhysAddr,
}

/// 中間レベルのテーブルをフレームアロケータから確保し、ゼロ初期化して
/// 親テーブルの該当エントリに書き込む。既に present なら既存のものを返す。
fn ensure_next_level(
    allocator: &FrameAllocator,
    parent: &mut PageTable,
    index: PageTableIndex,
    flags: PageTableFlags,
) -> Result<u64, PagingError> {
    let entry = &mut parent[index];
    if entry.is_unused() {
        let frame = allocator.alloc_page()?;
        // SAFETY: frame was just allocated and is exclusively owned here.
        unsafe { core::ptr::write_bytes(phys_to_virt(frame.as_u64()) as *mut u8, 0, PAGE_SIZE) };
        entry.set_addr(X86PhysAddr::new(frame.as_u64()), flags);
        Ok(frame.as_u64())
    } else {
        // Upgrade flags (e.g. user bit) without clobbering the address.
        let addr = entry.addr().as_u64();
        let merged = entry.flags() | flags;
        entry.set_addr(X86PhysAddr::new(addr), merged);
        Ok(addr)
    }
}

/// カーネルアドレス空間を構築する: PML4 を確保し、カーネルの物理ウィンドウ全体を
/// 高位半分へ present+writable でマップする。
pub fn setup_kernel_space(allocator: &FrameAllocator) -> Result<AddressSpace, PagingError> {
    let pml4_frame = allocator.alloc_page()?;
    // SAFETY: freshly allocated, exclusively owned.
    unsafe { core::ptr::write_bytes(phys_to_virt(pml4_frame.as_u64()) as *mut u8, 0, PAGE_SIZE) };

    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    let mut phys = 0u64;
    while phys < KERNEL_WINDOW_END {
        map_range_raw(
            allocator,
            pml4_frame.as_u64(),
            KERNEL_HIGH_HALF_BASE + phys,
            KERNEL_HIGH_HALF_BASE + phys + PAGE_SIZE as u64,
            phys,
            flags,
            true,
        )?;
        phys += PAGE_SIZE as u64;
    }

    Ok(AddressSpace {
        pml4: PhysAddr::new(pml4_frame.as_u64() as usize),
    })
}

/// `[v_start, v_end)` を `p_start` から始まる連続物理フレームへマップする。
/// 中間テーブルはオンデマンドで確保される。`allow_remap` が false なら、最終 PT
/// エントリが既に present の場合に失敗する。
pub fn map_range(
    allocator: &FrameAllocator,
    root: AddressSpace,
    v_start: VirtAddr,
    v_end: VirtAddr,
    p_start: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), PagingError> {
    map_range_raw(
        allocator,
        root.pml4.as_u64(),
        v_start.as_u64(),
        v_end.as_u64(),
        p_start.as_u64(),
        flags,
        false,
    )
}

fn map_range_raw(
    allocator: &FrameAllocator,
    pml4_phys: u64,
    v_start: u64,
    v_end: u64,
    p_start: u64,
    flags: PageTableFlags,
    allow_remap: bool,
) -> Result<(), PagingError> {
    if p_start % PAGE_SIZE as u64 != 0 {
        return Err(PagingError::MisalignedPhys);
    }
    if v_end < v_start {
        return Err(PagingError::NegativeRange);
    }
    if v_end > KERNEL_WINDOW_END && v_start >= KERNEL_HIGH_HALF_BASE {
        return Err(PagingError::AboveKernelLimit);
    }

    let mut v = v_start;
    let mut p = p_start;
    let intermediate_flags = PageTableFlags::PRESENT
        | PageTableFlags::WRITABLE
        | (flags & PageTableFlags::USER_ACCESSIBLE);

    while v < v_end {
        let (p4i, p3i, p2i, p1i) = table_indices(v);
        // SAFETY: pml4_phys is a table frame owned by this address space.
        let pml4 = unsafe { table_at(pml4_phys) };
        let pdpt_phys = ensure_next_level(allocator, pml4, p4i, intermediate_flags)?;
        let pdpt = unsafe { table_at(pdpt_phys) };
        let pd_phys = ensure_next_level(allocator, pdpt, p3i, intermediate_flags)?;
        let pd = unsafe { table_at(pd_phys) };
        let pt_phys = ensure_next_level(allocator, pd, p2i, intermediate_flags)?;
        let pt = unsafe { table_at(pt_phys) };

        let entry = &mut pt[p1i];
        if !allow_remap && !entry.is_unused() {
            return Err(PagingError::AlreadyMapped);
        }
        entry.set_addr(X86PhysAddr::new(p), flags | PageTableFlags::PRESENT);

        v += PAGE_SIZE as u64;
        p += PAGE_SIZE as u64;
    }
    Ok(())
}

/// `[v_start, v_end)` 内の present な PT エントリをクリアし、そのバッキングフレームを解放する。
pub fn unmap_range(
    allocator: &FrameAllocator,
    root: AddressSpace,
    v_start: VirtAddr,
    v_end: VirtAddr,
    kernel_image_start: u64,
    kernel_image_end: u64,
) -> Result<(), PagingError> {
    if v_end.as_u64() < v_start.as_u64() {
        return Err(PagingError::NegativeRange);
    }
    let mut v = v_start.as_u64();
    while v < v_end.as_u64() {
        let (p4i, p3i, p2i, p1i) = table_indices(v);
        // SAFETY: root.pml4 owns this tree.
        let pml4 = unsafe { table_at(root.pml4.as_u64()) };
        if !pml4[p4i].is_unused() {
            let pdpt = unsafe { table_at(pml4[p4i].addr().as_u64()) };
            if !pdpt[p3i].is_unused() {
                let pd = unsafe { table_at(pdpt[p3i].addr().as_u64()) };
                if !pd[p2i].is_unused() {
                    let pt = unsafe { table_at(pd[p2i].addr().as_u64()) };
                    let entry = &mut pt[p1i];
                    if !entry.is_unused() {
                        let frame = PhysAddr::new(entry.addr().as_u64() as usize);
                        entry.set_unused();
                        let _ = allocator.free_page(frame, kernel_image_start, kernel_image_end);
                    }
                }
            }
        }
        v += PAGE_SIZE as u64;
    }
    Ok(())
}

/// ユーザー範囲をアンマップし、その後 PT → PD → PDPT → PML4 の順にテーブル自体の
/// フレームを解放する（§4.2）。
pub fn free_tree(
    allocator: &FrameAllocator,
    root: AddressSpace,
    total_user_size: usize,
    kernel_image_start: u64,
    kernel_image_end: u64,
) -> Result<(), PagingError> {
    use crate::kernel::constants::USER_LOAD_ADDRESS;

    unmap_range(
        allocator,
        root,
        VirtAddr::new(USER_LOAD_ADDRESS as usize),
        VirtAddr::new((USER_LOAD_ADDRESS as usize) + total_user_size),
        kernel_image_start,
        kernel_image_end,
    )?;

    // Walk only the low half (user range) PML4 entries; the shared kernel
    // half's tables are never freed on process exit (§3 ownership invariant).
    let pml4 = unsafe { table_at(root.pml4.as_u64()) };
    for p4i in 0..256u16 {
        let idx = PageTableIndex::new(p4i);
        if pml4[idx].is_unused() {
            continue;
        }
        let pdpt_phys = pml4[idx].addr().as_u64();
        let pdpt = unsafe { table_at(pdpt_phys) };
        for p3i in 0..512u16 {
            let idx3 = PageTableIndex::new(p3i);
            if pdpt[idx3].is_unused() {
                continue;
            }
            let pd_phys = pdpt[idx3].addr().as_u64();
            let pd = unsafe { table_at(pd_phys) };
            for p2i in 0..512u16 {
                let idx2 = PageTableIndex::new(p2i);
                if pd[idx2].is_unused() {
                    continue;
                }
                let pt_phys = pd[idx2].addr().as_u64();
                let _ = allocator.free_page(
                    PhysAddr::new(pt_phys as usize),
                    kernel_image_start,
                    kernel_image_end,
                );
                pd[idx2].set_unused();
            }
            let _ = allocator.free_page(
                PhysAddr::new(pd_phys as usize),
                kernel_image_start,
                kernel_image_end,
            );
            pdpt[idx3].set_unused();
        }
        let _ = allocator.free_page(
            PhysAddr::new(pdpt_phys as usize),
            kernel_image_start,
            kernel_image_end,
        );
        pml4[idx].set_unused();
    }
    let _ = allocator.free_page(root.pml4, kernel_image_start, kernel_image_end);
    Ok(())
}

/// 新しいプロセスのユーザー範囲を確保し、`image_bytes` の先頭 `code_size` バイトを
/// コピーする。PML4 のユーザー半分のエントリは user-accessible とマークされる。
pub fn init_user_space(
    allocator: &FrameAllocator,
    root: AddressSpace,
    image_bytes: &[u8],
    code_size: usize,
    total_size: usize,
) -> Result<(), PagingError> {
    use crate::kernel::constants::USER_LOAD_ADDRESS;

    let n_pages = total_size.div_ceil(PAGE_SIZE);
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    let mut remaining = code_size;
    for i in 0..n_pages {
        let frame = allocator.alloc_page()?;
        let virt = phys_to_virt(frame.as_u64());
        // SAFETY: frame was just allocated and is exclusively owned here.
        unsafe { core::ptr::write_bytes(virt as *mut u8, 0, PAGE_SIZE) };
        let copy_len = remaining.min(PAGE_SIZE);
        if copy_len > 0 {
            let src_off = i * PAGE_SIZE;
            // SAFETY: copy_len was clamped to the image's remaining bytes.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    image_bytes.as_ptr().add(src_off),
                    virt as *mut u8,
                    copy_len,
                );
            }
            remaining -= copy_len;
        }

        let v = USER_LOAD_ADDRESS + (i * PAGE_SIZE) as u64;
        map_range_raw(
            allocator,
            root.pml4.as_u64(),
            v,
            v + PAGE_SIZE as u64,
            frame.as_u64(),
            flags,
            false,
        )?;
    }
    Ok(())
}

/// 既存のユーザー範囲を再利用したまま新しいイメージを書き込む（exec、§4.3）。
/// 新しいフレームは確保せず、既に present なページの内容だけをゼロ化して
/// `image_bytes` を上書きする。`total_size` は元のプロセス生成時と同じでなければ
/// ならない — ページが既にそのぶんだけ present であることを前提にしている。
pub fn reload_user_image(
    root: AddressSpace,
    image_bytes: &[u8],
    code_size: usize,
    total_size: usize,
) -> Result<(), PagingError> {
    use crate::kernel::constants::USER_LOAD_ADDRESS;

    let n_pages = total_size.div_ceil(PAGE_SIZE);
    let mut remaining = code_size;

    for i in 0..n_pages {
        let v = USER_LOAD_ADDRESS + (i * PAGE_SIZE) as u64;
        let (p4i, p3i, p2i, p1i) = table_indices(v);
        // SAFETY: root owns a tree built by init_user_space with this total_size.
        let pml4 = unsafe { table_at(root.pml4.as_u64()) };
        if pml4[p4i].is_unused() {
            return Err(PagingError::Alloc);
        }
        let pdpt = unsafe { table_at(pml4[p4i].addr().as_u64()) };
        if pdpt[p3i].is_unused() {
            return Err(PagingError::Alloc);
        }
        let pd = unsafe { table_at(pdpt[p3i].addr().as_u64()) };
        if pd[p2i].is_unused() {
            return Err(PagingError::Alloc);
        }
        let pt = unsafe { table_at(pd[p2i].addr().as_u64()) };
        let entry = &pt[p1i];
        if entry.is_unused() {
            return Err(PagingError::Alloc);
        }
        let frame_phys = entry.addr().as_u64();
        let virt = phys_to_virt(frame_phys);

        // SAFETY: frame_phys is a page owned by this process's own address
        // space, exclusively reachable through the kernel's identity window.
        unsafe { core::ptr::write_bytes(virt as *mut u8, 0, PAGE_SIZE) };
        let copy_len = remaining.min(PAGE_SIZE);
        if copy_len > 0 {
            let src_off = i * PAGE_SIZE;
            // SAFETY: copy_len was clamped to the image's remaining bytes.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    image_bytes.as_ptr().add(src_off),
                    virt as *mut u8,
                    copy_len,
                );
            }
            remaining -= copy_len;
        }
    }
    Ok(())
}

/// 新しいプロセス用の PML4 を確保し、カーネル半分（エントリ256..512）だけ
/// `kernel_space` から引き写す。ユーザー半分は空のまま返す。
pub fn new_process_address_space(
    allocator: &FrameAllocator,
    kernel_space: AddressSpace,
) -> Result<AddressSpace, PagingError> {
    let pml4_frame = allocator.alloc_page()?;
    unsafe { core::ptr::write_bytes(phys_to_virt(pml4_frame.as_u64()) as *mut u8, 0, PAGE_SIZE) };

    let new_pml4 = unsafe { table_at(pml4_frame.as_u64()) };
    let kernel_pml4 = unsafe { table_at(kernel_space.pml4.as_u64()) };
    for i in 256u16..512 {
        let idx = PageTableIndex::new(i);
        new_pml4[idx] = kernel_pml4[idx].clone();
    }

    Ok(AddressSpace { pml4: PhysAddr::new(pml4_frame.as_u64() as usize) })
}

/// `src` のユーザー範囲を `dst` へページ単位で複製する（fork の親→子コピー）。
pub fn copy_user_space(
    allocator: &FrameAllocator,
    dst: AddressSpace,
    src: AddressSpace,
    image_vaddr: VirtAddr,
    total_size: usize,
) -> Result<(), PagingError> {
    let n_pages = total_size.div_ceil(PAGE_SIZE);
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    for i in 0..n_pages {
        let v = image_vaddr.as_u64() + (i * PAGE_SIZE) as u64;
        let (p4i, p3i, p2i, p1i) = table_indices(v);
        let src_pml4 = unsafe { table_at(src.pml4.as_u64()) };
        if src_pml4[p4i].is_unused() {
            continue;
        }
        let src_pdpt = unsafe { table_at(src_pml4[p4i].addr().as_u64()) };
        if src_pdpt[p3i].is_unused() {
            continue;
        }
        let src_pd = unsafe { table_at(src_pdpt[p3i].addr().as_u64()) };
        if src_pd[p2i].is_unused() {
            continue;
        }
        let src_pt = unsafe { table_at(src_pd[p2i].addr().as_u64()) };
        if src_pt[p1i].is_unused() {
            continue;
        }
        let src_frame_phys = src_pt[p1i].addr().as_u64();

        let dst_frame = allocator.alloc_page()?;
        // SAFETY: both source frame and new frame are within the kernel's
        // identity-mapped window, and dst_frame is exclusively owned here.
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys_to_virt(src_frame_phys) as *const u8,
                phys_to_virt(dst_frame.as_u64()) as *mut u8,
                PAGE_SIZE,
            );
        }

        map_range_raw(
            allocator,
            dst.pml4.as_u64(),
            v,
            v + PAGE_SIZE as u64,
            dst_frame.as_u64(),
            flags,
            false,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mm::frame::MemoryRegion;

    fn test_allocator() -> FrameAllocator {
        let alloc = FrameAllocator::new();
        let regions = [MemoryRegion {
            start: PhysAddr::new(0x20_0000),
            len: PAGE_SIZE * 64,
            usable: true,
        }];
        unsafe { alloc.init(&regions, 0, 0) };
        alloc
    }

    #[test_case]
    fn map_then_unmap_frees_frames() {
        let alloc = test_allocator();
        let pml4 = alloc.alloc_page().unwrap();
        unsafe { core::ptr::write_bytes(phys_to_virt(pml4.as_u64()) as *mut u8, 0, PAGE_SIZE) };
        let root = AddressSpace { pml4 };

        let (free_before, _) = alloc.counters();
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
        let data_frame = alloc.alloc_page().unwrap();
        map_range(
            &alloc,
            root,
            VirtAddr::new(0x0040_0000),
            VirtAddr::new(0x0040_1000),
            PhysAddr::new(data_frame.as_u64() as usize),
            flags,
        )
        .expect("map succeeds");

        unmap_range(
            &alloc,
            root,
            VirtAddr::new(0x0040_0000),
            VirtAddr::new(0x0040_1000),
            0,
            0,
        )
        .expect("unmap succeeds");

        let (free_after, _) = alloc.counters();
        assert_eq!(free_after, free_before);
    }

    #[test_case]
    fn map_range_rejects_remap() {
        let alloc = test_allocator();
        let pml4 = alloc.alloc_page().unwrap();
        unsafe { core::ptr::write_bytes(phys_to_virt(pml4.as_u64()) as *mut u8, 0, PAGE_SIZE) };
        let root = AddressSpace { pml4 };
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        let frame = alloc.alloc_page().unwrap();
        map_range(
            &alloc,
            root,
            VirtAddr::new(0x0040_0000),
            VirtAddr::new(0x0040_1000),
            PhysAddr::new(frame.as_u64() as usize),
            flags,
        )
        .unwrap();
        let err = map_range(
            &alloc,
            root,
            VirtAddr::new(0x0040_0000),
            VirtAddr::new(0x0040_1000),
            PhysAddr::new(frame.as_u64() as usize),
            flags,
        )
        .unwrap_err();
        assert_eq!(err, PagingError::AlreadyMapped);
    }
}
