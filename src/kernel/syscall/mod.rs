// src/kernel/syscall/mod.rs
//! システムコールディスパッチテーブル（§4.5）
//!
//! 番号は安定。`arch::x86_64::syscall::syscall_entry` が `dispatch(num, a1, a2, a3)`
//! を呼ぶ。`fork`/`exec` だけは固定長スロット以上の情報が必要で、前者は
//! `arch::x86_64::syscall::current_fork_snapshot()` を、後者はユーザーバッファを
//! 直接読む。

use crate::arch::x86_64::syscall::current_fork_snapshot;
use crate::kernel::constants::{TAG_KEYBOARD, TAG_TIMER_TICK, USER_LOAD_ADDRESS};
use crate::kernel::core::CharDevice;
use crate::kernel::driver::keyboard::{scancode_to_ascii, SCANCODE_QUEUE};
use crate::kernel::driver::vga::{vga, VgaColor};
use crate::kernel::fs::{fat16, files};
use crate::kernel::mm::allocator::PHYS_FRAME_ALLOCATOR;
use crate::kernel::process::{
    exec_process, fork_process, terminate_process, wait_for_child, OpenFile, PROCESS_TABLE,
};
use crate::kernel::scheduler;

const SYS_PRINT_BUFFER: u64 = 0;
const SYS_SLEEP: u64 = 1;
const SYS_EXIT: u64 = 2;
const SYS_WAIT: u64 = 3;
const SYS_READ_CHAR_FROM_KEYBOARD: u64 = 4;
const SYS_GET_MEMORY_SIZE: u64 = 5;
const SYS_OPEN: u64 = 6;
const SYS_READ: u64 = 7;
const SYS_CLOSE: u64 = 8;
const SYS_FILE_SIZE: u64 = 9;
const SYS_FORK: u64 = 10;
const SYS_EXEC: u64 = 11;
const SYS_GET_ROOT_DIRECTORY: u64 = 12;

/// 現在のプロセスのユーザー範囲内に `[ptr, ptr+len)` が収まっているか検証する。
fn validate_user_range(ptr: u64, len: usize) -> bool {
    let core = crate::kernel::smp::core_index();
    let table = PROCESS_TABLE.lock();
    let Some(idx) = table.current_slot(core) else { return false };
    let total = table.slots[idx].total_user_size as u64;
    let end = USER_LOAD_ADDRESS + total;
    ptr >= USER_LOAD_ADDRESS && ptr.saturating_add(len as u64) <= end
}

fn current_open_file(fd: usize) -> Option<(usize, usize)> {
    let core = crate::kernel::smp::core_index();
    let table = PROCESS_TABLE.lock();
    let idx = table.current_slot(core)?;
    let of = table.slots[idx].open_files.get(fd).copied().flatten()?;
    Some((of.fcb_index, of.position))
}

fn set_open_file_position(fd: usize, position: usize) {
    let core = crate::kernel::smp::core_index();
    let mut table = PROCESS_TABLE.lock();
    if let Some(idx) = table.current_slot(core) {
        if let Some(slot) = table.slots[idx].open_files.get_mut(fd) {
            if let Some(of) = slot.as_mut() {
                of.position = position;
            }
        }
    }
}

fn allocate_fd(fcb_index: usize) -> Option<usize> {
    let core = crate::kernel::smp::core_index();
    let mut table = PROCESS_TABLE.lock();
    let idx = table.current_slot(core)?;
    let slots = &mut table.slots[idx].open_files;
    let fd = slots.iter().position(Option::is_none)?;
    slots[fd] = Some(OpenFile { fcb_index, position: 0 });
    Some(fd)
}

fn release_fd(fd: usize) -> Option<usize> {
    let core = crate::kernel::smp::core_index();
    let mut table = PROCESS_TABLE.lock();
    let idx = table.current_slot(core)?;
    let slot = table.slots[idx].open_files.get_mut(fd)?;
    slot.take().map(|of| of.fcb_index)
}

fn sys_print_buffer(ptr: u64, len: u64, color: u64) -> i64 {
    let len = len as usize;
    if !validate_user_range(ptr, len) {
        return -1;
    }
    // SAFETY: validate_user_range confirmed [ptr, ptr+len) lies inside the
    // current process's mapped user range; the process's page tables are
    // still loaded, so this slice is readable from ring 0.
    let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, len) };
    let mut screen = vga().lock();
    screen.set_color(VgaColor::from_raw(color as u8));
    for &b in bytes {
        let _ = screen.write_byte(b);
    }
    0
}

fn sys_sleep(ticks: u64) -> i64 {
    let core = crate::kernel::smp::core_index();
    let start = scheduler::ticks(core);
    while scheduler::ticks(core).saturating_sub(start) < ticks {
        scheduler::sleep(TAG_TIMER_TICK);
    }
    0
}

fn sys_exit(code: u64) -> ! {
    terminate_process(code as i32)
}

fn sys_wait(pid: u64) -> i64 {
    wait_for_child(pid)
}

fn sys_read_char_from_keyboard() -> i64 {
    loop {
        let popped = SCANCODE_QUEUE.lock().pop();
        match popped {
            Some(scancode) => {
                if let Some(ascii) = scancode_to_ascii(scancode) {
                    return ascii as i64;
                }
                // key release or unmapped scancode: keep draining
            }
            None => scheduler::sleep(TAG_KEYBOARD),
        }
    }
}

fn sys_get_memory_size() -> i64 {
    let (free, _) = PHYS_FRAME_ALLOCATOR.counters();
    (free * crate::kernel::constants::PAGE_SIZE as u64) as i64
}

fn sys_open(name_ptr: u64, name_len: u64) -> i64 {
    let name_len = name_len as usize;
    if name_len > 16 || !validate_user_range(name_ptr, name_len) {
        return -1;
    }
    // SAFETY: see sys_print_buffer.
    let bytes = unsafe { core::slice::from_raw_parts(name_ptr as *const u8, name_len) };
    let Ok(name) = core::str::from_utf8(bytes) else { return -1 };
    let Ok(fcb_index) = files::open(name) else { return -1 };
    match allocate_fd(fcb_index) {
        Some(fd) => fd as i64,
        None => {
            files::close(fcb_index);
            -1
        }
    }
}

fn sys_read(fd: u64, buf_ptr: u64, size: u64) -> i64 {
    let size = size as usize;
    if !validate_user_range(buf_ptr, size) {
        return -1;
    }
    let Some((fcb_index, position)) = current_open_file(fd as usize) else { return -1 };
    // SAFETY: see sys_print_buffer.
    let buf = unsafe { core::slice::from_raw_parts_mut(buf_ptr as *mut u8, size) };
    match files::read(fcb_index, position, buf) {
        Ok(n) => {
            set_open_file_position(fd as usize, position + n);
            n as i64
        }
        Err(_) => -1,
    }
}

fn sys_close(fd: u64) -> i64 {
    match release_fd(fd as usize) {
        Some(fcb_index) => {
            files::close(fcb_index);
            0
        }
        None => -1,
    }
}

fn sys_file_size(fd: u64) -> i64 {
    match current_open_file(fd as usize).and_then(|(fcb, _)| files::file_size(fcb)) {
        Some(size) => size as i64,
        None => -1,
    }
}

fn sys_fork() -> i64 {
    let (rsp, rbp, rip, rflags) = current_fork_snapshot();
    let core = crate::kernel::smp::core_index();
    let current = {
        let table = PROCESS_TABLE.lock();
        table.current_slot(core).map(|idx| table.slots[idx].frame)
    };
    let Some(mut frame) = current else { return -1 };
    frame.rsp = rsp;
    frame.rbp = rbp;
    frame.rip = rip;
    frame.rflags = rflags;
    fork_process(&frame)
}

fn sys_exec(name_ptr: u64, name_len: u64) -> i64 {
    let name_len = name_len as usize;
    if name_len > 16 || !validate_user_range(name_ptr, name_len) {
        terminate_process(-1);
    }
    // SAFETY: see sys_print_buffer.
    let bytes = unsafe { core::slice::from_raw_parts(name_ptr as *const u8, name_len) };
    let Ok(name) = core::str::from_utf8(bytes) else { terminate_process(-1) };
    let Ok(fcb_index) = files::open(name) else { terminate_process(-1) };
    let Some(size) = files::file_size(fcb_index) else {
        files::close(fcb_index);
        terminate_process(-1)
    };

    // ヒープに確保する — カーネルスタックに乗せるには大きすぎ得る。
    let mut image = alloc::vec![0u8; size as usize];
    let read = files::read(fcb_index, 0, &mut image).unwrap_or(0);
    files::close(fcb_index);

    exec_process(&image[..read], read)
}

fn sys_get_root_directory(buf_ptr: u64, buf_len: u64) -> i64 {
    let buf_len = buf_len as usize;
    let entry_bytes = core::mem::size_of::<fat16::DirEntry>();
    if !validate_user_range(buf_ptr, buf_len) {
        return -1;
    }
    let capacity = buf_len / entry_bytes;
    // SAFETY: see sys_print_buffer; DirEntry has no padding-sensitive invariants.
    let out = unsafe {
        core::slice::from_raw_parts_mut(buf_ptr as *mut fat16::DirEntry, capacity)
    };
    fat16::copy_root_directory(out) as i64
}

/// すべてのシステムコールの入口。`num` が未知なら -1（`ENOSYS` 相当）を返す。
#[unsafe(no_mangle)]
pub extern "C" fn dispatch(num: u64, a1: u64, a2: u64, a3: u64) -> i64 {
    match num {
        SYS_PRINT_BUFFER => sys_print_buffer(a1, a2, a3),
        SYS_SLEEP => sys_sleep(a1),
        SYS_EXIT => sys_exit(a1),
        SYS_WAIT => sys_wait(a1),
        SYS_READ_CHAR_FROM_KEYBOARD => sys_read_char_from_keyboard(),
        SYS_GET_MEMORY_SIZE => sys_get_memory_size(),
        SYS_OPEN => sys_open(a1, a2),
        SYS_READ => sys_read(a1, a2, a3),
        SYS_CLOSE => sys_close(a1),
        SYS_FILE_SIZE => sys_file_size(a1),
        SYS_FORK => sys_fork(),
        SYS_EXEC => sys_exec(a1, a2),
        SYS_GET_ROOT_DIRECTORY => sys_get_root_directory(a1, a2),
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn dispatch_rejects_unknown_syscall_number() {
        assert_eq!(dispatch(255, 0, 0, 0), -1);
    }

    #[test_case]
    fn dispatch_routes_get_memory_size_to_the_frame_allocator() {
        // Doesn't require a live process table: sys_get_memory_size only
        // reads PHYS_FRAME_ALLOCATOR's counters, which is safe before init.
        let direct = sys_get_memory_size();
        let via_dispatch = dispatch(SYS_GET_MEMORY_SIZE, 0, 0, 0);
        assert_eq!(direct, via_dispatch);
    }
}
