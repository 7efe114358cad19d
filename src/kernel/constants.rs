// src/kernel/constants.rs
//! Kernel-wide address layout, table bounds, and fixed values
//!
//! These constants are the concrete numbers behind the execution substrate:
//! where the kernel window lives, how big a process table slot array is,
//! and how a FAT16 volume is structured on disk. Centralizing them here
//! means a single source of truth instead of the same magic number spelled
//! out at every call site.

/// Number of 4 KiB bytes in one physical page frame.
pub const PAGE_SIZE: usize = 4096;

/// Kernel high-half virtual base (§6).
pub const KERNEL_HIGH_HALF_BASE: u64 = 0xFFFF_8000_0000_0000;

/// End of the kernel's identity-mapped physical/virtual window (1 GiB span).
pub const KERNEL_WINDOW_END: u64 = 0xFFFF_8000_4000_0000;

/// Per-core kernel stack size (§6: 8 KiB, stacks grow down).
pub const CORE_STACK_SIZE: usize = 8 * 1024;

/// Per-core IST1 emergency stack size.
pub const CORE_IST1_STACK_SIZE: usize = 8 * 1024;

/// Canonical user-space load address (§6, matches `USER_PROGRAM_COUNTER`
/// in the original C implementation).
pub const USER_LOAD_ADDRESS: u64 = 0x0040_0000;

/// Default total user-space size granted to a freshly allocated process.
pub const DEFAULT_TOTAL_PROCESS_SIZE: usize = 64 * 1024;

/// RFLAGS value installed in a new process's interrupt frame: reserved
/// bit 1 set, interrupt flag set (interrupts enabled in user mode).
pub const PROC_RFLAGS: u64 = 0x202;

/// Maximum number of process-table slots (original `MAX_N_PROCESSES`).
pub const MAX_PROCESSES: usize = 128;

/// Maximum number of open files per process (original `MAX_N_FILES_PER_PROCESS`).
pub const MAX_FILES_PER_PROCESS: usize = 100;

/// Maximum number of logical cores this kernel is built to coordinate.
pub const MAX_CORES: usize = 4;

/// Per-process kernel stack size, heap-allocated at process creation time
/// (distinct from the per-core boot stacks in `CORE_STACK_SIZE`).
pub const PROCESS_KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Top of the canonical user stack region (original `USER_STACK_TOP`).
pub const USER_STACK_TOP: u64 = 0x0000_7000_0000_0000;

/// Compiled-in list of user programs loaded by name at boot (original
/// `processFileNameArray`: `{"SHELL.BIN", "USER1.BIN", "USER2.BIN"}`).
pub const STARTUP_PROGRAMS: [&str; 3] = ["SHELL.BIN", "USER1.BIN", "USER2.BIN"];

/// Code size, in 512-byte sectors, of each entry in `STARTUP_PROGRAMS` — a
/// startup image must fit in a single FAT16 cluster (original: 11 sectors
/// for every startup program).
pub const STARTUP_PROGRAM_CODE_SECTORS: [usize; 3] = [11, 11, 11];

/// Kernel heap start address, inside the identity-mapped kernel window.
pub const HEAP_START: u64 = KERNEL_HIGH_HALF_BASE + 0x0010_0000;
/// Kernel heap size.
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Target frequency of the programmable interval timer driving `TAG_TIMER_TICK`.
pub const TIMER_HZ: u32 = 100;

/// Event-wait tag reserved for "a process has exited; wake anyone waiting
/// on its pid" — negative so it can never collide with a real pid tag.
pub const TAG_PROCESS_EXIT: i64 = -2;
/// Event-wait tag for "a timer tick has occurred".
pub const TAG_TIMER_TICK: i64 = -3;
/// Event-wait tag for "a key is available in the keyboard queue".
pub const TAG_KEYBOARD: i64 = -4;

/// FAT16 volume and table-buffer bounds (original `fat16.h`).
pub mod fat16 {
    /// Bytes per disk sector.
    pub const SECTOR_SIZE: usize = 512;
    /// 8-byte short file name field width.
    pub const FILENAME_SIZE: usize = 8;
    /// 3-byte extension field width.
    pub const EXTENSION_SIZE: usize = 3;
    /// First byte of a directory entry marking it empty (never used).
    pub const ENTRY_EMPTY: u8 = 0x00;
    /// First byte of a directory entry marking it deleted.
    pub const ENTRY_DELETED: u8 = 0xE5;
    /// Directory-entry attribute byte identifying a long-file-name entry.
    pub const LONG_FILE_NAME_ATTRIBUTE: u8 = 0x0F;
    /// FAT16 cluster values at or above this mark end-of-chain.
    pub const LAST_CLUSTER_VALUE: u16 = 0xFFF7;
    /// Largest root directory this kernel will load into memory.
    pub const MAX_ROOT_DIR_ENTRIES: usize = 512;
    /// Largest FAT table (in sectors) this kernel will load into memory.
    pub const MAX_TABLE_SECTORS: usize = 256;
}
