// src/kernel/fs/files.rs
//! グローバル File Control Block テーブル（§3, §4.7）
//!
//! 同じファイルを複数プロセスが開いても FCB は1つだけ共有される — ルート
//! ディレクトリのインデックスで同一性を判定する。プロセス側の `OpenFile`
//! （`kernel::process::OpenFile`）がこのテーブルのインデックスと seek 位置を持つ。

use crate::kernel::constants::MAX_FILES_PER_PROCESS;
use crate::kernel::fs::fat16::{self, Fat16Error};
use spin::Mutex;

/// プロセス数 × プロセスあたり上限、という上限に合わせた総FCB数。
const MAX_OPEN_FILES: usize = MAX_FILES_PER_PROCESS * 4;

#[derive(Debug, Clone, Copy)]
struct Fcb {
    root_index: usize,
    starting_cluster: u16,
    size: u32,
    ref_count: u32,
}

struct FcbTable {
    slots: [Option<Fcb>; MAX_OPEN_FILES],
}

static FCB_TABLE: Mutex<FcbTable> = Mutex::new(FcbTable {
    slots: [None; MAX_OPEN_FILES],
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    NotFound,
    NoFreeSlots,
}

/// `name` を開く。既に誰かが開いていれば（同じルートディレクトリエントリ）
/// 参照カウントを1つ増やして同じ FCB スロットを返す。そうでなければ空きスロットに
/// 新しい FCB を作る（§4.7 ファイル記述子契約）。
pub fn open(name: &str) -> Result<usize, OpenError> {
    let root_index = fat16::find_entry(name).map_err(|_| OpenError::NotFound)?;
    let entry = fat16::entry(root_index);

    let mut table = FCB_TABLE.lock();
    if let Some(idx) = table
        .slots
        .iter()
        .position(|s| matches!(s, Some(fcb) if fcb.root_index == root_index))
    {
        table.slots[idx].as_mut().unwrap().ref_count += 1;
        return Ok(idx);
    }

    let free = table.slots.iter().position(Option::is_none).ok_or(OpenError::NoFreeSlots)?;
    table.slots[free] = Some(Fcb {
        root_index,
        starting_cluster: entry.starting_cluster,
        size: entry.size,
        ref_count: 1,
    });
    Ok(free)
}

/// FCB の参照カウントを1つ減らす。0になってもスロットはそのまま残し、
/// `ref_count == 0` を「空き」として扱う（次の `open` が再利用する）。
pub fn close(fcb_index: usize) {
    let mut table = FCB_TABLE.lock();
    if let Some(fcb) = table.slots[fcb_index].as_mut() {
        fcb.ref_count = fcb.ref_count.saturating_sub(1);
        if fcb.ref_count == 0 {
            table.slots[fcb_index] = None;
        }
    }
}

pub fn file_size(fcb_index: usize) -> Option<u32> {
    FCB_TABLE.lock().slots[fcb_index].map(|fcb| fcb.size)
}

pub fn bump_ref_count(fcb_index: usize) {
    if let Some(fcb) = FCB_TABLE.lock().slots[fcb_index].as_mut() {
        fcb.ref_count += 1;
    }
}

/// `position` から `buf` を埋める。ファイルの終端を超えた分は切り詰める。
pub fn read(fcb_index: usize, position: usize, buf: &mut [u8]) -> Result<usize, Fat16Error> {
    let fcb = FCB_TABLE.lock().slots[fcb_index].ok_or(Fat16Error::NotFound)?;
    fat16::read_cluster_data(fcb.starting_cluster, fcb.size, position as u32, buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercises the ref-counting contract directly on the FCB table, without
    // going through fat16::find_entry (which needs a mounted disk).
    fn install_fcb(root_index: usize) -> usize {
        let mut table = FCB_TABLE.lock();
        let free = table.slots.iter().position(Option::is_none).expect("free slot");
        table.slots[free] = Some(Fcb { root_index, starting_cluster: 2, size: 100, ref_count: 1 });
        free
    }

    #[test_case]
    fn bump_ref_count_then_close_keeps_slot_alive_until_zero() {
        let idx = install_fcb(9001);
        bump_ref_count(idx);
        assert_eq!(file_size(idx), Some(100));

        close(idx);
        // one bump + the initial open-equivalent ref_count of 1 means two
        // references are outstanding; the slot must survive one close.
        assert_eq!(file_size(idx), Some(100));

        close(idx);
        assert_eq!(file_size(idx), None);
    }

    #[test_case]
    fn close_on_unknown_index_is_a_no_op() {
        let idx = install_fcb(9002);
        close(idx);
        close(idx); // slot already freed; must not panic or underflow
        assert_eq!(file_size(idx), None);
    }
}
