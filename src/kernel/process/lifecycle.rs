// src/kernel/process/lifecycle.rs
//! プロセスのライフサイクル操作 — `kernel::scheduler` の薄いラッパー
//!
//! ここはアドレス空間やコンテキストスイッチの実際のメカニズムには触れない。
//! syscall ディスパッチから見た「プロセスを作る/複製する/置き換える/終える」
//! という語彙を提供するだけで、実装は全て `scheduler` モジュールに委ねる。

use crate::kernel::process::{ProcessId, UserFrame};
use crate::kernel::scheduler::{self, SchedulerError};

/// 起動時の組み込みイメージからプロセスを1つ生成する。`parent` は通常 `None`
/// （init プロセス）で、ユーザーからの `fork`/`exec` を経ない唯一の生成経路。
pub fn spawn_initial_process(
    image: &[u8],
    code_size: usize,
    total_size: usize,
) -> Result<ProcessId, SchedulerError> {
    scheduler::allocate_process(image, code_size, total_size, None)
}

/// 現在のプロセスを複製する。`parent_frame` は syscall 入口で捕捉された、
/// `fork` 呼び出し時点のユーザーレジスタ一式。子の pid、失敗時は -1。
pub fn fork_process(parent_frame: &UserFrame) -> i64 {
    scheduler::fork(parent_frame)
}

/// 現在のプロセスのイメージを `image` で置き換える。成功すれば 0 を返して
/// ユーザーモードへ戻る準備が整う。失敗すればそのままプロセスを終了させ、
/// この関数自体は戻らない（§4.3: 「exec は失敗すると終了する」）。
pub fn exec_process(image: &[u8], code_size: usize) -> i64 {
    match scheduler::exec_current(image, code_size) {
        Ok(()) => 0,
        Err(_) => scheduler::exit_current(-1),
    }
}

/// 現在のプロセスを終了コード `code` で終了させる。戻らない。
pub fn terminate_process(code: i32) -> ! {
    scheduler::exit_current(code)
}

/// `pid` が killed になるのを待って回収する。まだ存在しなければ -1、
/// 回収できれば終了コード。
pub fn wait_for_child(pid: u64) -> i64 {
    scheduler::wait(pid)
}
