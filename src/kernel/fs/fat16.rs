// src/kernel/fs/fat16.rs
//! 読み取り専用 FAT16 ファイルシステム層（§4.7）
//!
//! BIOS パラメータブロックをセクタ0から読み、ルートディレクトリと FAT テーブル
//! 全体を一度だけメモリへ読み込む。書き込みはサポートしない。

use crate::kernel::constants::fat16::{
    ENTRY_DELETED, ENTRY_EMPTY, EXTENSION_SIZE, FILENAME_SIZE, LAST_CLUSTER_VALUE,
    LONG_FILE_NAME_ATTRIBUTE, MAX_ROOT_DIR_ENTRIES, MAX_TABLE_SECTORS, SECTOR_SIZE,
};
use crate::kernel::driver::disk;
use spin::Once;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fat16Error {
    BadSignature,
    Disk,
    NotFound,
    TooManyEntries,
    TableTooLarge,
    ClusterOverflow,
    InvalidClusterLink,
    BufferOverrun,
}

/// セクタ0の BIOS パラメータブロックのうち、読み出し層が必要とするフィールドだけ。
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct BiosParameterBlock {
    _jmp: [u8; 3],
    _oem: [u8; 8],
    bytes_per_sector: u16,
    sectors_per_cluster: u8,
    reserved_sectors: u16,
    num_fats: u8,
    root_entry_count: u16,
    _total_sectors_16: u16,
    _media: u8,
    sectors_per_fat: u16,
    _sectors_per_track: u16,
    _num_heads: u16,
    _hidden_sectors: u32,
    _total_sectors_32: u32,
    _drive_number: u8,
    _reserved1: u8,
    _boot_signature: u8,
    _volume_id: u32,
    _volume_label: [u8; 11],
    _fs_type: [u8; 8],
}

const _: () = assert!(core::mem::size_of::<BiosParameterBlock>() <= SECTOR_SIZE);

/// 32バイトのディレクトリエントリ（`biosParameterBlock`/`fat16DirEntry` と同じ
/// 並び、§6）。
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct DirEntry {
    pub name: [u8; FILENAME_SIZE],
    pub extension: [u8; EXTENSION_SIZE],
    pub attributes: u8,
    _reserved: [u8; 10],
    _time: u16,
    _date: u16,
    pub starting_cluster: u16,
    pub size: u32,
}

struct Geometry {
    sectors_per_cluster: u32,
    reserved_sectors: u32,
    num_fats: u32,
    sectors_per_fat: u32,
    root_dir_sectors: u32,
    root_dir_first_sector: u32,
    cluster_size: u32,
}

impl Geometry {
    fn first_data_sector(&self) -> u32 {
        self.reserved_sectors + self.num_fats * self.sectors_per_fat + self.root_dir_sectors
    }

    fn sector_of_cluster(&self, cluster: u16) -> u32 {
        self.first_data_sector() + (cluster as u32 - 2) * self.sectors_per_cluster
    }
}

struct Fat16Volume {
    geometry: Geometry,
    root: [DirEntry; MAX_ROOT_DIR_ENTRIES],
    root_count: usize,
    table: [u8; MAX_TABLE_SECTORS * SECTOR_SIZE],
}

unsafe impl Send for Fat16Volume {}
unsafe impl Sync for Fat16Volume {}

static VOLUME: Once<Fat16Volume> = Once::new();

fn read_sector(lba: u32, buf: &mut [u8]) -> Result<(), Fat16Error> {
    disk::read_sectors(lba, buf).map_err(|_| Fat16Error::Disk)
}

/// セクタ0の BPB を読み、ルートディレクトリと FAT テーブルをメモリに載せる。
/// ブート時に一度だけ呼ぶ。
pub fn init() -> Result<(), Fat16Error> {
    let mut sector0 = [0u8; SECTOR_SIZE];
    read_sector(0, &mut sector0)?;
    if sector0[510] != 0x55 || sector0[511] != 0xAA {
        return Err(Fat16Error::BadSignature);
    }
    // SAFETY: sector0 holds a full 512-byte sector; BiosParameterBlock is
    // smaller and `packed`, so every field read is in-bounds.
    let bpb = unsafe { core::ptr::read_unaligned(sector0.as_ptr().cast::<BiosParameterBlock>()) };

    let bytes_per_sector = bpb.bytes_per_sector as u32;
    if bytes_per_sector as usize != SECTOR_SIZE {
        return Err(Fat16Error::BadSignature);
    }
    let root_entry_count = bpb.root_entry_count as usize;
    if root_entry_count > MAX_ROOT_DIR_ENTRIES {
        return Err(Fat16Error::TooManyEntries);
    }
    let sectors_per_fat = bpb.sectors_per_fat as u32;
    if (sectors_per_fat as usize) > MAX_TABLE_SECTORS {
        return Err(Fat16Error::TableTooLarge);
    }

    let root_dir_bytes = root_entry_count * core::mem::size_of::<DirEntry>();
    let root_dir_sectors = ((root_dir_bytes + SECTOR_SIZE - 1) / SECTOR_SIZE) as u32;
    let reserved_sectors = bpb.reserved_sectors as u32;
    let num_fats = bpb.num_fats as u32;
    let root_dir_first_sector = reserved_sectors + num_fats * sectors_per_fat;

    let geometry = Geometry {
        sectors_per_cluster: bpb.sectors_per_cluster as u32,
        reserved_sectors,
        num_fats,
        sectors_per_fat,
        root_dir_sectors,
        root_dir_first_sector,
        cluster_size: bpb.sectors_per_cluster as u32 * bytes_per_sector,
    };

    let mut root = [DirEntry {
        name: [0; FILENAME_SIZE],
        extension: [0; EXTENSION_SIZE],
        attributes: 0,
        _reserved: [0; 10],
        _time: 0,
        _date: 0,
        starting_cluster: 0,
        size: 0,
    }; MAX_ROOT_DIR_ENTRIES];

    {
        // SAFETY: `root` is a plain array of `repr(C, packed)` entries; reading
        // it as a flat byte buffer of the same total size is valid.
        let root_bytes = unsafe {
            core::slice::from_raw_parts_mut(
                root.as_mut_ptr().cast::<u8>(),
                root_entry_count * core::mem::size_of::<DirEntry>(),
            )
        };
        for (i, chunk) in root_bytes.chunks_mut(SECTOR_SIZE).enumerate() {
            let mut sector_buf = [0u8; SECTOR_SIZE];
            read_sector(root_dir_first_sector + i as u32, &mut sector_buf)?;
            chunk.copy_from_slice(&sector_buf[..chunk.len()]);
        }
    }

    let mut table = [0u8; MAX_TABLE_SECTORS * SECTOR_SIZE];
    for i in 0..sectors_per_fat as usize {
        let mut sector_buf = [0u8; SECTOR_SIZE];
        read_sector(reserved_sectors + i as u32, &mut sector_buf)?;
        table[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sector_buf);
    }

    VOLUME.call_once(|| Fat16Volume {
        geometry,
        root,
        root_count: root_entry_count,
        table,
    });
    Ok(())
}

fn volume() -> &'static Fat16Volume {
    VOLUME.get().expect("fat16::init must run before any lookup")
}

/// 8.3形式に分割してパディングした名前を返す（例: `"TEST.BIN"` -> `b"TEST    "`,
/// `b"BIN"`）。
fn split_8_3(name: &str) -> ([u8; FILENAME_SIZE], [u8; EXTENSION_SIZE]) {
    let mut base = [b' '; FILENAME_SIZE];
    let mut ext = [b' '; EXTENSION_SIZE];
    match name.split_once('.') {
        Some((stem, extension)) => {
            for (dst, src) in base.iter_mut().zip(stem.bytes()) {
                *dst = src.to_ascii_uppercase();
            }
            for (dst, src) in ext.iter_mut().zip(extension.bytes()) {
                *dst = src.to_ascii_uppercase();
            }
        }
        None => {
            for (dst, src) in base.iter_mut().zip(name.bytes()) {
                *dst = src.to_ascii_uppercase();
            }
        }
    }
    (base, ext)
}

/// ルートディレクトリ中で `name` に一致するエントリのインデックスを探す。
pub fn find_entry(name: &str) -> Result<usize, Fat16Error> {
    let (want_name, want_ext) = split_8_3(name);
    let vol = volume();
    for i in 0..vol.root_count {
        let entry = &vol.root[i];
        let first = entry.name[0];
        if first == ENTRY_EMPTY || first == ENTRY_DELETED {
            continue;
        }
        if entry.attributes == LONG_FILE_NAME_ATTRIBUTE {
            continue;
        }
        if entry.name == want_name && entry.extension == want_ext {
            return Ok(i);
        }
    }
    Err(Fat16Error::NotFound)
}

/// ルートディレクトリのエントリ数。
pub fn root_entry_count() -> usize {
    volume().root_count
}

/// ルートディレクトリの生の内容を `buf` にコピーする。`get_root_directory`
/// システムコールの下請け。コピーしたエントリ数を返す。
pub fn copy_root_directory(buf: &mut [DirEntry]) -> usize {
    let vol = volume();
    let n = vol.root_count.min(buf.len());
    buf[..n].copy_from_slice(&vol.root[..n]);
    n
}

pub fn entry(index: usize) -> DirEntry {
    volume().root[index]
}

fn fat_entry(cluster: u16) -> u16 {
    let vol = volume();
    let offset = cluster as usize * 2;
    u16::from_le_bytes([vol.table[offset], vol.table[offset + 1]])
}

/// `start` クラスタから始まるチェーンを辿り、`position` バイト目から最大
/// `buf.len()` バイト（`size - position` が上限）読み込む。読み込んだバイト数
/// を返す。失敗したら `Err`（§4.7）。
pub fn read_cluster_data(
    start: u16,
    size: u32,
    position: u32,
    buf: &mut [u8],
) -> Result<usize, Fat16Error> {
    let vol = volume();
    let cluster_size = vol.geometry.cluster_size;
    if position >= size {
        return Ok(0);
    }
    let remaining_in_file = (size - position) as usize;
    let want = buf.len().min(remaining_in_file);
    if want == 0 {
        return Ok(0);
    }

    let mut cluster = start;
    let mut steps = (position / cluster_size) as usize;
    while steps > 0 {
        let next = fat_entry(cluster);
        if next >= LAST_CLUSTER_VALUE || next == 0 {
            return Err(Fat16Error::InvalidClusterLink);
        }
        cluster = next;
        steps -= 1;
    }

    let mut produced = 0usize;
    let mut offset_in_cluster = (position % cluster_size) as usize;

    while produced < want {
        if cluster < 2 {
            return Err(Fat16Error::ClusterOverflow);
        }
        let sector = vol.geometry.sector_of_cluster(cluster);
        let to_copy = (cluster_size as usize - offset_in_cluster).min(want - produced);
        let mut byte_cursor = 0usize;
        while byte_cursor < to_copy {
            let mut sector_buf = [0u8; SECTOR_SIZE];
            let sector_index = (offset_in_cluster + byte_cursor) / SECTOR_SIZE;
            let within_sector = (offset_in_cluster + byte_cursor) % SECTOR_SIZE;
            read_sector(sector + sector_index as u32, &mut sector_buf)
                .map_err(|_| Fat16Error::ClusterOverflow)?;
            let chunk = (SECTOR_SIZE - within_sector).min(to_copy - byte_cursor);
            if produced + chunk > buf.len() {
                return Err(Fat16Error::BufferOverrun);
            }
            buf[produced..produced + chunk]
                .copy_from_slice(&sector_buf[within_sector..within_sector + chunk]);
            produced += chunk;
            byte_cursor += chunk;
        }
        offset_in_cluster = 0;

        if produced < want {
            let next = fat_entry(cluster);
            if next >= LAST_CLUSTER_VALUE || next == 0 {
                return Err(Fat16Error::InvalidClusterLink);
            }
            cluster = next;
        }
    }

    Ok(produced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn split_8_3_pads_with_spaces() {
        let (name, ext) = split_8_3("SHELL.BIN");
        assert_eq!(&name, b"SHELL   ");
        assert_eq!(&ext, b"BIN");
    }

    #[test_case]
    fn split_8_3_uppercases_and_handles_no_extension() {
        let (name, ext) = split_8_3("kernel");
        assert_eq!(&name, b"KERNEL  ");
        assert_eq!(&ext, b"   ");
    }

    #[test_case]
    fn split_8_3_truncates_long_stems_silently() {
        // zip() stops at the shorter iterator — an over-length stem just
        // fills the 8-byte field without panicking.
        let (name, _) = split_8_3("TOOLONGNAME.TXT");
        assert_eq!(&name, b"TOOLONGN");
    }

    #[test_case]
    fn geometry_sector_of_cluster_matches_first_data_sector() {
        let geo = Geometry {
            sectors_per_cluster: 4,
            reserved_sectors: 1,
            num_fats: 2,
            sectors_per_fat: 8,
            root_dir_sectors: 32,
            root_dir_first_sector: 17,
            cluster_size: 4 * SECTOR_SIZE as u32,
        };
        // first_data_sector = reserved + num_fats*sectors_per_fat + root_dir_sectors
        assert_eq!(geo.first_data_sector(), 1 + 2 * 8 + 32);
        // cluster 2 is the first data cluster, sitting right at first_data_sector.
        assert_eq!(geo.sector_of_cluster(2), geo.first_data_sector());
        assert_eq!(geo.sector_of_cluster(3), geo.first_data_sector() + 4);
    }
}
