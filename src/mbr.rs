//! DOS-style Master Boot Record parsing, emission and free-gap search
//! (spec component 4.C).

use byteorder::{ByteOrder, LittleEndian};
use prettytable::{Cell, Row, Table};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ZealError};

pub const SECTOR_SIZE: u32 = 512;
pub const PARTITION_TABLE_OFFSET: usize = 0x1BE;
pub const PARTITION_ENTRY_SIZE: usize = 16;
pub const PARTITION_COUNT: usize = 4;
pub const SIGNATURE_OFFSET: usize = 510;

pub const ZEALFS_TYPE: u8 = 0x5A;

/// Returns a human-readable description of the partition type byte. Only a
/// handful of non-ZealFS types are named for display purposes, per spec §6.
pub fn partition_type_description(fs_byte: u8) -> &'static str {
    match fs_byte {
        0x00 => "Unused",
        0x01 => "FAT12",
        0x04 | 0x06 => "FAT16",
        0x05 | 0x0F | 0x85 => "Extended",
        0x07 => "NTFS",
        0x0B | 0x0C => "FAT32",
        0x5A => "ZealFS",
        0x82 => "ext2",
        0x83 => "ext3",
        0x8E => "ext4",
        0xA5 | 0xEF => "exFAT",
        0xEE => "GPT",
        _ => "Unknown",
    }
}

/// One 16-byte MBR partition table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub active: bool,
    pub partition_type: u8,
    pub start_lba: u32,
    pub size_sectors: u32,
}

impl PartitionEntry {
    /// Parses one 16-byte entry starting at `bytes`. The "active" test is
    /// deliberately conservative (spec §4.C): any non-zero field at all
    /// marks the slot as occupied, not just the classic 0x80 boot flag.
    pub fn parse(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= PARTITION_ENTRY_SIZE);
        let boot_flag = bytes[0];
        let partition_type = bytes[4];
        let start_lba = LittleEndian::read_u32(&bytes[8..12]);
        let size_sectors = LittleEndian::read_u32(&bytes[12..16]);
        let active =
            (boot_flag & 0x80) != 0 || partition_type != 0 || start_lba != 0 || size_sectors != 0;
        Self { active, partition_type, start_lba, size_sectors }
    }

    /// Emits the 16-byte on-disk representation. CHS triplets are always
    /// written as 0xFF 0xFF 0xFF (unused); the boot flag is always written
    /// as 0 (spec §4.C — the source never sets the classic bootable flag).
    pub fn to_bytes(self) -> [u8; PARTITION_ENTRY_SIZE] {
        let mut out = [0u8; PARTITION_ENTRY_SIZE];
        out[0] = 0x00;
        out[1..4].copy_from_slice(&[0xFF, 0xFF, 0xFF]);
        out[4] = self.partition_type;
        out[5..8].copy_from_slice(&[0xFF, 0xFF, 0xFF]);
        LittleEndian::write_u32(&mut out[8..12], self.start_lba);
        LittleEndian::write_u32(&mut out[12..16], self.size_sectors);
        out
    }

    pub fn end_lba(&self) -> u32 {
        self.start_lba + self.size_sectors
    }
}

/// A 512-byte MBR sector's partition table (bytes 0x1BE..0x1FE) plus the
/// 0x55 0xAA signature. The bootloader code area (bytes 0..0x1BE) is not
/// modeled here: this crate never touches it except to zero it out when
/// creating a fresh MBR.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Mbr {
    pub partitions: [PartitionEntry; PARTITION_COUNT],
}

impl Mbr {
    /// Returns `true` if `sector` carries the 0x55 0xAA MBR signature.
    pub fn has_signature(sector: &[u8]) -> bool {
        sector.len() >= SECTOR_SIZE as usize
            && sector[SIGNATURE_OFFSET] == 0x55
            && sector[SIGNATURE_OFFSET + 1] == 0xAA
    }

    /// Parses the partition table out of a full 512-byte sector 0.
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < SECTOR_SIZE as usize {
            return Err(ZealError::InvalidArgument("MBR sector must be 512 bytes".into()));
        }
        let mut partitions = [PartitionEntry::default(); PARTITION_COUNT];
        for (i, entry) in partitions.iter_mut().enumerate() {
            let start = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
            *entry = PartitionEntry::parse(&sector[start..start + PARTITION_ENTRY_SIZE]);
        }
        Ok(Self { partitions })
    }

    /// Emits a full 512-byte sector, preserving `bootloader` in bytes
    /// 0..0x1BE and writing partitions plus the signature after it.
    pub fn to_sector(&self, bootloader: &[u8; PARTITION_TABLE_OFFSET]) -> [u8; SECTOR_SIZE as usize] {
        let mut sector = [0u8; SECTOR_SIZE as usize];
        sector[..PARTITION_TABLE_OFFSET].copy_from_slice(bootloader);
        for (i, entry) in self.partitions.iter().enumerate() {
            let start = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
            sector[start..start + PARTITION_ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
        }
        sector[SIGNATURE_OFFSET] = 0x55;
        sector[SIGNATURE_OFFSET + 1] = 0xAA;
        sector
    }

    /// An MBR with no bootloader code, all partitions zeroed, and only the
    /// signature set (spec §4.C "Create empty MBR").
    pub fn empty() -> [u8; SECTOR_SIZE as usize] {
        Mbr::default().to_sector(&[0u8; PARTITION_TABLE_OFFSET])
    }

    /// Index of the first inactive slot, if any.
    pub fn free_slot(&self) -> Option<usize> {
        self.partitions.iter().position(|p| !p.active)
    }

    /// Largest free gap among: sector 1 → first partition start; each
    /// inter-partition gap; last partition end → `disk_sectors`. Returns
    /// `(start_lba, sector_count)`. Sector 0 (the MBR itself) is always
    /// excluded, so the returned start is always >= 1.
    pub fn largest_free_gap(&self, disk_sectors: u32) -> (u32, u32) {
        let mut sorted: Vec<PartitionEntry> =
            self.partitions.iter().copied().filter(|p| p.active).collect();
        sorted.sort_by_key(|p| p.start_lba);

        let mut best_start = 1u32;
        let mut best_len = 0u32;
        let mut previous_end = 1u32;

        for part in &sorted {
            if part.start_lba > previous_end {
                let gap = part.start_lba - previous_end;
                if gap > best_len {
                    best_len = gap;
                    best_start = previous_end;
                }
            }
            previous_end = previous_end.max(part.end_lba());
        }

        let tail = disk_sectors.saturating_sub(previous_end);
        if tail > best_len {
            best_len = tail;
            best_start = previous_end;
        }

        (best_start, best_len)
    }

    /// Like [`Mbr::largest_free_gap`] but rounds the returned start address
    /// up to `alignment` bytes and reduces the free size by the resulting
    /// slack (spec §4.C, property 3 in §8).
    pub fn largest_free_gap_aligned(&self, disk_sectors: u32, alignment_bytes: u32) -> (u32, u32) {
        let (start_lba, len_sectors) = self.largest_free_gap(disk_sectors);
        let alignment_sectors = (alignment_bytes / SECTOR_SIZE).max(1);
        let aligned_start = align_up(start_lba, alignment_sectors);
        let slack = aligned_start - start_lba;
        let aligned_len = len_sectors.saturating_sub(slack);
        (aligned_start, aligned_len)
    }
}

impl Mbr {
    /// Renders a `prettytable` summary of the partition table, mirroring
    /// the teacher's `MBR::print_info`.
    pub fn describe(&self) -> Table {
        let mut table = Table::new();
        table.add_row(Row::new(vec![
            Cell::new("Slot"),
            Cell::new("Active"),
            Cell::new("Type"),
            Cell::new("Description"),
            Cell::new("Start LBA"),
            Cell::new("Sectors"),
        ]));
        for (i, part) in self.partitions.iter().enumerate() {
            table.add_row(Row::new(vec![
                Cell::new(&i.to_string()),
                Cell::new(&part.active.to_string()),
                Cell::new(&format!("0x{:02x}", part.partition_type)),
                Cell::new(partition_type_description(part.partition_type)),
                Cell::new(&part.start_lba.to_string()),
                Cell::new(&part.size_sectors.to_string()),
            ]));
        }
        table
    }
}

pub fn align_up(value: u32, bound: u32) -> u32 {
    debug_assert!(bound.is_power_of_two());
    (value + bound - 1) & !(bound - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(active: bool, t: u8, start: u32, size: u32) -> PartitionEntry {
        PartitionEntry { active, partition_type: t, start_lba: start, size_sectors: size }
    }

    #[test]
    fn round_trip_preserves_partitions() {
        let mut mbr = Mbr::default();
        mbr.partitions[0] = entry(true, ZEALFS_TYPE, 2048, 2048);
        mbr.partitions[2] = entry(true, 0x0B, 8192, 4096);

        let sector = mbr.to_sector(&[0u8; PARTITION_TABLE_OFFSET]);
        let parsed = Mbr::parse(&sector).unwrap();

        assert_eq!(parsed.partitions[0].start_lba, 2048);
        assert_eq!(parsed.partitions[0].size_sectors, 2048);
        assert_eq!(parsed.partitions[0].partition_type, ZEALFS_TYPE);
        assert_eq!(parsed.partitions[2].partition_type, 0x0B);
        assert!(parsed.partitions[1] == PartitionEntry::default());
        assert!(!parsed.partitions[1].active);
        assert!(Mbr::has_signature(&sector));
    }

    #[test]
    fn free_gap_accounts_for_all_sectors() {
        let mut mbr = Mbr::default();
        mbr.partitions[0] = entry(true, ZEALFS_TYPE, 2048, 2048);
        mbr.partitions[1] = entry(true, ZEALFS_TYPE, 8192, 2048);

        let total = 20000u32;
        let (start, len) = mbr.largest_free_gap(total);
        // gap before first partition: [1, 2048) -> 2047
        // gap between partitions: [4096, 8192) -> 4096
        // tail gap: [10240, 20000) -> 9760
        assert_eq!((start, len), (10240, 9760));

        let active_sectors: u32 = mbr.partitions.iter().filter(|p| p.active).map(|p| p.size_sectors).sum();
        let gaps = (2048 - 1) + (8192 - 4096) + (total - 10240);
        assert_eq!(gaps + active_sectors, total - 1);
        assert!(start >= 1);
    }

    #[test]
    fn alignment_reduces_free_gap_by_slack_only() {
        let mut mbr = Mbr::default();
        mbr.partitions[0] = entry(true, ZEALFS_TYPE, 1, 100);
        let total = 5000u32;

        let (raw_start, raw_len) = mbr.largest_free_gap(total);
        let (aligned_start, aligned_len) = mbr.largest_free_gap_aligned(total, 1024 * 1024);
        let alignment_sectors = (1024 * 1024) / SECTOR_SIZE;
        let slack = align_up(raw_start, alignment_sectors) - raw_start;

        assert_eq!(aligned_start, raw_start + slack);
        assert_eq!(aligned_len, raw_len - slack);
    }

    #[test]
    fn no_mbr_gap_is_whole_disk() {
        // A disk with no MBR exposes the entire disk as the only gap,
        // starting at LBA 0 (spec §4.C).
        let mbr = Mbr::default();
        // disk.rs special-cases the no-MBR case; this only documents the
        // conservative behavior of an all-empty MBR table.
        let (start, len) = mbr.largest_free_gap(1000);
        assert_eq!(start, 1);
        assert_eq!(len, 999);
    }
}
