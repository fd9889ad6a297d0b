//! Disk enumerator (4.B) and staging manager (4.D): discovers candidate
//! disks, holds in-memory edits to a disk's MBR and per-partition formatted
//! blobs, and commits or reverts them atomically.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::block::{BackingKind, BlockDevice, RawDeviceHandle, SECTOR_SIZE};
use crate::error::{Result, ZealError};
use crate::mbr::{Mbr, PartitionEntry, ZEALFS_TYPE};
use crate::staging::StageState;
use crate::zealfs::layout;

pub const MAX_DISK_SIZE: u64 = 32 * 1024 * 1024 * 1024;
pub const MAX_DISKS: usize = 32;
pub const MAX_PARTITIONS: usize = 4;

/// Supported partition size choices, in UI order (spec §6).
pub const PARTITION_SIZES: [(&str, u64); 18] = [
    ("32KiB", 32 * 1024),
    ("64KiB", 64 * 1024),
    ("128KiB", 128 * 1024),
    ("256KiB", 256 * 1024),
    ("512KiB", 512 * 1024),
    ("1MiB", 1024 * 1024),
    ("2MiB", 2 * 1024 * 1024),
    ("4MiB", 4 * 1024 * 1024),
    ("8MiB", 8 * 1024 * 1024),
    ("16MiB", 16 * 1024 * 1024),
    ("32MiB", 32 * 1024 * 1024),
    ("64MiB", 64 * 1024 * 1024),
    ("128MiB", 128 * 1024 * 1024),
    ("256MiB", 256 * 1024 * 1024),
    ("512MiB", 512 * 1024 * 1024),
    ("1GiB", 1024 * 1024 * 1024),
    ("2GiB", 2 * 1024 * 1024 * 1024),
    ("4GiB", 4 * 1024 * 1024 * 1024),
];

/// A staged partition: its table entry plus an owned formatted-data blob,
/// present only while the partition was freshly allocated or formatted in
/// this staging round.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub entry: PartitionEntry,
    pub format_blob: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct Disk {
    pub name: String,
    pub path: PathBuf,
    pub is_image: bool,
    pub valid: bool,
    pub has_mbr: bool,
    pub size_bytes: u64,

    committed_mbr: Mbr,
    committed_partitions: [PartitionEntry; MAX_PARTITIONS],
    staged_mbr: Mbr,
    staged_partitions: [Partition; MAX_PARTITIONS],
    state: StageState,
    free_slot: Option<usize>,
}

impl Disk {
    fn from_sector0(name: String, path: PathBuf, is_image: bool, size_bytes: u64, sector0: [u8; SECTOR_SIZE]) -> Self {
        let valid = size_bytes <= MAX_DISK_SIZE;
        if !valid {
            warn!("{}: {} bytes exceeds the 32 GiB maximum disk size", name, size_bytes);
        }
        let has_mbr = Mbr::has_signature(&sector0);

        let (committed_mbr, committed_partitions) = if has_mbr {
            let mbr = Mbr::parse(&sector0).unwrap_or_default();
            let partitions = mbr.partitions;
            (mbr, partitions)
        } else {
            let mut partitions = [PartitionEntry::default(); MAX_PARTITIONS];
            if sector0[0] == ZEALFS_TYPE && sector0[1] == 2 {
                partitions[0] = PartitionEntry {
                    active: true,
                    partition_type: ZEALFS_TYPE,
                    start_lba: 0,
                    size_sectors: (size_bytes / SECTOR_SIZE as u64) as u32,
                };
            }
            (Mbr::default(), partitions)
        };

        let staged_partitions = committed_partitions.map(|entry| Partition { entry, format_blob: None });
        let free_slot = committed_partitions.iter().position(|p| !p.active);

        Self {
            name,
            path,
            is_image,
            valid,
            has_mbr,
            size_bytes,
            committed_mbr,
            committed_partitions,
            staged_mbr: committed_mbr,
            staged_partitions,
            state: StageState::default(),
            free_slot,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.state.is_dirty()
    }

    pub fn staged_mbr(&self) -> &Mbr {
        &self.staged_mbr
    }

    pub fn staged_partitions(&self) -> &[Partition; MAX_PARTITIONS] {
        &self.staged_partitions
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.free_slot
    }

    fn recompute_free_slot(&mut self) {
        self.free_slot = if !self.has_mbr {
            if self.staged_partitions[0].entry.active {
                None
            } else {
                Some(0)
            }
        } else {
            self.staged_partitions.iter().position(|p| !p.entry.active)
        };
    }

    /// Opens a candidate device or image path read-only and probes it,
    /// mirroring `disk_try_open` (spec §4.B).
    fn try_open(path: &Path, is_image: bool) -> Result<Self> {
        let mut handle = RawDeviceHandle::open(path, if is_image { BackingKind::ImageFile } else { BackingKind::RawDevice }, false)?;
        let size_bytes = handle.size_bytes();
        let mut sector0 = [0u8; SECTOR_SIZE];
        handle.read_at(0, &mut sector0)?;

        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| path.to_string_lossy().into_owned());
        Ok(Self::from_sector0(name, path.to_path_buf(), is_image, size_bytes, sector0))
    }

    /// Candidate device paths for this platform. Only Linux device
    /// enumeration is implemented; other targets return an empty sequence
    /// (spec §4.B', "platform path generator").
    fn candidate_device_paths() -> Vec<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            glob::glob("/dev/sd[a-z]")
                .map(|paths| paths.filter_map(|p| p.ok()).collect())
                .unwrap_or_default()
        }
        #[cfg(not(target_os = "linux"))]
        {
            Vec::new()
        }
    }

    /// Discovers disks at the platform's candidate paths. Permission-denied
    /// opens are distinguished from "no such device"; both are skipped, the
    /// former with a warning (spec §4.B, §7).
    pub fn enumerate() -> Vec<Self> {
        let mut disks = Vec::new();
        for path in Self::candidate_device_paths() {
            if disks.len() >= MAX_DISKS {
                break;
            }
            match Self::try_open(&path, false) {
                Ok(disk) => {
                    info!("found disk {}", disk.name);
                    disks.push(disk);
                }
                Err(ZealError::PermissionDenied) => {
                    warn!("permission denied opening {}: run as root/admin", path.display());
                }
                Err(ZealError::NotFound) => {}
                Err(err) => warn!("skipping {}: {err}", path.display()),
            }
        }
        disks
    }

    /// "Refresh": rejects (no-op) if any disk in `current` is dirty;
    /// otherwise rebuilds the list, preserving previously loaded image
    /// entries at the tail (spec §4.B).
    pub fn refresh(current: &[Self]) -> Result<Vec<Self>> {
        if current.iter().any(|d| d.is_dirty()) {
            return Err(ZealError::HasStagedChanges);
        }
        let mut refreshed = Self::enumerate();
        let images: Vec<&Disk> = current.iter().filter(|d| d.is_image).collect();
        for image in images {
            if refreshed.len() >= MAX_DISKS {
                break;
            }
            refreshed.push(Self::try_open(&image.path, true)?);
        }
        Ok(refreshed)
    }

    pub fn open_image<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::try_open(path.as_ref(), true)
    }

    /// Opens `path` as a raw device if it lives under `/dev`, otherwise as
    /// an image file. Used by the CLI, which accepts either kind of path
    /// interchangeably (spec §6).
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let is_image = !path.starts_with("/dev");
        Self::try_open(path, is_image)
    }

    /// Creates a new `.img` file of `size_bytes`, optionally pre-formatted
    /// with an empty (signature-only) MBR, and returns the resulting
    /// [`Disk`] (spec §4.D "Create empty MBR", mirrored from
    /// `disk_create_image`).
    pub fn create_image<P: AsRef<Path>>(path: P, size_bytes: u64, init_mbr: bool) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        let mut sector0 = [0u8; SECTOR_SIZE];
        if init_mbr {
            sector0 = Mbr::empty();
            file.write_all(&sector0)?;
        }
        if size_bytes > 0 {
            file.seek(SeekFrom::Start(size_bytes - 1))?;
            file.write_all(&[0u8])?;
        }
        drop(file);

        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        Ok(Self::from_sector0(name, path.to_path_buf(), true, size_bytes, sector0))
    }

    /// Zero-fills sector 0 and sets the signature; staged then committed
    /// immediately, matching `disk_create_mbr`'s "commit right away"
    /// behavior.
    pub fn create_mbr(&mut self) -> Result<()> {
        if self.has_mbr || !self.valid {
            return Ok(());
        }
        self.has_mbr = true;
        self.staged_mbr = Mbr::default();
        self.state.mark_dirty();
        self.commit()
    }

    fn disk_sectors(&self) -> u32 {
        (self.size_bytes / SECTOR_SIZE as u64) as u32
    }

    fn largest_free_gap_aligned(&self, alignment_bytes: u32) -> (u32, u32) {
        if !self.has_mbr {
            let alignment_sectors = (alignment_bytes / SECTOR_SIZE as u32).max(1);
            let start = crate::mbr::align_up(0, alignment_sectors);
            return (start, self.disk_sectors().saturating_sub(start));
        }
        self.staged_mbr.largest_free_gap_aligned(self.disk_sectors(), alignment_bytes)
    }

    /// Allocates a fresh ZealFS partition in the free slot, sized by
    /// `size_index` into [`PARTITION_SIZES`], aligned to `alignment_bytes`
    /// (512 or 1 MiB). Mirrors `disk_allocate_partition`.
    pub fn allocate_partition(&mut self, size_index: usize, alignment_bytes: u32) -> Result<usize> {
        if !self.valid {
            return Err(ZealError::InvalidArgument("disk is not valid".into()));
        }
        let slot = self.free_slot.ok_or(ZealError::NoFreeSlot)?;
        let (_, size_bytes) = *PARTITION_SIZES.get(size_index).ok_or_else(|| {
            ZealError::InvalidArgument(format!("invalid partition size index: {size_index}"))
        })?;

        let (start_lba, free_sectors) = self.largest_free_gap_aligned(alignment_bytes);
        let sectors = (size_bytes / SECTOR_SIZE as u64) as u32;
        if free_sectors < sectors {
            return Err(ZealError::NoSpace);
        }

        let entry = PartitionEntry { active: true, partition_type: ZEALFS_TYPE, start_lba, size_sectors: sectors };
        self.staged_mbr.partitions[slot] = entry;
        let format_blob = layout::format(size_bytes)?;
        self.staged_partitions[slot] = Partition { entry, format_blob: Some(format_blob) };
        self.state.mark_dirty();
        self.recompute_free_slot();
        info!("allocated partition {slot} on {} at LBA {start_lba}, {sectors} sectors", self.name);
        Ok(slot)
    }

    /// Replaces an existing partition's formatted-data blob with a fresh
    /// one (spec §4.D "Format partition (existing slot)").
    pub fn format_partition(&mut self, index: usize) -> Result<()> {
        let partition = self.staged_partitions.get_mut(index).ok_or(ZealError::NotFound)?;
        if !partition.entry.active {
            return Err(ZealError::NotFound);
        }
        let size_bytes = partition.entry.size_sectors as u64 * SECTOR_SIZE as u64;
        partition.entry.partition_type = ZEALFS_TYPE;
        partition.format_blob = Some(layout::format(size_bytes)?);
        self.staged_mbr.partitions[index].partition_type = ZEALFS_TYPE;
        self.state.mark_dirty();
        Ok(())
    }

    /// Clears a staged slot, frees its format blob, re-emits a zeroed MBR
    /// entry (spec §4.D "Delete partition").
    pub fn delete_partition(&mut self, index: usize) -> Result<()> {
        let partition = self.staged_partitions.get_mut(index).ok_or(ZealError::NotFound)?;
        if !partition.entry.active {
            return Ok(());
        }
        *partition = Partition::default();
        self.staged_mbr.partitions[index] = PartitionEntry::default();
        self.state.mark_dirty();
        self.recompute_free_slot();
        Ok(())
    }

    /// Frees all staged format blobs, restores staged MBR/partitions from
    /// committed, clears dirty (spec §4.D "Revert").
    pub fn revert(&mut self) {
        self.staged_mbr = self.committed_mbr;
        self.staged_partitions =
            self.committed_partitions.map(|entry| Partition { entry, format_blob: None });
        self.state.mark_clean();
        self.recompute_free_slot();
    }

    /// Writes the staged MBR and any staged format blobs to the backing
    /// store, then promotes staged state to committed (spec §4.D "Commit").
    /// Any I/O failure aborts the commit and leaves the staged state
    /// untouched so the caller can retry or revert.
    pub fn commit(&mut self) -> Result<()> {
        self.state.begin_commit()?;

        let result = (|| -> Result<()> {
            let mut handle = RawDeviceHandle::open(
                &self.path,
                if self.is_image { BackingKind::ImageFile } else { BackingKind::RawDevice },
                true,
            )?;
            if self.has_mbr {
                let mut existing = [0u8; SECTOR_SIZE];
                handle.read_at(0, &mut existing)?;
                let mut bootloader = [0u8; crate::mbr::PARTITION_TABLE_OFFSET];
                bootloader.copy_from_slice(&existing[..crate::mbr::PARTITION_TABLE_OFFSET]);
                let sector = self.staged_mbr.to_sector(&bootloader);
                handle.write_at(0, &sector)?;
            }
            for partition in &self.staged_partitions {
                if let Some(blob) = &partition.format_blob {
                    let offset = partition.entry.start_lba as u64 * SECTOR_SIZE as u64;
                    handle.write_at(offset, blob)?;
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.committed_mbr = self.staged_mbr;
                self.committed_partitions = self.staged_partitions.clone().map(|p| p.entry);
                for partition in &mut self.staged_partitions {
                    partition.format_blob = None;
                }
                self.state.commit_succeeded();
                info!("committed changes to {}", self.name);
                Ok(())
            }
            Err(err) => {
                self.state.commit_failed();
                warn!("commit to {} failed: {err}", self.name);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn create_image_then_mbr_then_allocate_then_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut disk = Disk::create_image(&path, 16 * 1024 * 1024, false).unwrap();
        assert!(!disk.has_mbr);

        disk.create_mbr().unwrap();
        assert!(disk.has_mbr);
        assert!(!disk.is_dirty());

        let slot = disk.allocate_partition(5, 1024 * 1024).unwrap();
        assert_eq!(slot, 0);
        assert!(disk.is_dirty());
        assert_eq!(disk.staged_partitions()[0].entry.start_lba, 2048);

        disk.commit().unwrap();
        assert!(!disk.is_dirty());

        let mut file = std::fs::File::open(&path).unwrap();
        let mut sector0 = [0u8; SECTOR_SIZE];
        file.read_exact(&mut sector0).unwrap();
        assert!(Mbr::has_signature(&sector0));
        let mbr = Mbr::parse(&sector0).unwrap();
        assert_eq!(mbr.partitions[0].partition_type, ZEALFS_TYPE);
        assert_eq!(mbr.partitions[0].start_lba, 2048);
    }

    #[test]
    fn revert_restores_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut disk = Disk::create_image(&path, 16 * 1024 * 1024, true).unwrap();
        disk.allocate_partition(5, 1024 * 1024).unwrap();
        assert!(disk.is_dirty());

        disk.revert();
        assert!(!disk.is_dirty());
        assert!(!disk.staged_partitions()[0].entry.active);
        assert_eq!(disk.free_slot(), Some(0));
    }

    #[test]
    fn delete_partition_frees_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut disk = Disk::create_image(&path, 16 * 1024 * 1024, true).unwrap();
        let slot = disk.allocate_partition(5, 1024 * 1024).unwrap();
        disk.commit().unwrap();
        assert_eq!(disk.free_slot(), Some(1));

        disk.delete_partition(slot).unwrap();
        assert!(disk.is_dirty());
        assert_eq!(disk.free_slot(), Some(0));
    }

    #[test]
    fn s6_commit_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut disk = Disk::create_image(&path, 16 * 1024 * 1024, true).unwrap();
        disk.allocate_partition(5, 1024 * 1024).unwrap();
        disk.commit().unwrap();
        drop(disk);

        let reopened = Disk::open_path(&path).unwrap();
        assert!(reopened.has_mbr);
        assert_eq!(reopened.staged_partitions()[0].entry.partition_type, ZEALFS_TYPE);
        assert_eq!(reopened.staged_partitions()[0].entry.start_lba, 2048);
        assert_eq!(reopened.staged_partitions()[0].entry.size_sectors, 2048);

        let mut file = std::fs::File::open(&path).unwrap();
        let mut header_probe = [0u8; 7];
        file.seek(SeekFrom::Start(2048 * SECTOR_SIZE as u64)).unwrap();
        file.read_exact(&mut header_probe).unwrap();
        assert_eq!(header_probe[0], b'Z');
        assert_eq!(header_probe[1], 2);
    }
}
