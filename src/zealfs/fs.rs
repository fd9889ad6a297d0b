//! ZealFS v2 file and directory operations (spec component 4.G).
//!
//! `ZealFs` plays the role of the source's `zealfs_context_t`: it owns a
//! lazily-loaded header+bitmap cache and FAT cache over a block device
//! window starting at `partition_offset`.

use log::warn;

use crate::block::BlockDevice;
use crate::error::{Result, ZealError};
use crate::zealfs::layout::{
    self, fat_page_count, DirEntry, EntryFlags, Header, Timestamp, ENTRY_SIZE,
};
use crate::zealfs::path::{addr_from_page, browse_path};

/// A handle to an open file or directory: the entry's cached contents plus
/// its on-disk address. For the root directory `entry` is the zero value
/// and `entry_addr` is the root directory's first-page address, matching
/// the source's `zealfs_fd_t`.
#[derive(Debug, Clone)]
pub struct Handle {
    pub entry: DirEntry,
    pub entry_addr: u32,
}

pub struct ZealFs<'a, D: BlockDevice> {
    device: &'a mut D,
    partition_offset: u64,
    header: Option<Header>,
    fat: Option<Vec<u16>>,
}

impl<'a, D: BlockDevice> ZealFs<'a, D> {
    pub fn new(device: &'a mut D, partition_offset: u64) -> Self {
        Self { device, partition_offset, header: None, fat: None }
    }

    /// Loads the header and FAT caches on first use (`check_header`).
    fn ensure_loaded(&mut self) -> Result<()> {
        if self.header.is_some() {
            return Ok(());
        }
        let mut probe = [0u8; layout::HEADER_FIXED_SIZE];
        self.device.read_at(self.partition_offset, &mut probe)?;
        let bitmap_size = u16::from_le_bytes([probe[2], probe[3]]);
        let mut full = vec![0u8; layout::HEADER_FIXED_SIZE + bitmap_size as usize];
        self.device.read_at(self.partition_offset, &mut full)?;
        let header = Header::parse(&full)?;

        let page_size = header.page_size();
        let fat_bytes_on_disk = fat_page_count(page_size) as usize * page_size as usize;
        let total_pages = header.bitmap.len() * 8;
        let mut fat = vec![0u16; total_pages.max(fat_bytes_on_disk / 2)];
        let mut fat_buf = vec![0u8; fat_bytes_on_disk];
        self.device.read_at(self.partition_offset + page_size as u64, &mut fat_buf)?;
        for (i, chunk) in fat_buf.chunks_exact(2).enumerate() {
            fat[i] = u16::from_le_bytes([chunk[0], chunk[1]]);
        }

        self.header = Some(header);
        self.fat = Some(fat);
        Ok(())
    }

    fn header(&self) -> &Header {
        self.header.as_ref().expect("ensure_loaded was called")
    }

    fn header_mut(&mut self) -> &mut Header {
        self.header.as_mut().expect("ensure_loaded was called")
    }

    fn fat(&self) -> &[u16] {
        self.fat.as_ref().expect("ensure_loaded was called")
    }

    fn get_next_in_fat(&self, page: u16) -> u16 {
        self.fat()[page as usize]
    }

    fn set_next_in_fat(&mut self, page: u16, next: u16) {
        self.fat.as_mut().expect("ensure_loaded was called")[page as usize] = next;
    }

    fn write_header_and_bitmap(&mut self) -> Result<()> {
        let bytes = self.header().to_bytes();
        self.device.write_at(self.partition_offset, &bytes)
    }

    fn write_fat(&mut self) -> Result<()> {
        let header = self.header();
        let page_size = header.page_size();
        let fat_bytes_on_disk = fat_page_count(page_size) as usize * page_size as usize;
        let fat = self.fat();
        let mut buf = vec![0u8; fat_bytes_on_disk];
        for (i, slot) in buf.chunks_exact_mut(2).enumerate() {
            let value = fat.get(i).copied().unwrap_or(0);
            slot.copy_from_slice(&value.to_le_bytes());
        }
        self.device.write_at(self.partition_offset + page_size as u64, &buf)
    }

    fn read_entries_raw(&mut self, addr: u32, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count * ENTRY_SIZE];
        self.device.read_at(self.partition_offset + addr as u64, &mut buf)?;
        Ok(buf)
    }

    fn browse(&mut self, path: &str) -> Result<crate::zealfs::path::BrowseResult> {
        self.ensure_loaded()?;
        let header = self.header.clone().expect("loaded");
        let fat = self.fat.clone().expect("loaded");
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        browse_path(self.device, self.partition_offset, &header, &fat, trimmed, header.root_dir_addr(), true)
    }

    /// `opendir`: resolves `path` and yields a handle positioned at the
    /// target directory's first page, or the root directory for `"/"`.
    pub fn opendir(&mut self, path: &str) -> Result<Handle> {
        self.ensure_loaded()?;
        if path == "/" {
            return Ok(Handle { entry: DirEntry::default(), entry_addr: self.header().root_dir_addr() });
        }
        let result = self.browse(path)?;
        let entry = result.entry.ok_or(ZealError::NotFound)?;
        if !entry.flags.is_dir() {
            return Err(ZealError::NotDirectory);
        }
        Ok(Handle { entry, entry_addr: addr_from_page(self.header(), entry.start_page) })
    }

    /// `readdir`: reads up to `max` occupied entries from `dir`, walking
    /// directory pages via the FAT.
    pub fn readdir(&mut self, dir: &Handle, max: usize) -> Result<Vec<DirEntry>> {
        self.ensure_loaded()?;
        let is_root = dir.entry_addr == self.header().root_dir_addr();
        let mut max_entries = if is_root { self.header().root_dir_max_entries() } else { self.header().dir_max_entries() };
        let mut current_page = dir.entry_addr / self.header().page_size();
        let mut entries_addr = dir.entry_addr;
        let mut out = Vec::new();

        loop {
            let buf = self.read_entries_raw(entries_addr, max_entries)?;
            for i in 0..max_entries {
                if out.len() >= max {
                    break;
                }
                let entry = DirEntry::parse(&buf[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE]);
                if entry.flags.is_occupied() {
                    out.push(entry);
                }
            }
            if out.len() >= max {
                break;
            }
            max_entries = self.header().dir_max_entries();
            let next = self.get_next_in_fat(current_page as u16);
            if next == 0 {
                break;
            }
            current_page = next as u32;
            entries_addr = addr_from_page(self.header(), next);
        }
        Ok(out)
    }

    /// `open`: resolves `path` to a file; rejects directories.
    pub fn open(&mut self, path: &str) -> Result<Handle> {
        if path == "/" {
            return Err(ZealError::IsDirectory);
        }
        let result = self.browse(path)?;
        let entry = result.entry.ok_or(ZealError::NotFound)?;
        let entry_addr = result.entry_addr.expect("entry present");
        if entry.flags.is_dir() {
            return Err(ZealError::IsDirectory);
        }
        Ok(Handle { entry, entry_addr })
    }

    /// `read`: reads up to `size` bytes from `handle` starting at `offset`,
    /// clamped to the entry's cached size.
    pub fn read(&mut self, handle: &Handle, size: usize, offset: u32) -> Result<Vec<u8>> {
        self.ensure_loaded()?;
        if size == 0 {
            return Ok(Vec::new());
        }
        let page_size = self.header().page_size();
        let remaining_in_file = handle.entry.size.saturating_sub(offset);
        let mut size = size.min(remaining_in_file as usize);
        if size == 0 {
            return Ok(Vec::new());
        }

        let mut jump_pages = offset / page_size;
        let mut offset_in_page = (offset % page_size) as usize;
        let mut current_page = handle.entry.start_page;
        while jump_pages > 0 {
            current_page = self.get_next_in_fat(current_page);
            jump_pages -= 1;
        }

        let mut out = Vec::with_capacity(size);
        let mut page_addr = addr_from_page(self.header(), current_page);
        while size > 0 {
            let count = (page_size as usize - offset_in_page).min(size);
            let mut chunk = vec![0u8; count];
            self.device.read_at(self.partition_offset + page_addr as u64 + offset_in_page as u64, &mut chunk)?;
            out.extend_from_slice(&chunk);
            size -= count;
            if size > 0 {
                current_page = self.get_next_in_fat(current_page);
                page_addr = addr_from_page(self.header(), current_page);
            }
            offset_in_page = 0;
        }
        Ok(out)
    }

    /// `write`: writes `buf` into `handle` at `offset`, extending the page
    /// chain lazily. The handle's cached `entry.size` is updated; the
    /// caller must call [`ZealFs::flush`] to persist it.
    pub fn write(&mut self, handle: &mut Handle, buf: &[u8], offset: u32) -> Result<usize> {
        self.ensure_loaded()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let page_size = self.header().page_size();
        let mut jump_pages = offset / page_size;
        let mut offset_in_page = (offset % page_size) as usize;
        let remaining_in_page = page_size as usize - offset_in_page;

        if self.free_space() as usize + remaining_in_page < buf.len() {
            return Err(ZealError::NoSpace);
        }

        let mut current_page = handle.entry.start_page;
        while jump_pages > 0 {
            let next = self.get_next_in_fat(current_page);
            if next == 0 {
                if jump_pages != 1 {
                    return Err(ZealError::Seek);
                }
                current_page = self.allocate_next(current_page)?;
            } else {
                current_page = next;
            }
            jump_pages -= 1;
        }

        let total = buf.len();
        let mut remaining = buf;
        while !remaining.is_empty() {
            let page_addr = addr_from_page(self.header(), current_page);
            let count = (page_size as usize - offset_in_page).min(remaining.len());
            self.device.write_at(
                self.partition_offset + page_addr as u64 + offset_in_page as u64,
                &remaining[..count],
            )?;
            handle.entry.size += count as u32;
            remaining = &remaining[count..];

            let next = self.get_next_in_fat(current_page);
            if next != 0 {
                current_page = next;
            } else if !remaining.is_empty() {
                current_page = self.allocate_next(current_page)?;
            }
            offset_in_page = 0;
        }
        Ok(total)
    }

    fn allocate_next(&mut self, current_page: u16) -> Result<u16> {
        let next = self.header_mut().allocate_page()?;
        self.set_next_in_fat(current_page, next);
        Ok(next)
    }

    fn create_both(&mut self, path: &str, is_dir: bool, now: Timestamp) -> Result<Handle> {
        self.ensure_loaded()?;
        let header_backup = self.header().clone();

        let name = path.rsplit('/').next().unwrap_or(path);
        if name.len() > layout::NAME_MAX_LEN {
            return Err(ZealError::NameTooLong);
        }

        let result = self.browse(path)?;
        if result.found() {
            return Err(ZealError::AlreadyExists);
        }

        let mut new_page_dir = 0u16;
        let free_entry_addr = match result.free_entry_addr {
            Some(addr) => addr,
            None => match self.header_mut().allocate_page() {
                Ok(page) => {
                    new_page_dir = page;
                    self.set_next_in_fat(page, 0);
                    self.set_next_in_fat(result.last_dir_page, page);
                    addr_from_page(self.header(), page)
                }
                Err(err) => {
                    *self.header_mut() = header_backup;
                    return Err(err);
                }
            },
        };

        let new_page = match self.header_mut().allocate_page() {
            Ok(page) => page,
            Err(err) => {
                *self.header_mut() = header_backup;
                return Err(err);
            }
        };
        self.set_next_in_fat(new_page, 0);

        let mut entry = DirEntry {
            flags: EntryFlags::new(true, is_dir),
            start_page: new_page,
            size: if is_dir { self.header().page_size() } else { 0 },
            ..Default::default()
        };
        entry.set_name(name)?;
        let (year, month, day, weekday, hours, minutes, seconds) = now.to_bcd_fields();
        entry.year = year;
        entry.month = month;
        entry.day = day;
        entry.weekday = weekday;
        entry.hours = hours;
        entry.minutes = minutes;
        entry.seconds = seconds;

        let page_size = self.header().page_size() as usize;
        let zeroes = vec![0u8; page_size];
        let write_result = (|| -> Result<()> {
            self.device.write_at(self.partition_offset + addr_from_page(self.header(), new_page) as u64, &zeroes)?;
            if new_page_dir != 0 {
                self.device
                    .write_at(self.partition_offset + addr_from_page(self.header(), new_page_dir) as u64, &zeroes)?;
            }
            self.device.write_at(self.partition_offset + free_entry_addr as u64, &entry.to_bytes())?;
            self.write_header_and_bitmap()?;
            self.write_fat()?;
            Ok(())
        })();

        if let Err(err) = write_result {
            warn!("zealfs: create failed, restoring header snapshot: {err}");
            *self.header_mut() = header_backup;
            return Err(err);
        }

        Ok(Handle { entry, entry_addr: free_entry_addr })
    }

    pub fn create(&mut self, path: &str, now: Timestamp) -> Result<Handle> {
        self.create_both(path, false, now)
    }

    pub fn mkdir(&mut self, path: &str, now: Timestamp) -> Result<Handle> {
        self.create_both(path, true, now)
    }

    pub fn unlink(&mut self, path: &str) -> Result<()> {
        self.ensure_loaded()?;
        let result = self.browse(path)?;
        let entry = result.entry.ok_or(ZealError::NotFound)?;
        if entry.flags.is_dir() {
            return Err(ZealError::IsDirectory);
        }
        let entry_addr = result.entry_addr.expect("entry present");

        let mut page = entry.start_page;
        while page != 0 {
            let next = self.get_next_in_fat(page);
            self.header_mut().mark_free(page);
            self.set_next_in_fat(page, 0);
            page = next;
        }

        self.device.write_at(self.partition_offset + entry_addr as u64, &DirEntry::default().to_bytes())?;
        self.write_header_and_bitmap()?;
        self.write_fat()?;
        Ok(())
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        if path == "/" {
            return Err(ZealError::PermissionDenied);
        }
        self.ensure_loaded()?;
        let result = self.browse(path)?;
        let entry = result.entry.ok_or(ZealError::NotFound)?;
        if !entry.flags.is_dir() {
            return Err(ZealError::NotDirectory);
        }
        let entry_addr = result.entry_addr.expect("entry present");

        let max_entries = self.header().dir_max_entries();

        let mut pages = Vec::new();
        let mut current_page = entry.start_page;
        while current_page != 0 {
            let page_addr = addr_from_page(self.header(), current_page);
            let buf = self.read_entries_raw(page_addr, max_entries)?;
            for i in 0..max_entries {
                let candidate = DirEntry::parse(&buf[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE]);
                if candidate.flags.is_occupied() {
                    return Err(ZealError::NotEmpty);
                }
            }
            pages.push(current_page);
            current_page = self.get_next_in_fat(current_page);
        }

        for page in pages {
            self.header_mut().mark_free(page);
            self.set_next_in_fat(page, 0);
        }

        self.device.write_at(self.partition_offset + entry_addr as u64, &DirEntry::default().to_bytes())?;
        self.write_header_and_bitmap()?;
        self.write_fat()?;
        Ok(())
    }

    /// `flush`: the consistency commit point. Writes the handle's cached
    /// entry, then the full header+bitmap, then the full FAT region, in
    /// that order.
    pub fn flush(&mut self, handle: &Handle) -> Result<()> {
        self.ensure_loaded()?;
        self.device.write_at(self.partition_offset + handle.entry_addr as u64, &handle.entry.to_bytes())?;
        self.write_header_and_bitmap()?;
        self.write_fat()?;
        Ok(())
    }

    pub fn free_space(&mut self) -> u32 {
        if self.header.is_none() {
            self.ensure_loaded().expect("header must be readable to report free space");
        }
        self.header().free_space_bytes()
    }

    pub fn destroy(&mut self) {
        self.header = None;
        self.fat = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBackend;
    use crate::zealfs::layout::format;

    fn epoch() -> Timestamp {
        Timestamp { year: 2026, month: 7, day: 27, weekday: 1, hours: 12, minutes: 0, seconds: 0 }
    }

    fn fresh_fs(part_size: u64) -> MemoryBackend {
        let blob = format(part_size).unwrap();
        let mut backend = MemoryBackend::new(part_size as usize);
        backend.write_at(0, &blob).unwrap();
        backend
    }

    #[test]
    fn s2_create_root_file() {
        let mut backend = fresh_fs(1024 * 1024);
        let mut fs = ZealFs::new(&mut backend, 0);
        let handle = fs.create("/hello.txt", epoch()).unwrap();
        assert_eq!(handle.entry.size, 0);
        assert!(handle.entry.flags.is_occupied());
        assert!(!handle.entry.flags.is_dir());
        assert!(handle.entry.start_page >= 3);
        assert_eq!(fs.free_space(), (1021 - 1) * 1024);
    }

    #[test]
    fn s3_write_flush_read_round_trip() {
        let mut backend = fresh_fs(1024 * 1024);
        let mut fs = ZealFs::new(&mut backend, 0);
        let mut handle = fs.create("/hello.txt", epoch()).unwrap();
        let payload: Vec<u8> = (1u8..=64).collect();
        fs.write(&mut handle, &payload, 0).unwrap();
        assert_eq!(handle.entry.size, 64);
        fs.flush(&handle).unwrap();

        let opened = fs.open("/hello.txt").unwrap();
        let data = fs.read(&opened, 64, 0).unwrap();
        assert_eq!(data, payload);
    }

    #[test]
    fn s4_write_overflows_one_page() {
        let mut backend = fresh_fs(1024 * 1024);
        let mut fs = ZealFs::new(&mut backend, 0);
        let mut handle = fs.create("/hello.txt", epoch()).unwrap();
        let free_before = fs.free_space();
        let payload = vec![0xAAu8; 1500];
        fs.write(&mut handle, &payload, 0).unwrap();
        fs.flush(&handle).unwrap();

        let first = handle.entry.start_page;
        let second = fs.get_next_in_fat(first);
        assert_ne!(second, 0);
        assert_eq!(fs.get_next_in_fat(second), 0);
        assert_eq!(fs.free_space(), free_before - 1024);
    }

    #[test]
    fn s5_unlink_reclaims_two_pages() {
        let mut backend = fresh_fs(1024 * 1024);
        let mut fs = ZealFs::new(&mut backend, 0);
        let mut handle = fs.create("/hello.txt", epoch()).unwrap();
        let free_after_create = fs.free_space();
        let payload = vec![0xAAu8; 1500];
        fs.write(&mut handle, &payload, 0).unwrap();
        fs.flush(&handle).unwrap();

        fs.unlink("/hello.txt").unwrap();
        assert_eq!(fs.free_space(), free_after_create + 1024);

        let err = fs.open("/hello.txt").unwrap_err();
        assert!(matches!(err, ZealError::NotFound));
    }

    #[test]
    fn rmdir_rejects_non_empty_directory() {
        let mut backend = fresh_fs(1024 * 1024);
        let mut fs = ZealFs::new(&mut backend, 0);
        fs.mkdir("/docs", epoch()).unwrap();
        fs.create("/docs/a.txt", epoch()).unwrap();

        let err = fs.rmdir("/docs").unwrap_err();
        assert!(matches!(err, ZealError::NotEmpty));
    }

    #[test]
    fn rmdir_checks_every_page_before_freeing_any() {
        // 64 KiB partition selects a 256-byte page, so a directory's first
        // page holds only 8 entries and a 9th file spills into a second,
        // FAT-linked directory page.
        let mut backend = fresh_fs(64 * 1024);
        let mut fs = ZealFs::new(&mut backend, 0);
        let docs = fs.mkdir("/docs", epoch()).unwrap();
        let first_page = docs.entry.start_page;

        for i in 0..8 {
            fs.create(&format!("/docs/f{i}.txt"), epoch()).unwrap();
        }
        fs.create("/docs/overflow.txt", epoch()).unwrap();

        let second_page = fs.get_next_in_fat(first_page);
        assert_ne!(second_page, 0, "9th entry must have spilled onto a second page");

        // Empty the first page entirely; the second page still holds
        // overflow.txt, so the directory as a whole is not empty.
        for i in 0..8 {
            fs.unlink(&format!("/docs/f{i}.txt")).unwrap();
        }

        let err = fs.rmdir("/docs").unwrap_err();
        assert!(matches!(err, ZealError::NotEmpty));

        // The check-then-free ordering means a rejected rmdir must not have
        // freed or unlinked the first (already-empty) page.
        assert!(fs.header().is_allocated(first_page));
        assert_eq!(fs.get_next_in_fat(first_page), second_page);
        assert!(fs.header().is_allocated(second_page));

        // The directory is still fully usable afterwards.
        fs.unlink("/docs/overflow.txt").unwrap();
        fs.rmdir("/docs").unwrap();
    }

    #[test]
    fn readdir_lists_created_entries() {
        let mut backend = fresh_fs(1024 * 1024);
        let mut fs = ZealFs::new(&mut backend, 0);
        fs.create("/a.txt", epoch()).unwrap();
        fs.create("/b.txt", epoch()).unwrap();

        let dir = fs.opendir("/").unwrap();
        let entries = fs.readdir(&dir, 10).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn create_existing_path_fails() {
        let mut backend = fresh_fs(1024 * 1024);
        let mut fs = ZealFs::new(&mut backend, 0);
        fs.create("/a.txt", epoch()).unwrap();
        let err = fs.create("/a.txt", epoch()).unwrap_err();
        assert!(matches!(err, ZealError::AlreadyExists));
    }
}
