//! Absolute path resolution across FAT-chained directory pages
//! (spec component 4.F).

use crate::block::BlockDevice;
use crate::error::{Result, ZealError};
use crate::zealfs::layout::{DirEntry, Header, ENTRY_SIZE, NAME_MAX_LEN};

/// Outcome of walking a path to its final component, equivalent to the
/// source's `browse_out_t`.
#[derive(Debug, Clone, Default)]
pub struct BrowseResult {
    /// Last directory page visited while searching the final component's
    /// parent, for extending that directory with a new page.
    pub last_dir_page: u16,
    /// Address of the first unoccupied entry seen while searching the final
    /// component's parent, if any.
    pub free_entry_addr: Option<u32>,
    /// Address and contents of the found entry, if any.
    pub entry_addr: Option<u32>,
    pub entry: Option<DirEntry>,
}

impl BrowseResult {
    pub fn found(&self) -> bool {
        self.entry_addr.is_some()
    }
}

pub fn addr_from_page(header: &Header, page: u16) -> u32 {
    page as u32 * header.page_size()
}

fn split_first_component(path: &str) -> (&str, Option<&str>) {
    match path.find('/') {
        Some(idx) => (&path[..idx], Some(&path[idx + 1..])),
        None => (path, None),
    }
}

/// Walks `path` (with any leading `/` already stripped) starting at
/// `entries_addr`, which must be the address of the directory's first page.
/// `is_root` selects the root directory's (smaller) entry capacity for the
/// first page only.
pub fn browse_path<D: BlockDevice>(
    device: &mut D,
    partition_offset: u64,
    header: &Header,
    fat: &[u16],
    path: &str,
    entries_addr: u32,
    is_root: bool,
) -> Result<BrowseResult> {
    let (component, rest) = split_first_component(path);
    if component.len() > NAME_MAX_LEN {
        return Err(ZealError::NameTooLong);
    }

    let mut out = BrowseResult { last_dir_page: (entries_addr / header.page_size()) as u16, ..Default::default() };

    let mut max_entries = if is_root { header.root_dir_max_entries() } else { header.dir_max_entries() };
    let mut current_page = (entries_addr / header.page_size()) as u16;
    let mut page_entries_addr = entries_addr;

    loop {
        let mut buf = vec![0u8; max_entries * ENTRY_SIZE];
        device.read_at(partition_offset + page_entries_addr as u64, &mut buf)?;

        for i in 0..max_entries {
            let entry = DirEntry::parse(&buf[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE]);
            if !entry.flags.is_occupied() {
                if rest.is_none() && out.free_entry_addr.is_none() {
                    out.free_entry_addr = Some(page_entries_addr + (i * ENTRY_SIZE) as u32);
                }
                continue;
            }
            if entry.name_matches(component) {
                match rest {
                    None => {
                        out.entry_addr = Some(page_entries_addr + (i * ENTRY_SIZE) as u32);
                        out.entry = Some(entry);
                        return Ok(out);
                    }
                    Some(rest_path) => {
                        let child_addr = addr_from_page(header, entry.start_page);
                        return browse_path(device, partition_offset, header, fat, rest_path, child_addr, false);
                    }
                }
            }
        }

        let next = fat.get(current_page as usize).copied().unwrap_or(0);
        if next == 0 {
            return Ok(out);
        }
        current_page = next;
        out.last_dir_page = current_page;
        max_entries = header.dir_max_entries();
        page_entries_addr = addr_from_page(header, current_page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBackend;
    use crate::zealfs::layout::{format, EntryFlags, Header};

    fn fresh(part_size: u64) -> (MemoryBackend, Header, Vec<u16>) {
        let blob = format(part_size).unwrap();
        let header = Header::parse(&blob).unwrap();
        let fat_bytes = crate::zealfs::layout::fat_page_count(header.page_size()) * header.page_size();
        let mut backend = MemoryBackend::new(part_size as usize);
        backend.write_at(0, &blob).unwrap();
        let fat = vec![0u16; fat_bytes as usize / 2];
        (backend, header, fat)
    }

    #[test]
    fn browse_empty_root_reports_first_free_slot() {
        let (mut backend, header, fat) = fresh(1024 * 1024);
        let root_addr = header.root_dir_addr();
        let result = browse_path(&mut backend, 0, &header, &fat, "hello.txt", root_addr, true).unwrap();
        assert!(!result.found());
        assert_eq!(result.free_entry_addr, Some(root_addr));
    }

    #[test]
    fn browse_finds_planted_entry() {
        let (mut backend, header, fat) = fresh(1024 * 1024);
        let root_addr = header.root_dir_addr();
        let mut entry = DirEntry { flags: EntryFlags::new(true, false), start_page: 3, size: 0, ..Default::default() };
        entry.set_name("hello.txt").unwrap();
        backend.write_at(root_addr as u64, &entry.to_bytes()).unwrap();

        let result = browse_path(&mut backend, 0, &header, &fat, "hello.txt", root_addr, true).unwrap();
        assert!(result.found());
        assert_eq!(result.entry.unwrap().start_page, 3);
    }

    #[test]
    fn component_over_name_limit_is_rejected() {
        let (mut backend, header, fat) = fresh(1024 * 1024);
        let root_addr = header.root_dir_addr();
        let err = browse_path(&mut backend, 0, &header, &fat, "this_name_is_way_too_long.txt", root_addr, true)
            .unwrap_err();
        assert!(matches!(err, ZealError::NameTooLong));
    }
}
