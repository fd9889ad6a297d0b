//! CLI front end (spec component H / §6). A thin `clap`-driven wrapper over
//! the library: it opens a disk or image, performs one action, and for
//! mutating actions commits immediately, since the process does not persist
//! staged state across invocations (see DESIGN.md).

use std::fs::File;
use std::io::{Read as _, Write as _};
use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};

use serde::Serialize;

use crate::block::{BackingKind, BlockDevice, RawDeviceHandle};
use crate::disk::{Disk, PARTITION_SIZES};
use crate::error::{Result, ZealError};
use crate::mbr::PartitionEntry;
use crate::zealfs::{layout::Timestamp, ZealFs};

pub fn build_command() -> Command {
    Command::new("zealpart")
        .version("1.0")
        .author("zealpart contributors")
        .about("Inspect and edit MBR partition tables and ZealFS v2 filesystems.")
        .arg(Arg::new("verbose").short('v').long("verbose").action(ArgAction::SetTrue).global(true))
        .arg(Arg::new("json").long("json").action(ArgAction::SetTrue).global(true).help("Emit status as JSON."))
        .subcommand(Command::new("list").about("Enumerate disks and print a summary table."))
        .subcommand(
            Command::new("show")
                .about("Print a disk's MBR table and ZealFS summaries.")
                .arg(disk_arg()),
        )
        .subcommand(Command::new("create-mbr").about("Write an empty MBR to a disk.").arg(disk_arg()))
        .subcommand(
            Command::new("allocate")
                .about("Allocate a new ZealFS partition in the first free slot.")
                .arg(disk_arg())
                .arg(Arg::new("size-index").long("size-index").required(true).value_parser(clap::value_parser!(usize)))
                .arg(
                    Arg::new("align")
                        .long("align")
                        .value_parser(clap::value_parser!(u32))
                        .default_value("1048576"),
                ),
        )
        .subcommand(
            Command::new("format")
                .about("Re-format an existing partition slot.")
                .arg(disk_arg())
                .arg(partition_arg()),
        )
        .subcommand(
            Command::new("delete")
                .about("Delete a partition slot.")
                .arg(disk_arg())
                .arg(partition_arg()),
        )
        .subcommand(Command::new("revert").about("Discard staged changes.").arg(disk_arg()))
        .subcommand(Command::new("commit").about("Write staged changes to the disk.").arg(disk_arg()))
        .subcommand(
            Command::new("ls")
                .about("List a ZealFS directory.")
                .arg(disk_arg())
                .arg(partition_arg())
                .arg(path_arg()),
        )
        .subcommand(
            Command::new("cat")
                .about("Print a ZealFS file's contents to stdout.")
                .arg(disk_arg())
                .arg(partition_arg())
                .arg(path_arg()),
        )
        .subcommand(
            Command::new("import")
                .about("Copy a host file into a ZealFS partition.")
                .arg(disk_arg())
                .arg(partition_arg())
                .arg(Arg::new("host-path").required(true))
                .arg(Arg::new("zealfs-path").required(true)),
        )
        .subcommand(
            Command::new("export")
                .about("Copy a ZealFS file out to the host filesystem.")
                .arg(disk_arg())
                .arg(partition_arg())
                .arg(Arg::new("zealfs-path").required(true))
                .arg(Arg::new("host-path").required(true)),
        )
        .subcommand(
            Command::new("rm")
                .about("Unlink a ZealFS file.")
                .arg(disk_arg())
                .arg(partition_arg())
                .arg(path_arg()),
        )
        .subcommand(
            Command::new("mkdir")
                .about("Create a ZealFS directory.")
                .arg(disk_arg())
                .arg(partition_arg())
                .arg(path_arg()),
        )
        .subcommand(
            Command::new("rmdir")
                .about("Remove an empty ZealFS directory.")
                .arg(disk_arg())
                .arg(partition_arg())
                .arg(path_arg()),
        )
}

fn disk_arg() -> Arg {
    Arg::new("disk").required(true).help("Path to a raw device or a .img file.")
}

fn partition_arg() -> Arg {
    Arg::new("partition").required(true).value_parser(clap::value_parser!(usize)).help("Partition slot, 0-3.")
}

fn path_arg() -> Arg {
    Arg::new("path").required(true).help("Absolute path within the ZealFS volume.")
}

pub fn run() -> Result<()> {
    let matches = build_command().get_matches();
    match matches.subcommand() {
        Some(("list", sub)) => cmd_list(sub.get_flag("json")),
        Some(("show", sub)) => cmd_show(sub.get_one::<String>("disk").unwrap(), sub.get_flag("json")),
        Some(("create-mbr", sub)) => cmd_create_mbr(sub.get_one::<String>("disk").unwrap()),
        Some(("allocate", sub)) => cmd_allocate(
            sub.get_one::<String>("disk").unwrap(),
            *sub.get_one::<usize>("size-index").unwrap(),
            *sub.get_one::<u32>("align").unwrap(),
        ),
        Some(("format", sub)) => {
            cmd_format(sub.get_one::<String>("disk").unwrap(), *sub.get_one::<usize>("partition").unwrap())
        }
        Some(("delete", sub)) => {
            cmd_delete(sub.get_one::<String>("disk").unwrap(), *sub.get_one::<usize>("partition").unwrap())
        }
        Some(("revert", sub)) => cmd_revert(sub.get_one::<String>("disk").unwrap()),
        Some(("commit", sub)) => cmd_commit(sub.get_one::<String>("disk").unwrap()),
        Some(("ls", sub)) => cmd_ls(
            sub.get_one::<String>("disk").unwrap(),
            *sub.get_one::<usize>("partition").unwrap(),
            sub.get_one::<String>("path").unwrap(),
        ),
        Some(("cat", sub)) => cmd_cat(
            sub.get_one::<String>("disk").unwrap(),
            *sub.get_one::<usize>("partition").unwrap(),
            sub.get_one::<String>("path").unwrap(),
        ),
        Some(("import", sub)) => cmd_import(
            sub.get_one::<String>("disk").unwrap(),
            *sub.get_one::<usize>("partition").unwrap(),
            sub.get_one::<String>("host-path").unwrap(),
            sub.get_one::<String>("zealfs-path").unwrap(),
        ),
        Some(("export", sub)) => cmd_export(
            sub.get_one::<String>("disk").unwrap(),
            *sub.get_one::<usize>("partition").unwrap(),
            sub.get_one::<String>("zealfs-path").unwrap(),
            sub.get_one::<String>("host-path").unwrap(),
        ),
        Some(("rm", sub)) => cmd_rm(
            sub.get_one::<String>("disk").unwrap(),
            *sub.get_one::<usize>("partition").unwrap(),
            sub.get_one::<String>("path").unwrap(),
        ),
        Some(("mkdir", sub)) => cmd_mkdir(
            sub.get_one::<String>("disk").unwrap(),
            *sub.get_one::<usize>("partition").unwrap(),
            sub.get_one::<String>("path").unwrap(),
        ),
        Some(("rmdir", sub)) => cmd_rmdir(
            sub.get_one::<String>("disk").unwrap(),
            *sub.get_one::<usize>("partition").unwrap(),
            sub.get_one::<String>("path").unwrap(),
        ),
        _ => {
            build_command().print_help().ok();
            println!();
            Ok(())
        }
    }
}

fn open_disk(path: &str) -> Result<Disk> {
    Disk::open_path(PathBuf::from(path))
}

fn backing_kind(disk: &Disk) -> BackingKind {
    if disk.is_image {
        BackingKind::ImageFile
    } else {
        BackingKind::RawDevice
    }
}

#[derive(Serialize)]
struct DiskSummary {
    name: String,
    size_bytes: u64,
    has_mbr: bool,
    partitions: Vec<PartitionEntry>,
}

fn cmd_list(json: bool) -> Result<()> {
    let disks = Disk::enumerate();
    if json {
        let summaries: Vec<DiskSummary> = disks
            .iter()
            .map(|disk| DiskSummary {
                name: disk.name.clone(),
                size_bytes: disk.size_bytes,
                has_mbr: disk.has_mbr,
                partitions: disk.staged_partitions().iter().filter(|p| p.entry.active).map(|p| p.entry).collect(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&summaries).map_err(|e| ZealError::InvalidArgument(e.to_string()))?);
        return Ok(());
    }
    println!("{:<16} {:>14} {:>8} {:>10}", "NAME", "SIZE", "HAS_MBR", "PARTITIONS");
    for disk in &disks {
        let active = disk.staged_partitions().iter().filter(|p| p.entry.active).count();
        println!("{:<16} {:>14} {:>8} {:>10}", disk.name, disk.size_bytes, disk.has_mbr, active);
    }
    Ok(())
}

fn cmd_show(disk_path: &str, json: bool) -> Result<()> {
    let disk = open_disk(disk_path)?;
    log::info!("showing {}", disk.name);
    if json {
        let summary = DiskSummary {
            name: disk.name.clone(),
            size_bytes: disk.size_bytes,
            has_mbr: disk.has_mbr,
            partitions: disk.staged_partitions().iter().filter(|p| p.entry.active).map(|p| p.entry).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&summary).map_err(|e| ZealError::InvalidArgument(e.to_string()))?);
        return Ok(());
    }
    if disk.has_mbr {
        println!("{}", disk.staged_mbr().describe());
    } else {
        println!("no MBR present");
    }
    for (i, partition) in disk.staged_partitions().iter().enumerate() {
        if !partition.entry.active {
            continue;
        }
        println!(
            "partition {i}: type=0x{:02x} start_lba={} sectors={}",
            partition.entry.partition_type, partition.entry.start_lba, partition.entry.size_sectors
        );
        if partition.entry.partition_type == crate::mbr::ZEALFS_TYPE {
            let offset = partition.entry.start_lba as u64 * crate::block::SECTOR_SIZE as u64;
            if let Ok(mut handle) = RawDeviceHandle::open(&disk.path, backing_kind(&disk), false) {
                let mut fs = ZealFs::new(&mut handle, offset);
                println!("  zealfs: {} bytes free", fs.free_space());
            }
        }
    }
    Ok(())
}

fn cmd_create_mbr(disk_path: &str) -> Result<()> {
    let mut disk = open_disk(disk_path)?;
    disk.create_mbr()?;
    log::info!("created empty MBR on {}", disk.name);
    println!("MBR created on {}", disk.name);
    Ok(())
}

fn cmd_allocate(disk_path: &str, size_index: usize, align: u32) -> Result<()> {
    let mut disk = open_disk(disk_path)?;
    let slot = disk.allocate_partition(size_index, align)?;
    disk.commit()?;
    let (label, _) = PARTITION_SIZES[size_index];
    log::info!("allocated partition {slot} ({label}) on {}", disk.name);
    println!("allocated partition {slot} ({label})");
    Ok(())
}

fn cmd_format(disk_path: &str, partition: usize) -> Result<()> {
    let mut disk = open_disk(disk_path)?;
    disk.format_partition(partition)?;
    disk.commit()?;
    println!("formatted partition {partition}");
    Ok(())
}

fn cmd_delete(disk_path: &str, partition: usize) -> Result<()> {
    let mut disk = open_disk(disk_path)?;
    disk.delete_partition(partition)?;
    disk.commit()?;
    println!("deleted partition {partition}");
    Ok(())
}

fn cmd_revert(disk_path: &str) -> Result<()> {
    let mut disk = open_disk(disk_path)?;
    disk.revert();
    println!("reverted {}", disk.name);
    Ok(())
}

fn cmd_commit(disk_path: &str) -> Result<()> {
    let mut disk = open_disk(disk_path)?;
    disk.commit()?;
    println!("committed {}", disk.name);
    Ok(())
}

fn partition_offset(disk: &Disk, partition: usize) -> Result<u64> {
    let entry = disk.staged_partitions().get(partition).ok_or(ZealError::NotFound)?;
    if !entry.entry.active {
        return Err(ZealError::NotFound);
    }
    Ok(entry.entry.start_lba as u64 * crate::block::SECTOR_SIZE as u64)
}

fn cmd_ls(disk_path: &str, partition: usize, path: &str) -> Result<()> {
    let disk = open_disk(disk_path)?;
    let offset = partition_offset(&disk, partition)?;
    let mut handle = RawDeviceHandle::open(&disk.path, backing_kind(&disk), false)?;
    let mut fs = ZealFs::new(&mut handle, offset);
    let dir = fs.opendir(path)?;
    for entry in fs.readdir(&dir, usize::MAX)? {
        let name = String::from_utf8_lossy(&entry.name);
        let name = name.trim_end_matches('\0');
        let kind = if entry.flags.is_dir() { "d" } else { "f" };
        println!("{kind} {:>10} {name}", entry.size);
    }
    Ok(())
}

fn cmd_cat(disk_path: &str, partition: usize, path: &str) -> Result<()> {
    let disk = open_disk(disk_path)?;
    let offset = partition_offset(&disk, partition)?;
    let mut handle = RawDeviceHandle::open(&disk.path, backing_kind(&disk), false)?;
    let mut fs = ZealFs::new(&mut handle, offset);
    let file = fs.open(path)?;
    let data = fs.read(&file, file.entry.size as usize, 0)?;
    std::io::stdout().write_all(&data)?;
    Ok(())
}

fn cmd_import(disk_path: &str, partition: usize, host_path: &str, zealfs_path: &str) -> Result<()> {
    let disk = open_disk(disk_path)?;
    let offset = partition_offset(&disk, partition)?;
    let mut handle = RawDeviceHandle::open(&disk.path, backing_kind(&disk), true)?;
    let mut fs = ZealFs::new(&mut handle, offset);

    let mut contents = Vec::new();
    File::open(host_path)?.read_to_end(&mut contents)?;

    let mut file = fs.create(zealfs_path, now())?;
    fs.write(&mut file, &contents, 0)?;
    fs.flush(&file)?;
    println!("imported {} bytes into {zealfs_path}", contents.len());
    Ok(())
}

fn cmd_export(disk_path: &str, partition: usize, zealfs_path: &str, host_path: &str) -> Result<()> {
    let disk = open_disk(disk_path)?;
    let offset = partition_offset(&disk, partition)?;
    let mut handle = RawDeviceHandle::open(&disk.path, backing_kind(&disk), false)?;
    let mut fs = ZealFs::new(&mut handle, offset);
    let file = fs.open(zealfs_path)?;
    let data = fs.read(&file, file.entry.size as usize, 0)?;
    File::create(host_path)?.write_all(&data)?;
    println!("exported {} bytes to {host_path}", data.len());
    Ok(())
}

fn cmd_rm(disk_path: &str, partition: usize, path: &str) -> Result<()> {
    let disk = open_disk(disk_path)?;
    let offset = partition_offset(&disk, partition)?;
    let mut handle = RawDeviceHandle::open(&disk.path, backing_kind(&disk), true)?;
    let mut fs = ZealFs::new(&mut handle, offset);
    fs.unlink(path)?;
    println!("removed {path}");
    Ok(())
}

fn cmd_mkdir(disk_path: &str, partition: usize, path: &str) -> Result<()> {
    let disk = open_disk(disk_path)?;
    let offset = partition_offset(&disk, partition)?;
    let mut handle = RawDeviceHandle::open(&disk.path, backing_kind(&disk), true)?;
    let mut fs = ZealFs::new(&mut handle, offset);
    fs.mkdir(path, now())?;
    println!("created directory {path}");
    Ok(())
}

fn cmd_rmdir(disk_path: &str, partition: usize, path: &str) -> Result<()> {
    let disk = open_disk(disk_path)?;
    let offset = partition_offset(&disk, partition)?;
    let mut handle = RawDeviceHandle::open(&disk.path, backing_kind(&disk), true)?;
    let mut fs = ZealFs::new(&mut handle, offset);
    fs.rmdir(path)?;
    println!("removed directory {path}");
    Ok(())
}

/// Current wall-clock time as a ZealFS [`Timestamp`]. Implements its own
/// civil-calendar conversion from `SystemTime` rather than pulling in a date
/// crate the teacher's stack doesn't carry.
fn now() -> Timestamp {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let days = (secs / 86_400) as i64;
    let time_of_day = secs % 86_400;

    // Howard Hinnant's days-from-civil / civil-from-days algorithm.
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = (if month <= 2 { y + 1 } else { y }) as u32;
    let weekday = ((days % 7 + 7) % 7 + 1) as u32;

    Timestamp {
        year,
        month,
        day,
        weekday,
        hours: (time_of_day / 3600) as u32,
        minutes: ((time_of_day % 3600) / 60) as u32,
        seconds: (time_of_day % 60) as u32,
    }
}
