pub mod block;
pub mod disk;
pub mod error;
pub mod mbr;
pub mod staging;
pub mod zealfs;

pub use block::{BackingKind, BlockDevice, RawDeviceHandle};
pub use disk::{Disk, Partition};
pub use error::{Result, ZealError};
pub use mbr::{Mbr, PartitionEntry};
pub use staging::StageState;
pub use zealfs::{Handle, ZealFs};
