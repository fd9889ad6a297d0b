//! The ZealFS v2 filesystem engine: layout/formatter (4.E), path resolver
//! (4.F), and operations (4.G).

pub mod fs;
pub mod layout;
pub mod path;

pub use fs::{Handle, ZealFs};
pub use layout::{format, DirEntry, EntryFlags, Header, Timestamp};
