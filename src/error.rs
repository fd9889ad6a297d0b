use std::fmt;
use std::io;

/// Every distinct failure mode the disk/partition engine and the ZealFS
/// engine can report. Upper layers (and tests) match on the specific kind
/// rather than on a formatted message.
#[derive(Debug)]
pub enum ZealError {
    NotFound,
    AlreadyExists,
    NotDirectory,
    IsDirectory,
    NotEmpty,
    NameTooLong,
    NoSpace,
    InvalidArgument(String),
    PermissionDenied,
    IoError(io::Error),
    Seek,
    OversizedDisk,
    NoFreeSlot,
    HasStagedChanges,
}

impl fmt::Display for ZealError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::AlreadyExists => f.write_str("already exists"),
            Self::NotDirectory => f.write_str("not a directory"),
            Self::IsDirectory => f.write_str("is a directory"),
            Self::NotEmpty => f.write_str("directory not empty"),
            Self::NameTooLong => f.write_str("name too long"),
            Self::NoSpace => f.write_str("no space left on partition"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::PermissionDenied => f.write_str("permission denied"),
            Self::IoError(err) => write!(f, "I/O error: {err}"),
            Self::Seek => f.write_str("seek error"),
            Self::OversizedDisk => f.write_str("disk exceeds the maximum supported size"),
            Self::NoFreeSlot => f.write_str("no free partition slot"),
            Self::HasStagedChanges => f.write_str("disk has unstaged changes"),
        }
    }
}

impl std::error::Error for ZealError {}

impl From<io::Error> for ZealError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::IoError(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, ZealError>;
