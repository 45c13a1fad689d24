//! Error taxonomy for the cache, filesystem, and paging subsystems.

use thiserror::Error;

/// Unified error type returned from fallible operations across this crate.
///
/// `OutOfMemory`, `SwapFull`, and other conditions `spec.md` §7 marks as
/// fatal/panic are deliberately *not* variants here — they are raised as
/// `panic!` at the call sites that detect them, since there is no sane way
/// for a caller to recover from "the system is out of physical frames and
/// swap".
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("disk i/o failure on sector {sector}: {source}")]
    DiskIo {
        sector: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("sector {0} is out of range for this device")]
    InvalidSector(u64),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("inode {0} is not a directory")]
    NotADirectory(u32),

    #[error("inode {0} is a directory")]
    IsADirectory(u32),

    #[error("file is open for reading only: deny_write count is {0}")]
    WriteDenied(u32),

    #[error("no free sector available to extend inode {0}")]
    NoFreeSector(u32),

    #[error("corruption detected: {0}")]
    Corruption(&'static str),

    #[error("address {0:#x} is not mapped in the supplemental page table")]
    Unmapped(usize),

    #[error("address {0:#x} is already mapped")]
    AlreadyMapped(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KernelError>;
