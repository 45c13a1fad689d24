//! `keos-core`: the buffer cache, on-disk inode layer, and virtual-memory
//! paging core of a small instructional kernel, hosted on top of `std` so
//! the design can be built and exercised without real hardware.
//!
//! The block device, hardware page table, and thread primitives this crate
//! treats as external collaborators are realized here as trait interfaces
//! ([`device::BlockDevice`], [`mm::HardwarePageTable`]) plus one reference
//! implementation of each ([`device::MemDisk`], [`mm::SimulatedPageTable`])
//! used throughout the test suite. Production embedders supply their own
//! implementations backed by real hardware.

pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod fs;
pub mod mm;

pub use cache::{AccessMode, BufferCache, Handle};
pub use config::Config;
pub use device::{BlockDevice, FileDisk, MemDisk};
pub use error::{KernelError, Result};
pub use fs::{FileSystem, OpenInode};
pub use mm::{
    Backing, FileBacking, FrameTable, HardwarePageTable, MappedFile, PagingFaultHandler,
    SimulatedPageTable, SpteKind, SupplementalPageTable, SPTE,
};

/// Install an `env_logger` subscriber for the `log` facade used throughout
/// this crate. Convenience hook for binaries and tests; library consumers
/// that already have their own subscriber installed should not call this.
pub fn init_logging() {
    let _ = env_logger::try_init();
}
