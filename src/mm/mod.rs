//! Virtual-memory paging core: the physical frame pool, each process's
//! supplemental page table, the swap area, and the page-fault dispatcher
//! that ties them together.
//!
//! Grounded on the teacher's `keos-project3/src/lazy_pager.rs` (`MmLoader`
//! split between anonymous and file-backed pages, `PageFaultReason`
//! decoding) generalized from a single-process pager into the shared
//! `FrameTable` + per-process `SupplementalPageTable` split this spec
//! calls for.

pub mod fault;
pub mod frame;
pub mod spt;
pub mod swap;

pub use fault::{HardwarePageTable, PagingFaultHandler, SimulatedPageTable};
pub use frame::FrameTable;
pub use spt::{Backing, FileBacking, MappedFile, SpteKind, SupplementalPageTable, SPTE};
pub use swap::SwapArea;

/// Process identifier, as seen by the hardware page table abstraction.
pub type Pid = u64;
/// A user virtual page address. Always page-aligned by convention of the
/// external caller; this crate does not itself validate alignment.
pub type Va = usize;
/// A frame-table slot index, standing in for "kernel-visible address of a
/// physical page" in this hosted simulation (there is no real physical
/// memory to address).
pub type KernelAddr = usize;
