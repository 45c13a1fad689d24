//! Tunable parameters for the cache, frame table, and swap area.
//!
//! KeOS itself hardcodes these as `const` items; we pull them into one small
//! `Copy` struct so tests can shrink the cache/frame pool to exercise
//! eviction without touching global state.

use std::time::Duration;

/// Bytes per on-disk sector. Fixed by the on-disk format; not configurable.
pub const SECTOR_SIZE: usize = 512;

/// Bytes per virtual memory page. Fixed; variable page sizes are a spec
/// Non-goal.
pub const PAGE_SIZE: usize = 4096;

/// Sectors that make up one page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Direct block pointers held inline in a `DiskInode`.
pub const N_DIRECT: usize = 121;

/// Pointers held in one singly-indirect block.
pub const PTRS_PER_INDIRECT: usize = SECTOR_SIZE / std::mem::size_of::<u32>();

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Number of resident entries in the buffer cache.
    pub cache_capacity: usize,
    /// Period between automatic write-backs of dirty cache entries.
    pub flush_interval: Duration,
    /// Maximum number of read-ahead requests queued at once.
    pub readahead_queue_depth: usize,
    /// Number of physical frames managed by the frame table.
    pub frame_pool_size: usize,
    /// Number of page-sized slots in the swap area.
    pub swap_slots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_capacity: 64,
            flush_interval: Duration::from_secs(30),
            readahead_queue_depth: 32,
            frame_pool_size: 256,
            swap_slots: 1024,
        }
    }
}
