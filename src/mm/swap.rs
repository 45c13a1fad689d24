//! Bitmap-backed swap area: fixed-size page slots carved out of a region
//! of the block device, one bit per sector at sector granularity.
//!
//! Grounded on [`crate::fs::bitmap::Bitmap`] (shared with `SectorBitmap`);
//! the slot-over-sectors shape is cross-checked narratively against the
//! teacher's `betrusted-io-xous-core` swap module, though that file's
//! hardware/flash-specific ABI was not itself portable.

use crate::config::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::device::BlockDevice;
use crate::error::Result;
use crate::fs::bitmap::Bitmap;
use std::sync::Arc;

pub struct SwapArea {
    device: Arc<dyn BlockDevice>,
    base_sector: u64,
    bitmap: Bitmap,
}

impl SwapArea {
    pub fn new(device: Arc<dyn BlockDevice>, base_sector: u64, slot_count: usize) -> Self {
        SwapArea {
            device,
            base_sector,
            bitmap: Bitmap::new(slot_count * SECTORS_PER_PAGE),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.bitmap.len() / SECTORS_PER_PAGE
    }

    /// Write `page` to the first free slot. Panics if the swap area has no
    /// room left: per the spec this is fatal and unrecoverable.
    pub fn write(&self, page: &[u8; PAGE_SIZE]) -> Result<usize> {
        let start_bit = self
            .bitmap
            .allocate_contiguous(SECTORS_PER_PAGE)
            .unwrap_or_else(|| panic!("swap area exhausted"));
        for i in 0..SECTORS_PER_PAGE {
            let sector = self.base_sector + (start_bit + i) as u64;
            let mut buf = [0u8; SECTOR_SIZE];
            buf.copy_from_slice(&page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            if let Err(err) = self.device.write_sector(sector, &buf) {
                self.bitmap.free_range(start_bit, SECTORS_PER_PAGE);
                return Err(err);
            }
        }
        Ok(start_bit / SECTORS_PER_PAGE)
    }

    /// Read `slot` back into `page` and free it. Returns `false` without
    /// mutating `page` if the slot's bits aren't all set (a corruption
    /// guard against reading a slot that isn't actually occupied).
    pub fn read(&self, slot: usize, page: &mut [u8; PAGE_SIZE]) -> Result<bool> {
        let start_bit = slot * SECTORS_PER_PAGE;
        for i in 0..SECTORS_PER_PAGE {
            if !self.bitmap.is_allocated(start_bit + i) {
                return Ok(false);
            }
        }
        for i in 0..SECTORS_PER_PAGE {
            let sector = self.base_sector + (start_bit + i) as u64;
            let mut buf = [0u8; SECTOR_SIZE];
            self.device.read_sector(sector, &mut buf)?;
            page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&buf);
        }
        self.bitmap.free_range(start_bit, SECTORS_PER_PAGE);
        Ok(true)
    }

    pub fn free(&self, slot: usize) {
        self.bitmap.free_range(slot * SECTORS_PER_PAGE, SECTORS_PER_PAGE);
    }
}
