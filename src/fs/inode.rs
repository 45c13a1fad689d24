//! In-memory inode state, open/close lifecycle, byte-offset read/write, and
//! the free-sector allocator, all layered on top of [`BufferCache`].
//!
//! Grounded on the teacher's `ffs::inode::Inode` (`from_disk_layout`,
//! `Inode::get` indirect traversal) and `ffs::disk_layout`'s
//! `BlockBitmap`/`InodeBitmap`, simplified to this spec's single-sector,
//! non-journaled inode and a generic sector-granularity free bitmap.

use crate::cache::{AccessMode, BufferCache};
use crate::config::{N_DIRECT, PTRS_PER_INDIRECT, SECTOR_SIZE};
use crate::error::{KernelError, Result};
use crate::fs::bitmap::Bitmap;
use crate::fs::disk_inode::{is_hole, BlockLocator, DiskInode, IndirectBlock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Free-sector allocator over the portion of the device available for
/// inode and data sectors (sectors below `base` are reserved, per
/// `spec.md` §3: sector 0 is the bitmap file's inode, sector 1 the root
/// directory's).
pub struct SectorBitmap {
    bitmap: Bitmap,
    base: u64,
}

impl SectorBitmap {
    pub fn new(total_sectors: u64, base: u64) -> Self {
        let usable = total_sectors.saturating_sub(base);
        SectorBitmap {
            bitmap: Bitmap::new(usable as usize),
            base,
        }
    }

    pub fn allocate(&self) -> Option<u64> {
        self.bitmap.allocate_one().map(|idx| self.base + idx as u64)
    }

    pub fn free(&self, sector: u64) {
        self.bitmap.free((sector - self.base) as usize);
    }
}

struct OpenInodeState {
    open_count: u32,
    removed: bool,
    deny_write_cnt: u32,
    length: u64,
}

/// In-memory handle on an open inode. Singleton per sector while any
/// caller holds it open: see [`FileSystem::inode_open`].
pub struct OpenInode {
    sector: u64,
    state: Mutex<OpenInodeState>,
    /// Serialises `lookup`/`add`/`remove` on this inode when it is used as
    /// a directory; the directory-record format itself lives outside this
    /// crate, but the lock it must take is exposed here.
    dir_lock: Mutex<()>,
}

impl OpenInode {
    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub fn length(&self) -> u64 {
        self.state.lock().unwrap().length
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().unwrap().removed
    }

    pub fn mark_removed(&self) {
        self.state.lock().unwrap().removed = true;
    }

    pub fn deny_write(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.deny_write_cnt < state.open_count);
        state.deny_write_cnt += 1;
    }

    pub fn allow_write(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.deny_write_cnt > 0);
        state.deny_write_cnt -= 1;
    }

    pub fn directory_lock(&self) -> &Mutex<()> {
        &self.dir_lock
    }
}

/// Owns the buffer cache and the inode/open-file bookkeeping layered on
/// top of it.
pub struct FileSystem {
    pub cache: BufferCache,
    sector_bitmap: SectorBitmap,
    open_inodes: Mutex<HashMap<u64, Arc<OpenInode>>>,
}

impl FileSystem {
    pub fn new(cache: BufferCache, total_sectors: u64) -> Self {
        FileSystem {
            cache,
            sector_bitmap: SectorBitmap::new(total_sectors, super::FIRST_FREE_SECTOR),
            open_inodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn sector_bitmap(&self) -> &SectorBitmap {
        &self.sector_bitmap
    }

    /// Allocate the data/indirect sectors for a new inode of `length`
    /// bytes at the already-chosen home `sector`, and write its
    /// `DiskInode`. All-or-nothing: any allocation failure along the way
    /// releases every sector claimed so far.
    pub fn inode_create(&self, sector: u64, length: u64, is_file: bool) -> Result<()> {
        let data_sectors = ((length + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64) as usize;
        if data_sectors as u64 > DiskInode::block_capacity() {
            return Err(KernelError::InvalidArgument("length exceeds max file size"));
        }

        let mut claimed: Vec<u64> = Vec::new();
        let built = self.build_inode(length, is_file, data_sectors, &mut claimed);
        match built {
            Ok(disk) => match self.write_disk_inode(sector, &disk) {
                Ok(()) => Ok(()),
                Err(err) => {
                    self.rollback(&claimed);
                    Err(err)
                }
            },
            Err(err) => {
                self.rollback(&claimed);
                Err(err)
            }
        }
    }

    fn rollback(&self, claimed: &[u64]) {
        for &s in claimed {
            self.sector_bitmap.free(s);
        }
    }

    fn allocate_one(&self, claimed: &mut Vec<u64>) -> Result<u64> {
        let s = self
            .sector_bitmap
            .allocate()
            .ok_or(KernelError::NoFreeSector(0))?;
        claimed.push(s);
        Ok(s)
    }

    fn zero_sector(&self, sector: u64) -> Result<()> {
        let handle = self.cache.get_new(sector, AccessMode::Exclusive)?;
        handle.release();
        Ok(())
    }

    fn write_indirect(&self, sector: u64, block: &IndirectBlock) -> Result<()> {
        let mut handle = self.cache.get_new(sector, AccessMode::Exclusive)?;
        handle.write(&block.to_bytes());
        handle.release();
        Ok(())
    }

    fn read_indirect(&self, sector: u64) -> Result<IndirectBlock> {
        let handle = self.cache.get(sector, AccessMode::Shared)?;
        let block = IndirectBlock::from_bytes(&handle.data());
        handle.release();
        Ok(block)
    }

    fn read_disk_inode(&self, sector: u64) -> Result<DiskInode> {
        let handle = self.cache.get(sector, AccessMode::Shared)?;
        let disk = DiskInode::from_bytes(&handle.data())?;
        handle.release();
        Ok(disk)
    }

    fn write_disk_inode(&self, sector: u64, disk: &DiskInode) -> Result<()> {
        let mut handle = self.cache.get_new(sector, AccessMode::Exclusive)?;
        handle.write(&disk.to_bytes());
        handle.release();
        Ok(())
    }

    fn build_inode(
        &self,
        length: u64,
        is_file: bool,
        data_sectors: usize,
        claimed: &mut Vec<u64>,
    ) -> Result<DiskInode> {
        let mut disk = DiskInode::new(is_file);
        disk.length = length;

        let direct_needed = data_sectors.min(N_DIRECT);
        for i in 0..direct_needed {
            let s = self.allocate_one(claimed)?;
            self.zero_sector(s)?;
            disk.direct[i] = s as u32;
        }
        let mut remaining = data_sectors.saturating_sub(N_DIRECT);

        if remaining > 0 {
            let indirect_sector = self.allocate_one(claimed)?;
            let mut block = IndirectBlock::empty();
            let n = remaining.min(PTRS_PER_INDIRECT);
            for slot in block.ptrs.iter_mut().take(n) {
                let s = self.allocate_one(claimed)?;
                self.zero_sector(s)?;
                *slot = s as u32;
            }
            self.write_indirect(indirect_sector, &block)?;
            disk.indirect = indirect_sector as u32;
            remaining -= n;
        }

        if remaining > 0 {
            let doubly_sector = self.allocate_one(claimed)?;
            let mut outer = IndirectBlock::empty();
            let mut outer_idx = 0usize;
            while remaining > 0 {
                let inner_sector = self.allocate_one(claimed)?;
                let mut inner = IndirectBlock::empty();
                let n = remaining.min(PTRS_PER_INDIRECT);
                for slot in inner.ptrs.iter_mut().take(n) {
                    let s = self.allocate_one(claimed)?;
                    self.zero_sector(s)?;
                    *slot = s as u32;
                }
                self.write_indirect(inner_sector, &inner)?;
                outer.ptrs[outer_idx] = inner_sector as u32;
                outer_idx += 1;
                remaining -= n;
            }
            self.write_indirect(doubly_sector, &outer)?;
            disk.doubly_indirect = doubly_sector as u32;
        }

        Ok(disk)
    }

    fn resolve_sector(&self, disk: &DiskInode, idx: usize) -> Result<Option<u32>> {
        match disk.block_index(idx) {
            BlockLocator::Direct(i) => Ok(non_hole(disk.direct[i])),
            BlockLocator::Indirect(i) => {
                if is_hole(disk.indirect) {
                    return Ok(None);
                }
                let block = self.read_indirect(disk.indirect as u64)?;
                Ok(non_hole(block.ptrs[i]))
            }
            BlockLocator::DoublyIndirect(outer, inner) => {
                if is_hole(disk.doubly_indirect) {
                    return Ok(None);
                }
                let outer_block = self.read_indirect(disk.doubly_indirect as u64)?;
                let mid = outer_block.ptrs[outer];
                if is_hole(mid) {
                    return Ok(None);
                }
                let inner_block = self.read_indirect(mid as u64)?;
                Ok(non_hole(inner_block.ptrs[inner]))
            }
        }
    }

    /// Open the inode at `sector`, returning the shared process-wide
    /// singleton for it and bumping its open count.
    pub fn inode_open(&self, sector: u64) -> Result<Arc<OpenInode>> {
        let mut table = self.open_inodes.lock().unwrap();
        if let Some(existing) = table.get(&sector) {
            existing.state.lock().unwrap().open_count += 1;
            return Ok(existing.clone());
        }
        let disk = self.read_disk_inode(sector)?;
        let open = Arc::new(OpenInode {
            sector,
            state: Mutex::new(OpenInodeState {
                open_count: 1,
                removed: false,
                deny_write_cnt: 0,
                length: disk.length,
            }),
            dir_lock: Mutex::new(()),
        });
        table.insert(sector, open.clone());
        Ok(open)
    }

    /// Close one reference to `inode`. When the open count reaches zero
    /// and the inode was marked removed, releases all of its data,
    /// indirect, and inode sectors.
    pub fn inode_close(&self, inode: Arc<OpenInode>) -> Result<()> {
        let (should_deallocate, sector) = {
            let mut table = self.open_inodes.lock().unwrap();
            let mut state = inode.state.lock().unwrap();
            state.open_count -= 1;
            let reached_zero = state.open_count == 0;
            let removed = state.removed;
            drop(state);
            if reached_zero {
                table.remove(&inode.sector);
            }
            (reached_zero && removed, inode.sector)
        };
        if should_deallocate {
            self.deallocate(sector)?;
        }
        Ok(())
    }

    fn deallocate(&self, sector: u64) -> Result<()> {
        let disk = self.read_disk_inode(sector)?;
        for &d in disk.direct.iter() {
            if !is_hole(d) {
                self.sector_bitmap.free(d as u64);
            }
        }
        if !is_hole(disk.indirect) {
            let block = self.read_indirect(disk.indirect as u64)?;
            for &p in block.ptrs.iter() {
                if !is_hole(p) {
                    self.sector_bitmap.free(p as u64);
                }
            }
            self.sector_bitmap.free(disk.indirect as u64);
        }
        if !is_hole(disk.doubly_indirect) {
            let outer = self.read_indirect(disk.doubly_indirect as u64)?;
            for &o in outer.ptrs.iter() {
                if is_hole(o) {
                    continue;
                }
                let inner = self.read_indirect(o as u64)?;
                for &p in inner.ptrs.iter() {
                    if !is_hole(p) {
                        self.sector_bitmap.free(p as u64);
                    }
                }
                self.sector_bitmap.free(o as u64);
            }
            self.sector_bitmap.free(disk.doubly_indirect as u64);
        }
        self.sector_bitmap.free(sector);
        Ok(())
    }

    /// Read up to `buf.len()` bytes starting at `offset`. Short of EOF is a
    /// normal, non-error result.
    pub fn read_at(&self, inode: &OpenInode, buf: &mut [u8], offset: u64) -> Result<usize> {
        let length = inode.length();
        if offset >= length {
            return Ok(0);
        }
        let end = (offset + buf.len() as u64).min(length);
        let disk = self.read_disk_inode(inode.sector())?;
        let mut pos = offset;
        let mut total = 0usize;
        while pos < end {
            let sector_index = (pos / SECTOR_SIZE as u64) as usize;
            let sector_offset = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = ((SECTOR_SIZE - sector_offset) as u64).min(end - pos) as usize;
            match self.resolve_sector(&disk, sector_index)? {
                Some(s) => {
                    let handle = self.cache.get(s as u64, AccessMode::Shared)?;
                    let data = handle.data();
                    buf[total..total + chunk].copy_from_slice(&data[sector_offset..sector_offset + chunk]);
                    handle.release();

                    // spec.md §4.1: a regular `get` may enqueue the next
                    // sector of a sequential read for the background
                    // read-ahead worker to warm.
                    let next_index = sector_index + 1;
                    if (next_index as u64) * SECTOR_SIZE as u64 < length {
                        if let Ok(Some(next_sector)) = self.resolve_sector(&disk, next_index) {
                            self.cache.request_readahead(next_sector as u64);
                        }
                    }
                }
                None => {
                    for b in &mut buf[total..total + chunk] {
                        *b = 0;
                    }
                }
            }
            pos += chunk as u64;
            total += chunk;
        }
        Ok(total)
    }

    /// Write up to `buf.len()` bytes starting at `offset`. Never extends
    /// the file past its current length (growth is a spec Non-goal);
    /// bytes past EOF are silently dropped. Returns 0 without side effects
    /// if writes are currently denied.
    pub fn write_at(&self, inode: &OpenInode, buf: &[u8], offset: u64) -> Result<usize> {
        let (length, denied) = {
            let state = inode.state.lock().unwrap();
            (state.length, state.deny_write_cnt > 0)
        };
        if denied {
            return Ok(0);
        }
        if offset >= length {
            return Ok(0);
        }
        let end = (offset + buf.len() as u64).min(length);
        let disk = self.read_disk_inode(inode.sector())?;
        let mut pos = offset;
        let mut total = 0usize;
        while pos < end {
            let sector_index = (pos / SECTOR_SIZE as u64) as usize;
            let sector_offset = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = ((SECTOR_SIZE - sector_offset) as u64).min(end - pos) as usize;
            let sector = self.resolve_sector(&disk, sector_index)?.ok_or(
                KernelError::Corruption("write_at target sector within file length is unallocated"),
            )?;
            let mut handle = self.cache.get(sector as u64, AccessMode::Exclusive)?;
            let mut data = handle.data();
            data[sector_offset..sector_offset + chunk].copy_from_slice(&buf[total..total + chunk]);
            handle.write(&data);
            handle.release();
            pos += chunk as u64;
            total += chunk;
        }
        Ok(total)
    }
}

fn non_hole(v: u32) -> Option<u32> {
    if is_hole(v) {
        None
    } else {
        Some(v)
    }
}
