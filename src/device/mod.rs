//! Block device interface consumed by the buffer cache.
//!
//! `spec.md` declares the block device external; this module gives it a
//! concrete trait shape plus `MemDisk`, an in-memory stand-in used by the
//! whole test suite and by anything embedding this crate without real
//! hardware.

use crate::config::SECTOR_SIZE;
use crate::error::{KernelError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

pub type Sector = [u8; SECTOR_SIZE];

/// A random-access block device addressed by fixed-size sector number.
pub trait BlockDevice: Send + Sync {
    /// Read sector `sector` into `buf`. `buf` must be exactly `SECTOR_SIZE`.
    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` to sector `sector`. `buf` must be exactly `SECTOR_SIZE`.
    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<()>;

    /// Total number of addressable sectors on this device.
    fn sector_count(&self) -> u64;
}

/// In-memory `BlockDevice` backed by a flat vector of sectors.
pub struct MemDisk {
    sectors: Mutex<Vec<Sector>>,
}

impl MemDisk {
    pub fn new(sector_count: u64) -> Self {
        MemDisk {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; sector_count as usize]),
        }
    }
}

impl BlockDevice for MemDisk {
    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() != SECTOR_SIZE {
            return Err(KernelError::InvalidArgument("read_sector buf must be SECTOR_SIZE bytes"));
        }
        let sectors = self.sectors.lock().unwrap();
        let s = sectors
            .get(sector as usize)
            .ok_or(KernelError::InvalidSector(sector))?;
        buf.copy_from_slice(s);
        log::trace!("memdisk: read sector {sector}");
        Ok(())
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<()> {
        if buf.len() != SECTOR_SIZE {
            return Err(KernelError::InvalidArgument("write_sector buf must be SECTOR_SIZE bytes"));
        }
        let mut sectors = self.sectors.lock().unwrap();
        let s = sectors
            .get_mut(sector as usize)
            .ok_or(KernelError::InvalidSector(sector))?;
        s.copy_from_slice(buf);
        log::trace!("memdisk: wrote sector {sector}");
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        self.sectors.lock().unwrap().len() as u64
    }
}

/// `BlockDevice` backed by a real file, sized to an exact number of
/// sectors up front. For embedders that want this crate's cache/inode
/// layer to persist across process restarts rather than living purely in
/// memory.
pub struct FileDisk {
    file: Mutex<File>,
    sector_count: u64,
}

impl FileDisk {
    /// Open (creating if absent) `path` and extend it to exactly
    /// `sector_count * SECTOR_SIZE` bytes.
    pub fn open(path: impl AsRef<Path>, sector_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(sector_count * SECTOR_SIZE as u64)?;
        Ok(FileDisk {
            file: Mutex::new(file),
            sector_count,
        })
    }
}

impl BlockDevice for FileDisk {
    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() != SECTOR_SIZE {
            return Err(KernelError::InvalidArgument("read_sector buf must be SECTOR_SIZE bytes"));
        }
        if sector >= self.sector_count {
            return Err(KernelError::InvalidSector(sector));
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))
            .map_err(|source| KernelError::DiskIo { sector, source })?;
        file.read_exact(buf)
            .map_err(|source| KernelError::DiskIo { sector, source })?;
        Ok(())
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<()> {
        if buf.len() != SECTOR_SIZE {
            return Err(KernelError::InvalidArgument("write_sector buf must be SECTOR_SIZE bytes"));
        }
        if sector >= self.sector_count {
            return Err(KernelError::InvalidSector(sector));
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))
            .map_err(|source| KernelError::DiskIo { sector, source })?;
        file.write_all(buf)
            .map_err(|source| KernelError::DiskIo { sector, source })?;
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_sector() {
        let disk = MemDisk::new(4);
        let mut buf = [7u8; SECTOR_SIZE];
        disk.write_sector(2, &buf).unwrap();
        buf = [0u8; SECTOR_SIZE];
        disk.read_sector(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn rejects_out_of_range_sector() {
        let disk = MemDisk::new(1);
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(matches!(
            disk.read_sector(5, &mut buf),
            Err(KernelError::InvalidSector(5))
        ));
    }

    #[test]
    fn file_disk_round_trips_and_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        {
            let disk = FileDisk::open(&path, 8).unwrap();
            assert_eq!(disk.sector_count(), 8);
            disk.write_sector(3, &[0x5A; SECTOR_SIZE]).unwrap();
        }

        let disk = FileDisk::open(&path, 8).unwrap();
        let mut buf = [0u8; SECTOR_SIZE];
        disk.read_sector(3, &mut buf).unwrap();
        assert_eq!(buf, [0x5A; SECTOR_SIZE]);
    }

    #[test]
    fn file_disk_rejects_out_of_range_sector() {
        let dir = tempfile::tempdir().unwrap();
        let disk = FileDisk::open(dir.path().join("disk.img"), 2).unwrap();
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(matches!(
            disk.read_sector(9, &mut buf),
            Err(KernelError::InvalidSector(9))
        ));
    }
}
