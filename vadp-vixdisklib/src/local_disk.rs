//! Flat local disk image backend
//!
//! Implements the disk traits on top of a plain file, for `-l` local mode
//! and for tests. Sparse regions of the image are reported through the
//! allocation query using `SEEK_DATA`/`SEEK_HOLE`; filesystems without hole
//! support report the whole range as allocated.
//!
//! Metadata emulation follows the library's conventions: values read back
//! carry a terminating NUL, values written may or may not carry one.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};
use log::debug;
use nix::unistd::{lseek, Whence};

use crate::{
    BlockExtent, DiskGeometry, DiskInfo, DiskRead, DiskType, DiskWrite,
    ADAPTER_TYPE_SCSI_BUSLOGIC, VIXDISKLIB_SECTOR_SIZE,
};

// Classic translated geometry for flat images.
const DISK_HEADS: u32 = 16;
const DISK_SECTORS_PER_TRACK: u32 = 63;

/// A local flat disk image.
pub struct LocalDisk {
    file: File,
    info: DiskInfo,
    metadata: BTreeMap<String, Vec<u8>>,
    path: PathBuf,
}

fn synthesize_geometry(capacity: u64) -> DiskGeometry {
    let cylinders = capacity / (DISK_HEADS as u64 * DISK_SECTORS_PER_TRACK as u64);
    DiskGeometry {
        cylinders: cylinders.min(u32::MAX as u64) as u32,
        heads: DISK_HEADS,
        sectors: DISK_SECTORS_PER_TRACK,
    }
}

impl LocalDisk {
    /// Open an existing image. The image size must be a whole number of
    /// sectors.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|err| anyhow::format_err!("failed to open {}: {}", path.display(), err))?;

        let len = file.metadata()?.len();
        if len % VIXDISKLIB_SECTOR_SIZE != 0 {
            bail!(
                "local disk image {} is not a whole number of sectors ({} bytes)",
                path.display(),
                len
            );
        }

        Ok(Self::with_file(file, len / VIXDISKLIB_SECTOR_SIZE, path))
    }

    /// Create a new image of `capacity_sectors` sectors. All supported disk
    /// types are stored flat; sparse types simply start out as a hole.
    pub fn create<P: AsRef<Path>>(
        path: P,
        capacity_sectors: u64,
        disk_type: DiskType,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        debug!(
            "creating local disk image {} ({} sectors, {:?})",
            path.display(),
            capacity_sectors,
            disk_type
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|err| anyhow::format_err!("failed to create {}: {}", path.display(), err))?;
        file.set_len(capacity_sectors * VIXDISKLIB_SECTOR_SIZE)?;

        Ok(Self::with_file(file, capacity_sectors, path))
    }

    fn with_file(file: File, capacity: u64, path: &Path) -> Self {
        let geometry = synthesize_geometry(capacity);
        Self {
            file,
            info: DiskInfo {
                bios_geo: geometry,
                phys_geo: geometry,
                capacity,
                adapter_type: ADAPTER_TYPE_SCSI_BUSLOGIC,
            },
            metadata: BTreeMap::new(),
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seed a metadata key, e.g. before dumping in tests.
    pub fn set_metadata(&mut self, key: &str, value: &[u8]) {
        self.metadata.insert(key.to_string(), value.to_vec());
    }

    /// Metadata currently stored on the disk (without trailing NULs).
    pub fn metadata(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.metadata
    }

    fn check_bounds(&self, sector_offset: u64, len: usize) -> Result<u64, Error> {
        if len as u64 % VIXDISKLIB_SECTOR_SIZE != 0 {
            bail!("disk I/O buffer not sector aligned ({} bytes)", len);
        }
        let sectors = len as u64 / VIXDISKLIB_SECTOR_SIZE;
        if sector_offset + sectors > self.info.capacity {
            bail!(
                "disk I/O beyond end of image (sector {} + {} > {})",
                sector_offset,
                sectors,
                self.info.capacity
            );
        }
        Ok(sector_offset * VIXDISKLIB_SECTOR_SIZE)
    }
}

fn push_block(blocks: &mut Vec<BlockExtent>, block: BlockExtent) {
    if let Some(last) = blocks.last_mut() {
        if last.offset + last.length >= block.offset {
            let end = (block.offset + block.length).max(last.offset + last.length);
            last.length = end - last.offset;
            return;
        }
    }
    blocks.push(block);
}

impl DiskRead for LocalDisk {
    fn info(&self) -> &DiskInfo {
        &self.info
    }

    fn transport_mode(&self) -> String {
        String::from("file")
    }

    fn read_sectors(&mut self, sector_offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let offset = self.check_bounds(sector_offset, buf.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn metadata_keys(&mut self) -> Result<Vec<String>, Error> {
        Ok(self.metadata.keys().cloned().collect())
    }

    fn read_metadata(&mut self, key: &str) -> Result<Vec<u8>, Error> {
        let mut value = match self.metadata.get(key) {
            Some(value) => value.clone(),
            None => bail!("no metadata for key {}", key),
        };
        value.push(0);
        Ok(value)
    }

    fn query_allocated_blocks(
        &mut self,
        start_sector: u64,
        num_sectors: u64,
        chunk_size: u64,
    ) -> Result<Vec<BlockExtent>, Error> {
        let start = start_sector * VIXDISKLIB_SECTOR_SIZE;
        let end = start + num_sectors * VIXDISKLIB_SECTOR_SIZE;
        let chunk_bytes = chunk_size * VIXDISKLIB_SECTOR_SIZE;
        let fd = self.file.as_raw_fd();

        let mut blocks = Vec::new();
        let mut pos = start;
        while pos < end {
            let data = match lseek(fd, pos as i64, Whence::SeekData) {
                Ok(offset) => offset as u64,
                // Past the last data region.
                Err(nix::errno::Errno::ENXIO) => break,
                // Filesystem without hole support: everything is data.
                Err(_) => {
                    push_block(
                        &mut blocks,
                        BlockExtent {
                            offset: pos / VIXDISKLIB_SECTOR_SIZE,
                            length: (end - pos) / VIXDISKLIB_SECTOR_SIZE,
                        },
                    );
                    break;
                }
            };
            if data >= end {
                break;
            }
            let hole = match lseek(fd, data as i64, Whence::SeekHole) {
                Ok(offset) => (offset as u64).min(end),
                Err(_) => end,
            };

            // Report at chunk granularity, like the library does.
            let aligned_start = start + (data - start) / chunk_bytes * chunk_bytes;
            let aligned_end =
                (start + (hole - start + chunk_bytes - 1) / chunk_bytes * chunk_bytes).min(end);
            push_block(
                &mut blocks,
                BlockExtent {
                    offset: aligned_start / VIXDISKLIB_SECTOR_SIZE,
                    length: (aligned_end - aligned_start) / VIXDISKLIB_SECTOR_SIZE,
                },
            );
            pos = aligned_end;
        }

        Ok(blocks)
    }
}

impl DiskWrite for LocalDisk {
    fn info(&self) -> &DiskInfo {
        &self.info
    }

    fn write_sectors(&mut self, sector_offset: u64, buf: &[u8]) -> Result<(), Error> {
        let offset = self.check_bounds(sector_offset, buf.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn write_metadata(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        let stripped = match value.split_last() {
            Some((0, rest)) => rest,
            _ => value,
        };
        self.metadata.insert(key.to_string(), stripped.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sector_io_roundtrip() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("disk.img");

        let mut disk = LocalDisk::create(&path, 16, DiskType::MonolithicFlat)?;
        let data = vec![0xabu8; 2 * VIXDISKLIB_SECTOR_SIZE as usize];
        disk.write_sectors(4, &data)?;

        let mut readback = vec![0u8; data.len()];
        disk.read_sectors(4, &mut readback)?;
        assert_eq!(readback, data);

        // Out of bounds and unaligned access are rejected.
        assert!(disk.read_sectors(15, &mut readback).is_err());
        assert!(disk.read_sectors(0, &mut readback[..100]).is_err());
        Ok(())
    }

    #[test]
    fn reopen_checks_size() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("disk.img");

        LocalDisk::create(&path, 8, DiskType::MonolithicFlat)?;
        let disk = LocalDisk::open(&path, true)?;
        assert_eq!(disk.info().capacity, 8);

        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)?
            .set_len(8 * VIXDISKLIB_SECTOR_SIZE + 100)?;
        assert!(LocalDisk::open(&path, true).is_err());
        Ok(())
    }

    #[test]
    fn fully_written_image_is_fully_allocated() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("disk.img");

        let mut disk = LocalDisk::create(&path, 8, DiskType::MonolithicFlat)?;
        let data = vec![1u8; 8 * VIXDISKLIB_SECTOR_SIZE as usize];
        disk.write_sectors(0, &data)?;

        let blocks = disk.query_allocated_blocks(0, 8, 2)?;
        assert_eq!(
            blocks,
            vec![BlockExtent {
                offset: 0,
                length: 8
            }]
        );
        Ok(())
    }

    #[test]
    fn metadata_read_appends_nul() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("disk.img");

        let mut disk = LocalDisk::create(&path, 1, DiskType::MonolithicFlat)?;
        disk.set_metadata("uuid", b"ABC");
        assert_eq!(disk.read_metadata("uuid")?, b"ABC\0");

        disk.write_metadata("type", b"thin\0")?;
        assert_eq!(disk.metadata()["type"], b"thin");
        assert_eq!(disk.metadata_keys()?, vec!["type", "uuid"]);
        Ok(())
    }
}
