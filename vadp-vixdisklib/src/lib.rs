//! Access layer for VMware virtual disks
//!
//! This crate wraps the vStorage APIs for Data Protection disk library
//! (`vixDiskLib`). The [`DiskRead`] and [`DiskWrite`] traits are the seam
//! between the dumper and the disk transport: the real library backend
//! (behind the `vddk` cargo feature, since the shared object is proprietary
//! and not present on build hosts) and the always available
//! [`LocalDisk`] flat-image backend both implement them.

use std::str::FromStr;

use anyhow::{bail, Error};

#[cfg(feature = "vddk")]
pub mod ffi;

#[cfg(feature = "vddk")]
mod session;
#[cfg(feature = "vddk")]
pub use session::*;

mod local_disk;
pub use local_disk::*;

/// vixDiskLib does all processing in sectors of 512 bytes.
pub const VIXDISKLIB_SECTOR_SIZE: u64 = 512;

/// Smallest chunk size (in sectors) the library accepts for allocation
/// queries - 64 KiB.
pub const VIXDISKLIB_MIN_CHUNK_SIZE: u64 = 128;

/// Upper bound on the number of chunks a single allocation query may cover.
pub const VIXDISKLIB_MAX_CHUNK_NUMBER: u64 = 512 * 1024;

/// Minimum library version we require, i.e. vSphere 6.5 or later.
pub const VIXDISKLIB_VERSION_MAJOR: u32 = 6;
pub const VIXDISKLIB_VERSION_MINOR: u32 = 5;

/// Identity string registered on the VM while we hold disk access
/// (`PrepareForAccess`/`EndAccess`).
pub const VADP_DUMPER_IDENTITY: &str = "VadpDumper";

/// Process exit code used when the library panic callback fires.
pub const VDDK_PANIC_EXIT_CODE: i32 = 10;

// Adapter types as defined by vixDiskLib.
pub const ADAPTER_TYPE_IDE: u32 = 1;
pub const ADAPTER_TYPE_SCSI_BUSLOGIC: u32 = 2;
pub const ADAPTER_TYPE_SCSI_LSILOGIC: u32 = 3;
pub const ADAPTER_TYPE_UNKNOWN: u32 = 256;

/// Cylinders/heads/sectors triple as reported by the library.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
}

/// Geometry and capacity of an open disk, cached once per open handle.
#[derive(Debug, Clone, Default)]
pub struct DiskInfo {
    pub bios_geo: DiskGeometry,
    pub phys_geo: DiskGeometry,
    /// Capacity in sectors.
    pub capacity: u64,
    /// Raw adapter type value (`ADAPTER_TYPE_*`).
    pub adapter_type: u32,
}

impl DiskInfo {
    /// Capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity * VIXDISKLIB_SECTOR_SIZE
    }
}

/// A run of allocated sectors, as returned by allocation queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExtent {
    /// First sector of the run.
    pub offset: u64,
    /// Length of the run in sectors.
    pub length: u64,
}

/// Disk types understood by `VixDiskLib_Create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DiskType {
    MonolithicSparse = 1,
    MonolithicFlat = 2,
    SplitSparse = 3,
    SplitFlat = 4,
    VmfsFlat = 5,
    VmfsSparse = 6,
    VmfsThin = 7,
    StreamOptimized = 8,
}

const DISK_TYPE_NAMES: &[(&str, DiskType)] = &[
    ("monolithic_sparse", DiskType::MonolithicSparse),
    ("monolithic_flat", DiskType::MonolithicFlat),
    ("split_sparse", DiskType::SplitSparse),
    ("split_flat", DiskType::SplitFlat),
    ("vmfs_flat", DiskType::VmfsFlat),
    ("optimized", DiskType::StreamOptimized),
    ("vmfs_thin", DiskType::VmfsThin),
    ("vmfs_sparse", DiskType::VmfsSparse),
];

impl FromStr for DiskType {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Error> {
        for (type_name, disk_type) in DISK_TYPE_NAMES {
            if type_name.eq_ignore_ascii_case(name) {
                return Ok(*disk_type);
            }
        }
        bail!("unknown disktype '{}'", name);
    }
}

/// Read side of an open virtual disk.
pub trait DiskRead: Send {
    /// Cached geometry and capacity.
    fn info(&self) -> &DiskInfo;

    /// Name of the transport carrying the data (nbd, san, hotadd, file, ...).
    fn transport_mode(&self) -> String;

    /// Read `buf.len()` bytes starting at `sector_offset`. The buffer length
    /// must be a multiple of the sector size.
    fn read_sectors(&mut self, sector_offset: u64, buf: &mut [u8]) -> Result<(), Error>;

    /// All metadata keys present on the disk.
    fn metadata_keys(&mut self) -> Result<Vec<String>, Error>;

    /// Raw metadata value for `key`, including the terminating NUL the
    /// library appends.
    fn read_metadata(&mut self, key: &str) -> Result<Vec<u8>, Error>;

    /// Query which sectors within `[start_sector, start_sector + num_sectors)`
    /// are allocated, at `chunk_size` sector granularity. The result is
    /// sorted and disjoint.
    fn query_allocated_blocks(
        &mut self,
        start_sector: u64,
        num_sectors: u64,
        chunk_size: u64,
    ) -> Result<Vec<BlockExtent>, Error>;
}

/// Write side of an open virtual disk.
pub trait DiskWrite: Send {
    /// Cached geometry and capacity.
    fn info(&self) -> &DiskInfo;

    /// Write `buf` starting at `sector_offset`. The buffer length must be a
    /// multiple of the sector size.
    fn write_sectors(&mut self, sector_offset: u64, buf: &[u8]) -> Result<(), Error>;

    /// Set metadata `key` to `value`. A trailing NUL in `value` is not part
    /// of the data.
    fn write_metadata(&mut self, key: &str, value: &[u8]) -> Result<(), Error>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disk_type_lookup() {
        assert_eq!(
            "monolithic_sparse".parse::<DiskType>().unwrap(),
            DiskType::MonolithicSparse
        );
        assert_eq!(
            "OPTIMIZED".parse::<DiskType>().unwrap(),
            DiskType::StreamOptimized
        );
        assert_eq!("vmfs_thin".parse::<DiskType>().unwrap(), DiskType::VmfsThin);
        assert!("qcow2".parse::<DiskType>().is_err());
    }

    #[test]
    fn capacity_conversion() {
        let info = DiskInfo {
            capacity: 3,
            ..Default::default()
        };
        assert_eq!(info.capacity_bytes(), 1536);
    }
}
