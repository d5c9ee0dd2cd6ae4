//! On-wire container format of backup streams
//!
//! A stream consists of one [`DiskInfoHeader`], zero or more metadata
//! records, a metadata terminator and zero or more data chunks:
//!
//! `| DiskInfoHeader | ( MetaDataHeader key value )* | terminator | ( ChunkHeader data )* |`
//!
//! Every record starts and ends with the same 32 bit magic marker; all
//! integers are little endian.

use std::io::{Read, Write};

use anyhow::{bail, Context, Error};
use endian_trait::Endian;
use log::debug;

use vadp_vixdisklib::{DiskInfo, VIXDISKLIB_SECTOR_SIZE};

use crate::tools::{read_le_value, read_le_value_or_eof, write_le_value};

/// Marker framing every record in the stream.
pub const VADP_STREAM_MAGIC: u32 = 0x1212_2012;

/// Version of the container format.
pub const VADP_PROTOCOL_VERSION: u32 = 1;

/// Identification record at the start of every stream, 128 bytes with
/// padding.
#[derive(Endian, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C, packed)]
pub struct DiskInfoHeader {
    pub start_magic: u32,
    pub protocol_version: u32,
    pub absolute_disk_length: u64,
    pub absolute_start_offset: u64,
    pub bios_cylinders: u32,
    pub bios_heads: u32,
    pub bios_sectors: u32,
    pub phys_cylinders: u32,
    pub phys_heads: u32,
    pub phys_sectors: u32,
    pub phys_capacity: u64,
    pub adapter_type: u32,
    pub padding: [u32; 16],
    pub end_magic: u32,
}

/// Record framing one metadata key/value pair. A record with both lengths
/// zero terminates the metadata section and carries no payload.
#[derive(Endian, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C, packed)]
pub struct MetaDataHeader {
    pub start_magic: u32,
    /// Length of the key including its terminating NUL.
    pub key_length: u32,
    pub data_length: u32,
    pub end_magic: u32,
}

/// Record framing one run of sector data.
#[derive(Endian, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C, packed)]
pub struct ChunkHeader {
    pub start_magic: u32,
    /// Byte offset of the run, relative to the stream's start offset.
    pub start_offset: u64,
    /// Length of the following payload in bytes, a whole number of sectors.
    pub length: u64,
    pub end_magic: u32,
}

fn check_magic(name: &str, which: &str, magic: u32) -> Result<(), Error> {
    if magic != VADP_STREAM_MAGIC {
        bail!(
            "[{}] invalid {} magic marker, read 0x{:08x} expected 0x{:08x}",
            name,
            which,
            magic,
            VADP_STREAM_MAGIC
        );
    }
    Ok(())
}

impl DiskInfoHeader {
    pub const SIZE: usize = 128;

    /// Build the header from the source disk's geometry and the work file's
    /// length/offset. BIOS axes the source does not report fall back to the
    /// physical geometry.
    pub fn new(info: &DiskInfo, disk_length: u64, start_offset: u64) -> Self {
        Self {
            start_magic: VADP_STREAM_MAGIC,
            protocol_version: VADP_PROTOCOL_VERSION,
            absolute_disk_length: disk_length,
            absolute_start_offset: start_offset,
            bios_cylinders: if info.bios_geo.cylinders > 0 {
                info.bios_geo.cylinders
            } else {
                info.phys_geo.cylinders
            },
            bios_heads: if info.bios_geo.heads > 0 {
                info.bios_geo.heads
            } else {
                info.phys_geo.heads
            },
            bios_sectors: if info.bios_geo.sectors > 0 {
                info.bios_geo.sectors
            } else {
                info.phys_geo.sectors
            },
            phys_cylinders: info.phys_geo.cylinders,
            phys_heads: info.phys_geo.heads,
            phys_sectors: info.phys_geo.sectors,
            phys_capacity: info.capacity,
            adapter_type: info.adapter_type,
            padding: [0u32; 16],
            end_magic: VADP_STREAM_MAGIC,
        }
    }

    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), Error> {
        write_le_value(writer, *self).context("failed to write disk info header to datastream")
    }

    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let header: Self = unsafe { read_le_value(reader) }
            .context("failed to read a valid disk info header")?;
        header.check()?;
        Ok(header)
    }

    fn check(&self) -> Result<(), Error> {
        check_magic("disk info header", "start", self.start_magic)?;
        check_magic("disk info header", "end", self.end_magic)?;
        Ok(())
    }

    /// Dump the decoded header for verbose mode.
    pub fn log_contents(&self) {
        debug!("Protocol version = {}", { self.protocol_version });
        debug!("Absolute disk length = {}", { self.absolute_disk_length });
        debug!("Absolute start offset = {}", { self.absolute_start_offset });
        debug!(
            "BIOS geometry ({} cyl, {} heads, {} sectors)",
            { self.bios_cylinders },
            { self.bios_heads },
            { self.bios_sectors }
        );
        debug!(
            "PHYS geometry ({} cyl, {} heads, {} sectors)",
            { self.phys_cylinders },
            { self.phys_heads },
            { self.phys_sectors }
        );
        debug!("Physical capacity {}", { self.phys_capacity });
        debug!("Adapter Type {}", { self.adapter_type });
    }
}

impl MetaDataHeader {
    pub const SIZE: usize = 16;

    pub fn new(key_length: u32, data_length: u32) -> Self {
        Self {
            start_magic: VADP_STREAM_MAGIC,
            key_length,
            data_length,
            end_magic: VADP_STREAM_MAGIC,
        }
    }

    /// The record ending the metadata section.
    pub fn terminator() -> Self {
        Self::new(0, 0)
    }

    pub fn is_terminator(&self) -> bool {
        self.key_length == 0 && self.data_length == 0
    }

    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), Error> {
        write_le_value(writer, *self).context("failed to write meta data header to datastream")
    }

    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let header: Self = unsafe { read_le_value(reader) }
            .context("failed to read meta data header from datastream")?;
        check_magic("meta data header", "start", header.start_magic)?;
        check_magic("meta data header", "end", header.end_magic)?;
        Ok(header)
    }
}

impl ChunkHeader {
    pub const SIZE: usize = 24;

    pub fn new(start_offset: u64, length: u64) -> Self {
        Self {
            start_magic: VADP_STREAM_MAGIC,
            start_offset,
            length,
            end_magic: VADP_STREAM_MAGIC,
        }
    }

    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), Error> {
        write_le_value(writer, *self).context("failed to write chunk header to datastream")
    }

    /// Read the next chunk header; a clean end of stream yields `None`.
    pub fn read_from_or_eof<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Self>, Error> {
        let header: Self = match unsafe { read_le_value_or_eof(reader) }
            .context("failed to read chunk header from datastream")?
        {
            Some(header) => header,
            None => return Ok(None),
        };
        header.check()?;
        Ok(Some(header))
    }

    fn check(&self) -> Result<(), Error> {
        check_magic("chunk header", "start", self.start_magic)?;
        check_magic("chunk header", "end", self.end_magic)?;
        if self.length % VIXDISKLIB_SECTOR_SIZE != 0 {
            bail!(
                "[chunk header] length {} is not a multiple of the sector size",
                { self.length }
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;
    use vadp_vixdisklib::DiskGeometry;

    fn test_info() -> DiskInfo {
        DiskInfo {
            bios_geo: DiskGeometry {
                cylinders: 512,
                heads: 16,
                sectors: 63,
            },
            phys_geo: DiskGeometry {
                cylinders: 1024,
                heads: 255,
                sectors: 63,
            },
            capacity: 8192,
            adapter_type: 2,
        }
    }

    #[test]
    fn record_sizes() {
        assert_eq!(std::mem::size_of::<DiskInfoHeader>(), DiskInfoHeader::SIZE);
        assert_eq!(std::mem::size_of::<MetaDataHeader>(), MetaDataHeader::SIZE);
        assert_eq!(std::mem::size_of::<ChunkHeader>(), ChunkHeader::SIZE);
    }

    #[test]
    fn disk_info_header_roundtrip() -> Result<(), Error> {
        let header = DiskInfoHeader::new(&test_info(), 8192 * 512, 4096);

        let mut stream = Vec::new();
        header.write_to(&mut stream)?;
        assert_eq!(stream.len(), DiskInfoHeader::SIZE);

        let decoded = DiskInfoHeader::read_from(&mut Cursor::new(&stream))?;
        assert_eq!(decoded, header);
        assert_eq!({ decoded.start_magic }, VADP_STREAM_MAGIC);
        assert_eq!({ decoded.end_magic }, VADP_STREAM_MAGIC);
        Ok(())
    }

    #[test]
    fn bios_geometry_falls_back_to_phys() {
        let mut info = test_info();
        info.bios_geo = DiskGeometry::default();

        let header = DiskInfoHeader::new(&info, 0, 0);
        assert_eq!({ header.bios_cylinders }, 1024);
        assert_eq!({ header.bios_heads }, 255);
        assert_eq!({ header.bios_sectors }, 63);
    }

    #[test]
    fn corrupt_magic_is_fatal() -> Result<(), Error> {
        let header = DiskInfoHeader::new(&test_info(), 0, 0);
        let mut stream = Vec::new();
        header.write_to(&mut stream)?;
        stream[0] ^= 0xff;

        let err = DiskInfoHeader::read_from(&mut Cursor::new(&stream)).unwrap_err();
        assert!(err.to_string().contains("disk info header"));
        Ok(())
    }

    #[test]
    fn meta_data_terminator() -> Result<(), Error> {
        let mut stream = Vec::new();
        MetaDataHeader::new(5, 4).write_to(&mut stream)?;
        MetaDataHeader::terminator().write_to(&mut stream)?;

        let mut cursor = Cursor::new(&stream);
        let first = MetaDataHeader::read_from(&mut cursor)?;
        assert!(!first.is_terminator());
        assert_eq!({ first.key_length }, 5);
        assert_eq!({ first.data_length }, 4);

        let second = MetaDataHeader::read_from(&mut cursor)?;
        assert!(second.is_terminator());
        Ok(())
    }

    #[test]
    fn chunk_header_eof_and_alignment() -> Result<(), Error> {
        let mut stream = Vec::new();
        ChunkHeader::new(4096, 1024).write_to(&mut stream)?;

        let mut cursor = Cursor::new(&stream);
        let chunk = ChunkHeader::read_from_or_eof(&mut cursor)?.unwrap();
        assert_eq!({ chunk.start_offset }, 4096);
        assert_eq!({ chunk.length }, 1024);
        assert!(ChunkHeader::read_from_or_eof(&mut cursor)?.is_none());

        let mut stream = Vec::new();
        ChunkHeader::new(0, 100).write_to(&mut stream)?;
        assert!(ChunkHeader::read_from_or_eof(&mut Cursor::new(&stream)).is_err());
        Ok(())
    }
}
