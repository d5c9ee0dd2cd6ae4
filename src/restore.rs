//! The restore and show sides of the stream codec
//!
//! Parses a backup stream from the input: disk info header, metadata
//! section, data chunks until end of stream. In restore mode the sector
//! data is written back to the target disk (optionally through the copy
//! pipeline), in show mode everything is parsed and discarded.

use std::io::Read;

use anyhow::{bail, Context, Error};
use log::debug;

use vadp_vixdisklib::{DiskInfo, DiskWrite, VIXDISKLIB_SECTOR_SIZE};

use crate::copy_pipeline::CopyPipeline;
use crate::file_formats::{ChunkHeader, DiskInfoHeader, MetaDataHeader};
use crate::termination::check_termination;

const PIPELINE_QUEUE_DEPTH: usize = 4;

pub struct RestoreOptions {
    /// Parse the stream but do not touch any disk (show mode).
    pub validate_only: bool,
    pub restore_metadata: bool,
    pub check_geometry: bool,
    pub multi_threaded: bool,
    pub sectors_per_call: u64,
}

/// The disk a stream is restored onto.
pub enum RestoreDisk {
    /// No disk at all (show mode).
    None,
    /// An existing disk, opened before the stream is read.
    Open(Box<dyn DiskWrite + Send>),
    /// Create the disk once the stream header provides its capacity in
    /// sectors.
    Create(Box<dyn FnOnce(u64) -> Result<Box<dyn DiskWrite + Send>, Error>>),
}

/// Restoring must never shrink geometry: each axis of the target has to
/// hold at least what the stream was taken from. BIOS axes the target does
/// not report are skipped.
fn validate_geometry(header: &DiskInfoHeader, info: &DiskInfo) -> Result<(), Error> {
    if info.bios_geo.cylinders > 0 && info.bios_geo.cylinders < header.bios_cylinders {
        bail!(
            "new disk has {} BIOS cylinders, original had {}",
            info.bios_geo.cylinders,
            { header.bios_cylinders }
        );
    }
    if info.bios_geo.heads > 0 && info.bios_geo.heads < header.bios_heads {
        bail!(
            "new disk has {} BIOS heads, original had {}",
            info.bios_geo.heads,
            { header.bios_heads }
        );
    }
    if info.bios_geo.sectors > 0 && info.bios_geo.sectors < header.bios_sectors {
        bail!(
            "new disk has {} BIOS sectors, original had {}",
            info.bios_geo.sectors,
            { header.bios_sectors }
        );
    }
    if info.phys_geo.cylinders < header.phys_cylinders {
        bail!(
            "new disk has {} PHYS cylinders, original had {}",
            info.phys_geo.cylinders,
            { header.phys_cylinders }
        );
    }
    if info.phys_geo.heads < header.phys_heads {
        bail!(
            "new disk has {} PHYS heads, original had {}",
            info.phys_geo.heads,
            { header.phys_heads }
        );
    }
    if info.phys_geo.sectors < header.phys_sectors {
        bail!(
            "new disk has {} PHYS sectors, original had {}",
            info.phys_geo.sectors,
            { header.phys_sectors }
        );
    }
    Ok(())
}

struct WriteJob {
    sector_offset: u64,
    data: Vec<u8>,
}

enum Apply {
    Discard,
    Direct(Box<dyn DiskWrite + Send>),
    Threaded(CopyPipeline<WriteJob>),
}

impl Apply {
    fn write(&mut self, sector_offset: u64, data: Vec<u8>) -> Result<(), Error> {
        match self {
            Apply::Discard => Ok(()),
            Apply::Direct(disk) => disk.write_sectors(sector_offset, &data),
            Apply::Threaded(pipeline) => pipeline.send(WriteJob {
                sector_offset,
                data,
            }),
        }
    }

    fn flush(&mut self) -> Result<(), Error> {
        match self {
            Apply::Threaded(pipeline) => pipeline.flush(),
            _ => Ok(()),
        }
    }

    fn finish(self) -> Result<(), Error> {
        match self {
            Apply::Threaded(pipeline) => pipeline.complete(),
            _ => Ok(()),
        }
    }
}

/// Apply (or, in show mode, just parse) a backup stream from `input`.
pub fn restore_stream<R: Read>(
    mut input: R,
    disk: RestoreDisk,
    options: &RestoreOptions,
) -> Result<(), Error> {
    let header = DiskInfoHeader::read_from(&mut input)?;
    header.log_contents();

    let mut target: Option<Box<dyn DiskWrite + Send>> = match disk {
        RestoreDisk::None => None,
        RestoreDisk::Open(disk) => {
            if options.check_geometry && !options.validate_only {
                validate_geometry(&header, disk.info())
                    .context("invalid disk geometry for restoring to this volume")?;
            }
            Some(disk)
        }
        // A freshly created disk cannot match the stream geometry, the
        // size check stays off.
        RestoreDisk::Create(create) => Some(create({ header.phys_capacity })?),
    };

    let absolute_start_offset = { header.absolute_start_offset };

    loop {
        let meta = MetaDataHeader::read_from(&mut input)?;
        if meta.is_terminator() {
            break;
        }

        let mut key = vec![0u8; { meta.key_length } as usize];
        input
            .read_exact(&mut key)
            .context("failed to read meta data key from input datastream")?;
        let key = match key.split_last() {
            Some((0, bytes)) => String::from_utf8_lossy(bytes).into_owned(),
            _ => bail!("meta data key is not NUL terminated"),
        };

        let mut value = vec![0u8; { meta.data_length } as usize];
        input
            .read_exact(&mut value)
            .context("failed to read meta data from input datastream")?;

        debug!("meta data key {}, {} byte value", key, value.len());

        if options.restore_metadata && !options.validate_only {
            if let Some(disk) = target.as_mut() {
                disk.write_metadata(&key, &value)?;
            }
        }
    }

    let mut apply = if options.validate_only {
        Apply::Discard
    } else {
        match target.take() {
            None => Apply::Discard,
            Some(mut disk) if options.multi_threaded => Apply::Threaded(CopyPipeline::new(
                "vmdk writer",
                PIPELINE_QUEUE_DEPTH,
                move |job: WriteJob| disk.write_sectors(job.sector_offset, &job.data),
            )?),
            Some(disk) => Apply::Direct(disk),
        }
    };

    while let Some(chunk) = ChunkHeader::read_from_or_eof(&mut input)? {
        debug!("start = {}", { chunk.start_offset });
        debug!("length = {}", { chunk.length });
        debug!("nr length = {}", { chunk.length } / VIXDISKLIB_SECTOR_SIZE);

        let mut current_offset = absolute_start_offset + chunk.start_offset;
        let max_offset = current_offset + chunk.length;
        let mut sector_offset = current_offset / VIXDISKLIB_SECTOR_SIZE;

        while current_offset < max_offset {
            check_termination()?;

            let sectors_to_read = options
                .sectors_per_call
                .min((max_offset - current_offset) / VIXDISKLIB_SECTOR_SIZE);
            let byte_count = sectors_to_read * VIXDISKLIB_SECTOR_SIZE;

            let mut data = vec![0u8; byte_count as usize];
            input
                .read_exact(&mut data)
                .context("failed to read chunk data from input datastream")?;
            apply.write(sector_offset, data)?;

            current_offset += byte_count;
            sector_offset += sectors_to_read;
        }

        apply.flush()?;
    }

    apply.finish()
}

#[cfg(test)]
mod test {
    use super::*;
    use vadp_vixdisklib::DiskGeometry;

    fn header_with_geometry(bios: DiskGeometry, phys: DiskGeometry) -> DiskInfoHeader {
        let info = DiskInfo {
            bios_geo: bios,
            phys_geo: phys,
            capacity: 1024,
            adapter_type: 2,
        };
        DiskInfoHeader::new(&info, 1024 * 512, 0)
    }

    fn geo(cylinders: u32, heads: u32, sectors: u32) -> DiskGeometry {
        DiskGeometry {
            cylinders,
            heads,
            sectors,
        }
    }

    #[test]
    fn geometry_validation_names_the_axis() {
        let header = header_with_geometry(geo(10, 16, 63), geo(10, 16, 63));

        let smaller = DiskInfo {
            bios_geo: geo(10, 16, 63),
            phys_geo: geo(8, 16, 63),
            ..Default::default()
        };
        let err = validate_geometry(&header, &smaller).unwrap_err();
        assert!(err.to_string().contains("PHYS cylinders"));

        let fewer_heads = DiskInfo {
            bios_geo: geo(10, 8, 63),
            phys_geo: geo(10, 16, 63),
            ..Default::default()
        };
        let err = validate_geometry(&header, &fewer_heads).unwrap_err();
        assert!(err.to_string().contains("BIOS heads"));

        let fewer_sectors = DiskInfo {
            bios_geo: geo(10, 16, 63),
            phys_geo: geo(10, 16, 32),
            ..Default::default()
        };
        let err = validate_geometry(&header, &fewer_sectors).unwrap_err();
        assert!(err.to_string().contains("PHYS sectors"));
    }

    #[test]
    fn geometry_validation_accepts_larger_disks() {
        let header = header_with_geometry(geo(10, 16, 63), geo(10, 16, 63));

        let same = DiskInfo {
            bios_geo: geo(10, 16, 63),
            phys_geo: geo(10, 16, 63),
            ..Default::default()
        };
        assert!(validate_geometry(&header, &same).is_ok());

        let larger = DiskInfo {
            bios_geo: geo(20, 255, 63),
            phys_geo: geo(20, 255, 63),
            ..Default::default()
        };
        assert!(validate_geometry(&header, &larger).is_ok());

        // A target that does not report BIOS geometry skips those checks.
        let no_bios = DiskInfo {
            bios_geo: geo(0, 0, 0),
            phys_geo: geo(10, 16, 63),
            ..Default::default()
        };
        assert!(validate_geometry(&header, &no_bios).is_ok());
    }
}
