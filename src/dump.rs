//! The dump side of the stream codec
//!
//! Emits the disk info header, the metadata section and one framed data
//! chunk per interval the intersector selects. Sector data can be cloned to
//! a raw image file and to a second disk while it is streamed; with multi
//! threading enabled the stream side runs on a worker fed through the copy
//! pipeline.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use anyhow::{bail, Context, Error};
use log::{debug, error};

use vadp_vixdisklib::{DiskRead, DiskWrite, VIXDISKLIB_SECTOR_SIZE};

use crate::copy_pipeline::CopyPipeline;
use crate::extents;
use crate::file_formats::{ChunkHeader, DiskInfoHeader, MetaDataHeader};
use crate::termination::check_termination;
use crate::work_file::DiskChangeInfo;

const PIPELINE_QUEUE_DEPTH: usize = 4;

pub struct DumpOptions {
    pub save_metadata: bool,
    pub multi_threaded: bool,
    pub sectors_per_call: u64,
    pub query_allocated: bool,
    /// Chunk size for allocation queries, in sectors.
    pub chunk_size: u64,
}

/// Work unit handed to the stream side: either the start of a new chunk or
/// one batch of its sector data.
pub enum SinkJob {
    Chunk(ChunkHeader),
    Data { sector_offset: u64, data: Vec<u8> },
}

/// The primary output stream plus the optional secondary sinks.
///
/// Failures of the secondary sinks while writing sector data are logged
/// and skipped; the backup stream itself stays authoritative.
pub struct StreamSink<W: Write> {
    out: W,
    raw: Option<File>,
    clone_disk: Option<Box<dyn DiskWrite + Send>>,
}

impl<W: Write> StreamSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            raw: None,
            clone_disk: None,
        }
    }

    /// Also write all sector data to a raw image file.
    pub fn with_raw_sink(mut self, file: File) -> Self {
        self.raw = Some(file);
        self
    }

    /// Also write sector data and metadata to a second disk.
    pub fn with_clone_disk(mut self, disk: Box<dyn DiskWrite + Send>) -> Self {
        self.clone_disk = Some(disk);
        self
    }

    fn write_header(&mut self, header: &DiskInfoHeader) -> Result<(), Error> {
        header.write_to(&mut self.out)
    }

    fn write_meta_record(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        if let Some(disk) = self.clone_disk.as_mut() {
            disk.write_metadata(key, value)?;
        }

        MetaDataHeader::new(key.len() as u32 + 1, value.len() as u32).write_to(&mut self.out)?;
        self.out
            .write_all(key.as_bytes())
            .and_then(|_| self.out.write_all(&[0]))
            .context("failed to write meta data key to output datastream")?;
        self.out
            .write_all(value)
            .context("failed to write meta data to output datastream")?;
        Ok(())
    }

    fn write_meta_terminator(&mut self) -> Result<(), Error> {
        MetaDataHeader::terminator().write_to(&mut self.out)
    }

    fn handle(&mut self, job: SinkJob) -> Result<(), Error> {
        match job {
            SinkJob::Chunk(header) => {
                header.write_to(&mut self.out)?;
                if let Some(raw) = self.raw.as_mut() {
                    debug!("RAWFILE: adjusting seek position in file");
                    if let Err(err) = raw.seek(SeekFrom::Start(header.start_offset)) {
                        error!("raw disk seek error: {}", err);
                    }
                }
            }
            SinkJob::Data {
                sector_offset,
                data,
            } => {
                if let Some(raw) = self.raw.as_mut() {
                    if let Err(err) = raw.write_all(&data) {
                        error!("raw disk write error: {}", err);
                    }
                }
                if let Some(disk) = self.clone_disk.as_mut() {
                    if let Err(err) = disk.write_sectors(sector_offset, &data) {
                        error!("VMDK clone write error: {}", err);
                    }
                }
                self.out
                    .write_all(&data)
                    .context("failed to write data to output datastream")?;
            }
        }
        Ok(())
    }
}

enum Output<W: Write + Send + 'static> {
    Direct(StreamSink<W>),
    Threaded(CopyPipeline<SinkJob>),
}

impl<W: Write + Send + 'static> Output<W> {
    fn handle(&mut self, job: SinkJob) -> Result<(), Error> {
        match self {
            Output::Direct(sink) => sink.handle(job),
            Output::Threaded(pipeline) => pipeline.send(job),
        }
    }

    fn flush(&mut self) -> Result<(), Error> {
        match self {
            Output::Direct(sink) => Ok(sink.out.flush()?),
            // Wait for the worker so the next chunk header cannot overtake
            // in-flight data.
            Output::Threaded(pipeline) => pipeline.flush(),
        }
    }

    fn finish(self) -> Result<(), Error> {
        match self {
            Output::Direct(mut sink) => Ok(sink.out.flush()?),
            Output::Threaded(pipeline) => pipeline.complete(),
        }
    }
}

/// Dump the changed and allocated parts of `disk` into `sink`.
pub fn dump_stream<W: Write + Send + 'static>(
    change_info: &DiskChangeInfo,
    mut disk: Box<dyn DiskRead>,
    mut sink: StreamSink<W>,
    options: &DumpOptions,
) -> Result<(), Error> {
    let header = DiskInfoHeader::new(disk.info(), change_info.length, change_info.start_offset);
    header.log_contents();

    let absolute_start_offset = change_info.start_offset;

    sink.write_header(&header)?;

    if options.save_metadata {
        for key in disk.metadata_keys()? {
            debug!("processing metadata key {}", key);
            let value = disk.read_metadata(&key)?;
            sink.write_meta_record(&key, &value)?;
        }
    }
    sink.write_meta_terminator()?;

    let allocated = if options.query_allocated {
        extents::plan_allocated(disk.as_mut(), options.chunk_size)?
    } else {
        extents::whole_disk(disk.info().capacity)
    };

    debug!("Allocated Blocks:");
    for (index, block) in allocated.iter().enumerate() {
        debug!(
            "  {:10}: {{ start: {}, length: {} }}",
            index,
            block.offset * VIXDISKLIB_SECTOR_SIZE,
            block.length * VIXDISKLIB_SECTOR_SIZE
        );
    }

    let intervals = extents::intersect(&change_info.changed_area, &allocated);

    let mut output = if options.multi_threaded {
        Output::Threaded(CopyPipeline::new(
            "stream writer",
            PIPELINE_QUEUE_DEPTH,
            move |job| sink.handle(job),
        )?)
    } else {
        Output::Direct(sink)
    };

    for interval in intervals {
        if interval.start % VIXDISKLIB_SECTOR_SIZE != 0
            || interval.length % VIXDISKLIB_SECTOR_SIZE != 0
        {
            bail!(
                "changed area at offset {} (length {}) is not sector aligned",
                interval.start,
                interval.length
            );
        }

        debug!("start = {}", interval.start);
        debug!("length = {}", interval.length);
        debug!("nr length = {}", interval.length / VIXDISKLIB_SECTOR_SIZE);

        output.handle(SinkJob::Chunk(ChunkHeader::new(
            interval.start,
            interval.length,
        )))?;

        let mut current_offset = absolute_start_offset + interval.start;
        let max_offset = current_offset + interval.length;
        let mut sector_offset = current_offset / VIXDISKLIB_SECTOR_SIZE;

        while current_offset < max_offset {
            check_termination()?;

            let sectors_to_read = options
                .sectors_per_call
                .min((max_offset - current_offset) / VIXDISKLIB_SECTOR_SIZE);
            let byte_count = sectors_to_read * VIXDISKLIB_SECTOR_SIZE;

            let mut data = vec![0u8; byte_count as usize];
            disk.read_sectors(sector_offset, &mut data)
                .context("read error on VMDK")?;
            output.handle(SinkJob::Data {
                sector_offset,
                data,
            })?;

            current_offset += byte_count;
            sector_offset += sectors_to_read;
        }

        output.flush()?;
    }

    output.finish()
}
