//! Stream the contents of a VMware virtual disk between the vStorage API
//! and stdio.
//!
//! `dump` writes a self-describing backup stream of all changed and
//! allocated sectors to stdout, `restore` applies such a stream from stdin
//! back onto a disk, `show` parses a stream without touching any disk.
//! Everything the tool needs to know about the disk is passed in through a
//! JSON work file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::exit;

use anyhow::{bail, Error};
use clap::{Parser, Subcommand};

use vadp_dumper::dump::{dump_stream, DumpOptions, StreamSink};
use vadp_dumper::restore::{restore_stream, RestoreDisk, RestoreOptions};
use vadp_dumper::termination;
use vadp_dumper::work_file::WorkFile;
use vadp_dumper::DEFAULT_SECTORS_PER_CALL;
use vadp_vixdisklib::{
    DiskRead, DiskType, DiskWrite, LocalDisk, VIXDISKLIB_MIN_CHUNK_SIZE, VIXDISKLIB_SECTOR_SIZE,
};

fn parse_sectors_per_call(value: &str) -> Result<u64, String> {
    match value.parse::<u64>() {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(format!(
            "sectors per call has to be a number > 0 (got '{}')",
            value
        )),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "vadp-dumper",
    about = "Stream VMware virtual disk contents between the vStorage API and stdio"
)]
struct Args {
    /// Create the local disk image before writing to it (disables the size
    /// check)
    #[arg(short = 'C', long = "create-disk")]
    create_disk: bool,

    /// Do not check the disk geometry before restoring
    #[arg(short = 'c', long = "no-size-check")]
    no_size_check: bool,

    /// Run a library cleanup pass when disconnecting
    #[arg(short = 'D', long = "cleanup-on-disconnect")]
    cleanup_on_disconnect: bool,

    /// Local disk image name; overrides the work file's diskPath on
    /// restore, names the clone target on dump
    #[arg(short = 'd', long = "disk-name")]
    disk_name: Option<String>,

    /// Force a specific transport method (nbd, nbdssl, san, hotadd)
    #[arg(short = 'f', long = "force-transport")]
    force_transport: Option<String>,

    /// Operate on a local disk image instead of a remote VM disk
    #[arg(short = 'l', long = "local-vmdk")]
    local_vmdk: bool,

    /// Save the disk metadata on dump
    #[arg(short = 'M', long = "save-metadata")]
    save_metadata: bool,

    /// Overlap disk I/O and stream I/O with a copy thread
    #[arg(short = 'm', long = "multi-threaded")]
    multi_threaded: bool,

    /// Clone all dumped sector data to this raw image file
    #[arg(short = 'r', long = "raw-disk-name")]
    raw_disk_name: Option<PathBuf>,

    /// Restore the stream's metadata onto the target disk
    #[arg(short = 'R', long = "restore-metadata")]
    restore_metadata: bool,

    /// Run a library cleanup pass right after connecting
    #[arg(short = 'S', long = "cleanup-on-start")]
    cleanup_on_start: bool,

    /// Sectors to move per library call
    #[arg(
        short = 's',
        long = "sectors-per-call",
        default_value_t = DEFAULT_SECTORS_PER_CALL,
        value_parser = parse_sectors_per_call
    )]
    sectors_per_call: u64,

    /// Do not query allocated blocks, treat the whole capacity as allocated
    #[arg(short = 'Q', long = "no-query-allocated")]
    no_query_allocated: bool,

    /// Chunk size for allocation queries, in sectors
    #[arg(short = 'k', long = "chunk-size", default_value_t = VIXDISKLIB_MIN_CHUNK_SIZE)]
    chunk_size: u64,

    /// Disk type for created disks (monolithic_sparse, monolithic_flat,
    /// split_sparse, split_flat, vmfs_flat, optimized, vmfs_thin,
    /// vmfs_sparse)
    #[arg(short = 't', long = "disktype")]
    disktype: Option<String>,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump a disk into a backup stream on stdout
    Dump { work_file: PathBuf },
    /// Restore a backup stream from stdin onto a disk
    Restore { work_file: PathBuf },
    /// Parse a backup stream from stdin without writing anything
    Show,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            exit(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .format_timestamp(None)
    .init();

    if let Err(err) = termination::install_handlers() {
        eprintln!("Error: failed to install signal handlers: {:#}", err);
        exit(1);
    }

    match run(&args) {
        Ok(()) => exit(0),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            match termination::termination_exit_code(&err) {
                Some(code) => exit(code),
                None => exit(1),
            }
        }
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let disk_type = match &args.disktype {
        Some(name) => Some(name.parse::<DiskType>()?),
        None => None,
    };

    match &args.command {
        Command::Dump { work_file } => dump(args, work_file, disk_type),
        Command::Restore { work_file } => restore(args, work_file, disk_type),
        Command::Show => show(args),
    }
}

#[cfg(feature = "vddk")]
fn connect_remote(
    args: &Args,
    work_file: &WorkFile,
    read_only: bool,
    need_snapshot: bool,
) -> Result<vadp_vixdisklib::VddkSession, Error> {
    let conn = &work_file.conn_params;
    let settings = vadp_vixdisklib::ConnectSettings {
        vm_moref: conn.vm_moref()?.to_string(),
        server_name: conn.host_name()?.to_string(),
        thumbprint: conn.thumbprint().map(str::to_string),
        username: conn.username()?.to_string(),
        password: conn.password()?.to_string(),
        snapshot_moref: if need_snapshot {
            Some(conn.required_snapshot_moref()?.to_string())
        } else {
            conn.snapshot_moref().map(str::to_string)
        },
        force_transport: args.force_transport.clone(),
        read_only,
        cleanup_on_start: args.cleanup_on_start,
        cleanup_on_disconnect: args.cleanup_on_disconnect,
    };
    vadp_vixdisklib::VddkSession::connect(&settings)
}

#[cfg(not(feature = "vddk"))]
fn no_vddk_support() -> Error {
    anyhow::format_err!(
        "this build has no vixDiskLib support, only local disk images (-l) can be processed"
    )
}

fn dump(args: &Args, work_file_path: &Path, disk_type: Option<DiskType>) -> Result<(), Error> {
    let work_file = WorkFile::load(work_file_path)?;
    let change_info = work_file.change_info()?;
    let source_path = work_file.disk_path(None)?;

    let source: Box<dyn DiskRead>;
    let mut clone_disk: Option<Box<dyn DiskWrite + Send>> = None;

    if args.local_vmdk {
        source = Box::new(LocalDisk::open(source_path, true)?);

        if let Some(clone_name) = &args.disk_name {
            let disk = if args.create_disk {
                let capacity =
                    (change_info.length + VIXDISKLIB_SECTOR_SIZE - 1) / VIXDISKLIB_SECTOR_SIZE;
                LocalDisk::create(
                    clone_name,
                    capacity,
                    disk_type.unwrap_or(DiskType::MonolithicSparse),
                )?
            } else {
                LocalDisk::open(clone_name, false)?
            };
            clone_disk = Some(Box::new(disk));
        }
    } else {
        if args.create_disk {
            bail!("cannot create a remote disk via VADP");
        }

        #[cfg(feature = "vddk")]
        {
            let session = connect_remote(args, &work_file, true, true)?;
            source = Box::new(session.open_read(source_path)?);
            if let Some(clone_name) = &args.disk_name {
                clone_disk = Some(Box::new(session.open_write(clone_name)?));
            }
        }

        #[cfg(not(feature = "vddk"))]
        return Err(no_vddk_support());
    }

    let mut sink = StreamSink::new(std::io::stdout());
    if let Some(disk) = clone_disk {
        sink = sink.with_clone_disk(disk);
    }
    if let Some(raw_name) = &args.raw_disk_name {
        let raw = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(raw_name)
            .map_err(|err| {
                anyhow::format_err!(
                    "failed to open the RAW DISK FILE {}: {}",
                    raw_name.display(),
                    err
                )
            })?;
        sink = sink.with_raw_sink(raw);
    }

    let options = DumpOptions {
        save_metadata: args.save_metadata,
        multi_threaded: args.multi_threaded,
        sectors_per_call: args.sectors_per_call,
        query_allocated: !args.no_query_allocated,
        chunk_size: args.chunk_size,
    };

    dump_stream(change_info, source, sink, &options)
}

fn restore(args: &Args, work_file_path: &Path, disk_type: Option<DiskType>) -> Result<(), Error> {
    let work_file = WorkFile::load(work_file_path)?;
    let target_path = work_file.disk_path(args.disk_name.as_deref())?.to_string();

    let disk: RestoreDisk;

    if args.local_vmdk {
        if args.create_disk {
            let create_type = disk_type.unwrap_or(DiskType::MonolithicSparse);
            disk = RestoreDisk::Create(Box::new(move |capacity| {
                let disk = LocalDisk::create(&target_path, capacity, create_type)?;
                Ok(Box::new(disk) as Box<dyn DiskWrite + Send>)
            }));
        } else {
            disk = RestoreDisk::Open(Box::new(LocalDisk::open(&target_path, false)?));
        }
    } else {
        if args.create_disk {
            bail!("cannot create a remote disk via VADP");
        }

        #[cfg(feature = "vddk")]
        {
            let session = connect_remote(args, &work_file, false, false)?;
            disk = RestoreDisk::Open(Box::new(session.open_write(&target_path)?));
        }

        #[cfg(not(feature = "vddk"))]
        return Err(no_vddk_support());
    }

    let options = RestoreOptions {
        validate_only: false,
        restore_metadata: args.restore_metadata,
        // Freshly created disks never match the stream geometry.
        check_geometry: !args.no_size_check && !args.create_disk,
        multi_threaded: args.multi_threaded,
        sectors_per_call: args.sectors_per_call,
    };

    restore_stream(std::io::stdin().lock(), disk, &options)
}

fn show(args: &Args) -> Result<(), Error> {
    let options = RestoreOptions {
        validate_only: true,
        restore_metadata: false,
        check_geometry: false,
        multi_threaded: false,
        sectors_per_call: args.sectors_per_call,
    };

    restore_stream(std::io::stdin().lock(), RestoreDisk::None, &options)
}
