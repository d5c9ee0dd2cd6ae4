//! Stream the contents of a VMware virtual disk to or from stdio
//!
//! The dumper reads a JSON work file describing a connection, a disk and its
//! changed-block information, opens the disk through the
//! [`vadp_vixdisklib`] access layer and copies the sectors that are both
//! changed and allocated into a self-describing container format on stdout
//! (`dump`). `restore` applies such a stream back onto a disk, `show`
//! parses a stream without touching any disk.

pub mod copy_pipeline;
pub mod dump;
pub mod extents;
pub mod file_formats;
pub mod restore;
pub mod termination;
pub mod tools;
pub mod work_file;

/// Number of sectors moved per library call unless overridden with `-s`,
/// i.e. 512 KiB per call.
pub const DEFAULT_SECTORS_PER_CALL: u64 = 1024;
