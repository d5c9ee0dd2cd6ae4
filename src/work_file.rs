//! The JSON work file
//!
//! All work for the dumper is described by a JSON document naming the
//! vSphere connection, the disk to operate on and the changed-block
//! information for that disk. The file is parsed once at startup and
//! read-only afterwards.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{format_err, Error};
use serde::Deserialize;

/// Connection parameters (`ConnParams`). The individual keys are only
/// required when the connection is actually remote, so they stay optional
/// here and are checked by the accessors.
#[derive(Deserialize, Debug, Default)]
pub struct ConnParams {
    #[serde(rename = "VmMoRef")]
    vm_moref: Option<String>,
    #[serde(rename = "VsphereHostName")]
    host_name: Option<String>,
    #[serde(rename = "VsphereThumbPrint")]
    thumbprint: Option<String>,
    #[serde(rename = "VsphereUsername")]
    username: Option<String>,
    #[serde(rename = "VspherePassword")]
    password: Option<String>,
    #[serde(rename = "VsphereSnapshotMoRef")]
    snapshot_moref: Option<String>,
}

/// Disk parameters (`DiskParams`). `diskPath` may be overridden from the
/// command line, so it is resolved through [`WorkFile::disk_path`].
#[derive(Deserialize, Debug, Default)]
pub struct DiskParams {
    #[serde(rename = "diskPath")]
    disk_path: Option<String>,
}

/// One changed area in byte units.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedArea {
    pub start: u64,
    pub length: u64,
}

/// Changed-block information (`DiskChangeInfo`).
#[derive(Deserialize, Debug)]
pub struct DiskChangeInfo {
    /// Size of the disk in bytes.
    pub length: u64,
    /// Absolute offset the stream is encoded against.
    #[serde(rename = "startOffset")]
    pub start_offset: u64,
    /// Sorted, disjoint list of changed areas.
    #[serde(rename = "changedArea", default)]
    pub changed_area: Vec<ChangedArea>,
}

#[derive(Deserialize, Debug)]
pub struct WorkFile {
    #[serde(rename = "ConnParams")]
    pub conn_params: ConnParams,
    #[serde(rename = "DiskParams", default)]
    pub disk_params: DiskParams,
    // Not consumed on restore, hence optional; dump fails through
    // `change_info()` when it is missing.
    #[serde(rename = "DiskChangeInfo")]
    change_info: Option<DiskChangeInfo>,
}

fn required<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str, Error> {
    value.as_deref().ok_or_else(|| {
        format_err!(
            "failed to find {} in JSON definition of object ConnParams",
            key
        )
    })
}

impl ConnParams {
    pub fn vm_moref(&self) -> Result<&str, Error> {
        required(&self.vm_moref, "VmMoRef")
    }

    pub fn host_name(&self) -> Result<&str, Error> {
        required(&self.host_name, "VsphereHostName")
    }

    pub fn username(&self) -> Result<&str, Error> {
        required(&self.username, "VsphereUsername")
    }

    pub fn password(&self) -> Result<&str, Error> {
        required(&self.password, "VspherePassword")
    }

    pub fn thumbprint(&self) -> Option<&str> {
        self.thumbprint.as_deref()
    }

    pub fn snapshot_moref(&self) -> Option<&str> {
        self.snapshot_moref.as_deref()
    }

    /// Like [`snapshot_moref`](Self::snapshot_moref), but required (dump
    /// always runs against a snapshot).
    pub fn required_snapshot_moref(&self) -> Result<&str, Error> {
        required(&self.snapshot_moref, "VsphereSnapshotMoRef")
    }
}

impl WorkFile {
    /// Load and parse a work file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|err| format_err!("failed to open JSON config {}: {}", path.display(), err))?;
        let work_file: Self = serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            format_err!("failed to parse JSON config {}: {}", path.display(), err)
        })?;
        Ok(work_file)
    }

    /// The changed-block subtree, required for dumping.
    pub fn change_info(&self) -> Result<&DiskChangeInfo, Error> {
        self.change_info
            .as_ref()
            .ok_or_else(|| format_err!("failed to find DiskChangeInfo in JSON definition"))
    }

    /// Path of the disk to operate on; a name given on the command line
    /// wins over the work file.
    pub fn disk_path<'a>(&'a self, override_name: Option<&'a str>) -> Result<&'a str, Error> {
        if let Some(name) = override_name {
            return Ok(name);
        }
        self.disk_params.disk_path.as_deref().ok_or_else(|| {
            format_err!("failed to find diskPath in JSON definition of object DiskParams")
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    const FULL_WORK_FILE: &str = r#"{
        "ConnParams": {
            "VmMoRef": "moref=vm-123",
            "VsphereHostName": "esx1.example.com",
            "VsphereThumbPrint": "AA:BB:CC",
            "VsphereUsername": "backup",
            "VspherePassword": "secret",
            "VsphereSnapshotMoRef": "snapshot-7"
        },
        "DiskParams": { "diskPath": "[datastore1] vm/vm.vmdk" },
        "DiskChangeInfo": {
            "length": 42949672960,
            "startOffset": 0,
            "changedArea": [
                { "start": 0, "length": 65536 },
                { "start": 1048576, "length": 131072 }
            ]
        }
    }"#;

    #[test]
    fn parse_full_work_file() -> Result<(), Error> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(FULL_WORK_FILE.as_bytes())?;

        let work_file = WorkFile::load(file.path())?;
        assert_eq!(work_file.conn_params.vm_moref()?, "moref=vm-123");
        assert_eq!(work_file.conn_params.host_name()?, "esx1.example.com");
        assert_eq!(work_file.conn_params.thumbprint(), Some("AA:BB:CC"));
        assert_eq!(
            work_file.conn_params.required_snapshot_moref()?,
            "snapshot-7"
        );
        assert_eq!(work_file.disk_path(None)?, "[datastore1] vm/vm.vmdk");
        assert_eq!(work_file.disk_path(Some("/tmp/local.img"))?, "/tmp/local.img");

        let change_info = work_file.change_info()?;
        assert_eq!(change_info.length, 42949672960);
        assert_eq!(change_info.start_offset, 0);
        assert_eq!(
            change_info.changed_area,
            vec![
                ChangedArea {
                    start: 0,
                    length: 65536
                },
                ChangedArea {
                    start: 1048576,
                    length: 131072
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn missing_keys_name_the_key() {
        let work_file: WorkFile = serde_json::from_str(
            r#"{ "ConnParams": {}, "DiskParams": {} }"#,
        )
        .unwrap();

        let err = work_file.conn_params.vm_moref().unwrap_err();
        assert!(err.to_string().contains("VmMoRef"));

        let err = work_file.conn_params.required_snapshot_moref().unwrap_err();
        assert!(err.to_string().contains("VsphereSnapshotMoRef"));

        let err = work_file.disk_path(None).unwrap_err();
        assert!(err.to_string().contains("diskPath"));

        let err = work_file.change_info().unwrap_err();
        assert!(err.to_string().contains("DiskChangeInfo"));
    }

    #[test]
    fn parse_failure_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();

        let err = WorkFile::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse JSON config"));
    }
}
