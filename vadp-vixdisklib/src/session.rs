//! Session lifecycle for the vixDiskLib backend
//!
//! A [`VddkSession`] owns the library initialization, the per-VM access
//! registration and the connection. Disk handles opened through it keep the
//! session alive via `Arc`, so teardown always runs in the library's
//! required order: close handles, disconnect, end access, unload.

use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Error};
use libc::{c_char, c_void};
use log::{debug, warn};

use crate::ffi;
use crate::{
    BlockExtent, DiskGeometry, DiskInfo, DiskRead, DiskType, DiskWrite,
    ADAPTER_TYPE_SCSI_BUSLOGIC, VADP_DUMPER_IDENTITY, VDDK_PANIC_EXIT_CODE,
    VIXDISKLIB_SECTOR_SIZE, VIXDISKLIB_VERSION_MAJOR, VIXDISKLIB_VERSION_MINOR,
};

/// Default installation directory of the disk library.
pub const VDDK_LIBDIR: &str = "/usr/lib/vmware-vix-disklib";

const VSPHERE_DEFAULT_ADMIN_PORT: u32 = 0;

/// Connection settings, extracted from the work file and the command line.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub vm_moref: String,
    pub server_name: String,
    pub thumbprint: Option<String>,
    pub username: String,
    pub password: String,
    /// Snapshot to attach to; required when dumping.
    pub snapshot_moref: Option<String>,
    /// Forced transport mode (nbd, nbdssl, san, hotadd).
    pub force_transport: Option<String>,
    pub read_only: bool,
    /// Run a library-wide cleanup pass right after connecting.
    pub cleanup_on_start: bool,
    /// Run a library-wide cleanup pass when disconnecting.
    pub cleanup_on_disconnect: bool,
}

extern "C" fn log_callback(fmt: *const c_char, args: *mut c_void) {
    debug!("vixdisklib: {}", ffi::format_log_message(fmt, args));
}

extern "C" fn warn_callback(fmt: *const c_char, args: *mut c_void) {
    warn!("vixdisklib: {}", ffi::format_log_message(fmt, args));
}

extern "C" fn panic_callback(fmt: *const c_char, args: *mut c_void) {
    // The library state is beyond repair at this point; leave immediately
    // with the dedicated exit code.
    eprintln!(
        "vixdisklib panic: {}",
        ffi::format_log_message(fmt, args)
    );
    std::process::exit(VDDK_PANIC_EXIT_CODE);
}

struct SessionState {
    initialized: bool,
    params: *mut ffi::VixDiskLibConnectParams,
    // Strings whose pointers are installed in `params`; must outlive every
    // library call that reads the connect params.
    owned_strings: Vec<CString>,
    connection: ffi::VixDiskLibConnection,
    end_access_pending: bool,
    cleanup_on_disconnect: bool,
}

// Raw pointers confined to one thread at a time; the mutex serializes the
// teardown path.
unsafe impl Send for SessionState {}

pub(crate) struct SessionInner {
    state: Mutex<SessionState>,
}

impl SessionInner {
    fn release(&self) {
        let mut state = self.state.lock().unwrap();

        let connection = std::mem::replace(&mut state.connection, ptr::null_mut());
        if !connection.is_null() {
            unsafe { ffi::VixDiskLib_Disconnect(connection) };
            if state.cleanup_on_disconnect {
                let mut cleaned = 0u32;
                let mut remaining = 0u32;
                unsafe { ffi::VixDiskLib_Cleanup(state.params, &mut cleaned, &mut remaining) };
                debug!(
                    "vixdisklib cleanup: {} cleaned up, {} remaining",
                    cleaned, remaining
                );
            }
        }

        if state.end_access_pending {
            state.end_access_pending = false;
            let identity = CString::new(VADP_DUMPER_IDENTITY).unwrap();
            let err = unsafe { ffi::VixDiskLib_EndAccess(state.params, identity.as_ptr()) };
            if err != ffi::VIX_OK {
                warn!(
                    "failed to end access: {} [{}]",
                    ffi::vix_error_text(err),
                    err
                );
            }
        }

        let params = std::mem::replace(&mut state.params, ptr::null_mut());
        if !params.is_null() {
            unsafe { ffi::VixDiskLib_FreeConnectParams(params) };
        }
        state.owned_strings.clear();

        if std::mem::take(&mut state.initialized) {
            unsafe { ffi::VixDiskLib_Exit() };
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// A connected vixDiskLib session.
pub struct VddkSession {
    inner: Arc<SessionInner>,
}

impl VddkSession {
    /// Initialize the library and connect to the vSphere host.
    pub fn connect(settings: &ConnectSettings) -> Result<Self, Error> {
        let session = Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(SessionState {
                    initialized: false,
                    params: ptr::null_mut(),
                    owned_strings: Vec::new(),
                    connection: ptr::null_mut(),
                    end_access_pending: false,
                    cleanup_on_disconnect: settings.cleanup_on_disconnect,
                }),
            }),
        };

        // On error the partially built state is unwound by `SessionInner`.
        session.do_connect(settings)?;

        if settings.cleanup_on_start {
            session.run_cleanup();
        }

        Ok(session)
    }

    fn do_connect(&self, settings: &ConnectSettings) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();

        let libdir = CString::new(VDDK_LIBDIR).unwrap();
        let err = unsafe {
            ffi::VixDiskLib_InitEx(
                VIXDISKLIB_VERSION_MAJOR,
                VIXDISKLIB_VERSION_MINOR,
                Some(log_callback),
                Some(warn_callback),
                Some(panic_callback),
                libdir.as_ptr(),
                ptr::null(),
            )
        };
        ffi::vix_check(err, "failed to initialize vixdisklib")?;
        state.initialized = true;

        let params = unsafe { ffi::VixDiskLib_AllocateConnectParams() };
        if params.is_null() {
            bail!("failed to allocate vixdisklib connection params");
        }
        state.params = params;

        let mut own = |value: &str| -> Result<*mut c_char, Error> {
            let owned = CString::new(value)
                .map_err(|_| format_err!("embedded NUL in connection parameter"))?;
            let ptr = owned.as_ptr() as *mut c_char;
            state.owned_strings.push(owned);
            Ok(ptr)
        };

        let vmx_spec = own(&settings.vm_moref)?;
        let server_name = own(&settings.server_name)?;
        let thumbprint = match &settings.thumbprint {
            Some(value) => own(value)?,
            None => ptr::null_mut(),
        };
        let username = own(&settings.username)?;
        let password = own(&settings.password)?;

        unsafe {
            (*params).specType = ffi::VIXDISKLIB_SPEC_VMX;
            (*params).vmxSpec = vmx_spec;
            (*params).serverName = server_name;
            (*params).thumbPrint = thumbprint;
            (*params).credType = ffi::VIXDISKLIB_CRED_UID;
            (*params).creds.uid.userName = username;
            (*params).creds.uid.password = password;
            (*params).port = VSPHERE_DEFAULT_ADMIN_PORT;
        }

        let identity = CString::new(VADP_DUMPER_IDENTITY).unwrap();
        let err = unsafe { ffi::VixDiskLib_PrepareForAccess(params, identity.as_ptr()) };
        if err != ffi::VIX_OK {
            // Not fatal; the host may not support it. EndAccess is still
            // attempted on teardown.
            warn!(
                "failed to prepare for access: {} [{}]",
                ffi::vix_error_text(err),
                err
            );
        }
        state.end_access_pending = true;

        let snapshot = match &settings.snapshot_moref {
            Some(value) => Some(CString::new(value.as_str())?),
            None => None,
        };
        let transport = match &settings.force_transport {
            Some(value) => Some(CString::new(value.as_str())?),
            None => None,
        };

        let mut connection: ffi::VixDiskLibConnection = ptr::null_mut();
        let err = unsafe {
            ffi::VixDiskLib_ConnectEx(
                params,
                settings.read_only as c_char,
                snapshot.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
                transport.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
                &mut connection,
            )
        };
        ffi::vix_check(
            err,
            &format!("failed to connect to {}", settings.server_name),
        )?;
        state.connection = connection;

        Ok(())
    }

    /// Run a library-wide cleanup pass for this connection's parameters.
    pub fn run_cleanup(&self) {
        let state = self.inner.state.lock().unwrap();
        let mut cleaned = 0u32;
        let mut remaining = 0u32;
        unsafe { ffi::VixDiskLib_Cleanup(state.params, &mut cleaned, &mut remaining) };
        debug!(
            "vixdisklib cleanup: {} cleaned up, {} remaining",
            cleaned, remaining
        );
    }

    /// Open a disk read-only and fetch its geometry.
    pub fn open_read(&self, path: &str) -> Result<VddkDisk, Error> {
        self.open(path, true)
    }

    /// Open a disk for writing and fetch its geometry.
    pub fn open_write(&self, path: &str) -> Result<VddkDisk, Error> {
        self.open(path, false)
    }

    fn open(&self, path: &str, read_only: bool) -> Result<VddkDisk, Error> {
        let state = self.inner.state.lock().unwrap();

        let mut flags = 0u32;
        if read_only {
            flags |= ffi::VIXDISKLIB_FLAG_OPEN_READ_ONLY;
        }

        let c_path = CString::new(path)?;
        let mut handle: ffi::VixDiskLibHandle = ptr::null_mut();
        let err = unsafe { ffi::VixDiskLib_Open(state.connection, c_path.as_ptr(), flags, &mut handle) };
        ffi::vix_check(err, &format!("failed to open {}", path))?;

        let mut disk = VddkDisk {
            handle,
            info: DiskInfo::default(),
            path: path.to_string(),
            _session: Arc::clone(&self.inner),
        };
        disk.fetch_info()?;

        debug!(
            "selected transport method for {}: {}",
            path,
            disk.transport_mode()
        );

        Ok(disk)
    }

    /// Create a new disk. Only meaningful for local targets; remote creation
    /// is rejected by the caller.
    pub fn create(
        &self,
        path: &str,
        capacity_sectors: u64,
        disk_type: DiskType,
    ) -> Result<(), Error> {
        let state = self.inner.state.lock().unwrap();

        let create_params = ffi::VixDiskLibCreateParams {
            diskType: disk_type as u32 as libc::c_int,
            adapterType: ADAPTER_TYPE_SCSI_BUSLOGIC as libc::c_int,
            hwVersion: ffi::VIXDISKLIB_HWVERSION_ESX4X,
            capacity: capacity_sectors,
        };

        let c_path = CString::new(path)?;
        let err = unsafe {
            ffi::VixDiskLib_Create(
                state.connection,
                c_path.as_ptr(),
                &create_params,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        ffi::vix_check(err, &format!("failed to create logical disk {}", path))
    }
}

/// An open disk handle. Closes itself on drop; keeps the session alive until
/// then.
pub struct VddkDisk {
    handle: ffi::VixDiskLibHandle,
    info: DiskInfo,
    path: String,
    _session: Arc<SessionInner>,
}

// The handle is only ever used from one thread at a time (moving it into the
// copy pipeline worker transfers that role).
unsafe impl Send for VddkDisk {}

impl VddkDisk {
    fn fetch_info(&mut self) -> Result<(), Error> {
        let mut raw: *mut ffi::VixDiskLibInfo = ptr::null_mut();
        let err = unsafe { ffi::VixDiskLib_GetInfo(self.handle, &mut raw) };
        ffi::vix_check(
            err,
            &format!("failed to get logical disk info for {}", self.path),
        )?;

        let info = unsafe { &*raw };
        self.info = DiskInfo {
            bios_geo: DiskGeometry {
                cylinders: info.biosGeo.cylinders,
                heads: info.biosGeo.heads,
                sectors: info.biosGeo.sectors,
            },
            phys_geo: DiskGeometry {
                cylinders: info.physGeo.cylinders,
                heads: info.physGeo.heads,
                sectors: info.physGeo.sectors,
            },
            capacity: info.capacity,
            adapter_type: info.adapterType as u32,
        };
        unsafe { ffi::VixDiskLib_FreeInfo(raw) };

        Ok(())
    }

    fn check_sector_aligned(buf_len: usize) -> Result<u64, Error> {
        if buf_len as u64 % VIXDISKLIB_SECTOR_SIZE != 0 {
            bail!("disk I/O buffer not sector aligned ({} bytes)", buf_len);
        }
        Ok(buf_len as u64 / VIXDISKLIB_SECTOR_SIZE)
    }
}

impl Drop for VddkDisk {
    fn drop(&mut self) {
        let handle = std::mem::replace(&mut self.handle, ptr::null_mut());
        if !handle.is_null() {
            unsafe { ffi::VixDiskLib_Close(handle) };
        }
    }
}

impl DiskRead for VddkDisk {
    fn info(&self) -> &DiskInfo {
        &self.info
    }

    fn transport_mode(&self) -> String {
        let mode = unsafe { ffi::VixDiskLib_GetTransportMode(self.handle) };
        if mode.is_null() {
            return String::from("unknown");
        }
        unsafe { CStr::from_ptr(mode) }
            .to_string_lossy()
            .into_owned()
    }

    fn read_sectors(&mut self, sector_offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let num_sectors = Self::check_sector_aligned(buf.len())?;
        let err = unsafe {
            ffi::VixDiskLib_Read(self.handle, sector_offset, num_sectors, buf.as_mut_ptr())
        };
        ffi::vix_check(err, "VMDK read error")
    }

    fn metadata_keys(&mut self) -> Result<Vec<String>, Error> {
        let mut required = 0usize;
        let err = unsafe {
            ffi::VixDiskLib_GetMetadataKeys(self.handle, ptr::null_mut(), 0, &mut required)
        };
        if err != ffi::VIX_OK && err != ffi::VIX_E_BUFFER_TOOSMALL {
            return Err(format_err!(
                "failed to read metadata keys: {} [{}]",
                ffi::vix_error_text(err),
                err
            ));
        }

        let mut buf = vec![0u8; required.max(1)];
        let err = unsafe {
            ffi::VixDiskLib_GetMetadataKeys(
                self.handle,
                buf.as_mut_ptr() as *mut c_char,
                buf.len(),
                ptr::null_mut(),
            )
        };
        ffi::vix_check(err, "failed to read metadata keys")?;

        // The key list is a sequence of NUL terminated strings ending with
        // an empty string.
        let mut keys = Vec::new();
        for chunk in buf.split(|byte| *byte == 0) {
            if chunk.is_empty() {
                break;
            }
            keys.push(String::from_utf8_lossy(chunk).into_owned());
        }
        Ok(keys)
    }

    fn read_metadata(&mut self, key: &str) -> Result<Vec<u8>, Error> {
        let c_key = CString::new(key)?;

        let mut required = 0usize;
        let err = unsafe {
            ffi::VixDiskLib_ReadMetadata(
                self.handle,
                c_key.as_ptr(),
                ptr::null_mut(),
                0,
                &mut required,
            )
        };
        if err != ffi::VIX_OK && err != ffi::VIX_E_BUFFER_TOOSMALL {
            return Err(format_err!(
                "failed to read metadata for key {}: {} [{}]",
                key,
                ffi::vix_error_text(err),
                err
            ));
        }

        let mut buf = vec![0u8; required.max(1)];
        let err = unsafe {
            ffi::VixDiskLib_ReadMetadata(
                self.handle,
                c_key.as_ptr(),
                buf.as_mut_ptr() as *mut c_char,
                buf.len(),
                ptr::null_mut(),
            )
        };
        ffi::vix_check(err, &format!("failed to read metadata for key {}", key))?;
        buf.truncate(required);
        Ok(buf)
    }

    fn query_allocated_blocks(
        &mut self,
        start_sector: u64,
        num_sectors: u64,
        chunk_size: u64,
    ) -> Result<Vec<BlockExtent>, Error> {
        let mut list: *mut ffi::VixDiskLibBlockList = ptr::null_mut();
        let err = unsafe {
            ffi::VixDiskLib_QueryAllocatedBlocks(
                self.handle,
                start_sector,
                num_sectors,
                chunk_size,
                &mut list,
            )
        };
        ffi::vix_check(err, "failed to query allocated blocks")?;

        let blocks = unsafe { (*list).blocks() }
            .iter()
            .map(|block| BlockExtent {
                offset: block.offset,
                length: block.length,
            })
            .collect();
        unsafe { ffi::VixDiskLib_FreeBlockList(list) };

        Ok(blocks)
    }
}

impl DiskWrite for VddkDisk {
    fn info(&self) -> &DiskInfo {
        &self.info
    }

    fn write_sectors(&mut self, sector_offset: u64, buf: &[u8]) -> Result<(), Error> {
        let num_sectors = Self::check_sector_aligned(buf.len())?;
        let err = unsafe {
            ffi::VixDiskLib_Write(self.handle, sector_offset, num_sectors, buf.as_ptr())
        };
        ffi::vix_check(err, "VMDK write error")
    }

    fn write_metadata(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        let c_key = CString::new(key)?;
        let stripped = match value.split_last() {
            Some((0, rest)) => rest,
            _ => value,
        };
        let c_value = CString::new(stripped)
            .map_err(|_| format_err!("metadata value for key {} contains NUL bytes", key))?;
        let err = unsafe {
            ffi::VixDiskLib_WriteMetadata(self.handle, c_key.as_ptr(), c_value.as_ptr())
        };
        ffi::vix_check(err, &format!("failed to write metadata for key {}", key))
    }
}
