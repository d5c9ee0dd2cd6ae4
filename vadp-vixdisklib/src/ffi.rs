//! Bindings for vixDiskLib
//!
//! Incomplete, but we currently do not need more.
//!
//! See: `vixDiskLib.h` in the VMware VDDK distribution. Structs mirror the
//! VDDK 6.5/6.7 ABI; the library allocates `VixDiskLibConnectParams` itself
//! (`VixDiskLib_AllocateConnectParams`), we only fill in the fields.

#![allow(non_snake_case)]

use std::ffi::CStr;
use std::ptr;

use anyhow::{bail, Error};
use libc::{c_char, c_int, c_void};

pub type VixError = u64;

pub const VIX_OK: VixError = 0;
pub const VIX_E_BUFFER_TOOSMALL: VixError = 24;

pub type VixDiskLibConnection = *mut c_void;
pub type VixDiskLibHandle = *mut c_void;

pub const VIXDISKLIB_FLAG_OPEN_UNBUFFERED: u32 = 1;
pub const VIXDISKLIB_FLAG_OPEN_SINGLE_LINK: u32 = 2;
pub const VIXDISKLIB_FLAG_OPEN_READ_ONLY: u32 = 4;

pub const VIXDISKLIB_SPEC_VMX: c_int = 0;
pub const VIXDISKLIB_CRED_UID: c_int = 1;

/// Hardware version written into created disks (ESX(i) 4 and later).
pub const VIXDISKLIB_HWVERSION_ESX4X: u16 = 7;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VixDiskLibGeometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
}

#[repr(C)]
pub struct VixDiskLibInfo {
    pub biosGeo: VixDiskLibGeometry,
    pub physGeo: VixDiskLibGeometry,
    pub capacity: u64,
    pub adapterType: c_int,
    pub numLinks: c_int,
    pub parentFileNameHint: *mut c_char,
    pub uuid: *mut c_char,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VixDiskLibUidPasswdCreds {
    pub userName: *mut c_char,
    pub password: *mut c_char,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VixDiskLibSessionIdCreds {
    pub cookie: *mut c_char,
    pub userName: *mut c_char,
    pub key: *mut c_char,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VixDiskLibTicketIdCreds {
    pub dummy: *mut c_char,
}

#[repr(C)]
pub union VixDiskLibCreds {
    pub uid: VixDiskLibUidPasswdCreds,
    pub sessionId: VixDiskLibSessionIdCreds,
    pub ticketId: VixDiskLibTicketIdCreds,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VixDiskLibVStorageObjectSpec {
    pub id: *mut c_char,
    pub datastoreMoRef: *mut c_char,
    pub ssId: *mut c_char,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VixDiskLibRdsSpec {
    pub id: *mut c_char,
}

#[repr(C)]
pub union VixDiskLibSpec {
    pub vStorageObjSpec: VixDiskLibVStorageObjectSpec,
    pub rdsObjSpec: VixDiskLibRdsSpec,
}

#[repr(C)]
pub struct VixDiskLibConnectParams {
    pub specType: c_int,
    pub spec: VixDiskLibSpec,
    pub vmxSpec: *mut c_char,
    pub serverName: *mut c_char,
    pub thumbPrint: *mut c_char,
    pub privateUse: libc::c_long,
    pub credType: c_int,
    pub creds: VixDiskLibCreds,
    pub port: u32,
    pub nfcHostPort: u32,
    pub vimApiVer: *mut c_char,
}

#[repr(C)]
pub struct VixDiskLibCreateParams {
    pub diskType: c_int,
    pub adapterType: c_int,
    pub hwVersion: u16,
    pub capacity: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VixDiskLibBlock {
    pub offset: u64,
    pub length: u64,
}

#[repr(C)]
pub struct VixDiskLibBlockList {
    pub numBlocks: u32,
    // Trailing flexible array member, access through `blocks()`.
    pub blocks: [VixDiskLibBlock; 1],
}

impl VixDiskLibBlockList {
    /// # Safety
    ///
    /// `self` must point into a list allocated by the library so that
    /// `numBlocks` entries are actually present behind `blocks`.
    pub unsafe fn blocks(&self) -> &[VixDiskLibBlock] {
        std::slice::from_raw_parts(self.blocks.as_ptr(), self.numBlocks as usize)
    }
}

/// `void (*)(const char *fmt, va_list args)` - the va_list is opaque to us
/// and only ever forwarded to `vsnprintf`.
pub type VixDiskLibGenericLogFunc = extern "C" fn(fmt: *const c_char, args: *mut c_void);

#[link(name = "vixDiskLib")]
extern "C" {
    pub fn VixDiskLib_InitEx(
        majorVersion: u32,
        minorVersion: u32,
        log: Option<VixDiskLibGenericLogFunc>,
        warn: Option<VixDiskLibGenericLogFunc>,
        panic: Option<VixDiskLibGenericLogFunc>,
        libDir: *const c_char,
        configFile: *const c_char,
    ) -> VixError;

    pub fn VixDiskLib_Exit();

    pub fn VixDiskLib_AllocateConnectParams() -> *mut VixDiskLibConnectParams;
    pub fn VixDiskLib_FreeConnectParams(params: *mut VixDiskLibConnectParams);

    pub fn VixDiskLib_PrepareForAccess(
        params: *const VixDiskLibConnectParams,
        identity: *const c_char,
    ) -> VixError;

    pub fn VixDiskLib_EndAccess(
        params: *const VixDiskLibConnectParams,
        identity: *const c_char,
    ) -> VixError;

    pub fn VixDiskLib_ConnectEx(
        params: *const VixDiskLibConnectParams,
        readOnly: c_char,
        snapshotRef: *const c_char,
        transportModes: *const c_char,
        connection: *mut VixDiskLibConnection,
    ) -> VixError;

    pub fn VixDiskLib_Disconnect(connection: VixDiskLibConnection) -> VixError;

    pub fn VixDiskLib_Cleanup(
        params: *const VixDiskLibConnectParams,
        numCleanedUp: *mut u32,
        numRemaining: *mut u32,
    ) -> VixError;

    pub fn VixDiskLib_Open(
        connection: VixDiskLibConnection,
        path: *const c_char,
        flags: u32,
        handle: *mut VixDiskLibHandle,
    ) -> VixError;

    pub fn VixDiskLib_Close(handle: VixDiskLibHandle) -> VixError;

    pub fn VixDiskLib_Create(
        connection: VixDiskLibConnection,
        path: *const c_char,
        createParams: *const VixDiskLibCreateParams,
        progressFunc: *const c_void,
        progressCallbackData: *mut c_void,
    ) -> VixError;

    pub fn VixDiskLib_GetInfo(handle: VixDiskLibHandle, info: *mut *mut VixDiskLibInfo)
        -> VixError;
    pub fn VixDiskLib_FreeInfo(info: *mut VixDiskLibInfo);

    pub fn VixDiskLib_GetTransportMode(handle: VixDiskLibHandle) -> *const c_char;

    pub fn VixDiskLib_Read(
        handle: VixDiskLibHandle,
        startSector: u64,
        numSectors: u64,
        readBuffer: *mut u8,
    ) -> VixError;

    pub fn VixDiskLib_Write(
        handle: VixDiskLibHandle,
        startSector: u64,
        numSectors: u64,
        writeBuffer: *const u8,
    ) -> VixError;

    pub fn VixDiskLib_GetMetadataKeys(
        handle: VixDiskLibHandle,
        keys: *mut c_char,
        maxLen: usize,
        requiredLen: *mut usize,
    ) -> VixError;

    pub fn VixDiskLib_ReadMetadata(
        handle: VixDiskLibHandle,
        key: *const c_char,
        buf: *mut c_char,
        bufLen: usize,
        requiredLen: *mut usize,
    ) -> VixError;

    pub fn VixDiskLib_WriteMetadata(
        handle: VixDiskLibHandle,
        key: *const c_char,
        val: *const c_char,
    ) -> VixError;

    pub fn VixDiskLib_QueryAllocatedBlocks(
        handle: VixDiskLibHandle,
        startSector: u64,
        numSectors: u64,
        chunkSize: u64,
        blockList: *mut *mut VixDiskLibBlockList,
    ) -> VixError;

    pub fn VixDiskLib_FreeBlockList(blockList: *mut VixDiskLibBlockList) -> VixError;

    pub fn VixDiskLib_GetErrorText(err: VixError, locale: *const c_char) -> *mut c_char;
    pub fn VixDiskLib_FreeErrorText(errMsg: *mut c_char);
}

extern "C" {
    // From the C runtime, used to expand the library's log callbacks. On the
    // platforms we run on a va_list decays to a pointer when passed on.
    fn vsnprintf(s: *mut c_char, n: usize, format: *const c_char, ap: *mut c_void) -> c_int;
}

/// Expand a `(fmt, va_list)` pair handed to a log callback into a `String`.
pub fn format_log_message(fmt: *const c_char, args: *mut c_void) -> String {
    let mut buf = [0u8; 4096];
    let len = unsafe { vsnprintf(buf.as_mut_ptr() as *mut c_char, buf.len(), fmt, args) };
    if len < 0 {
        return match unsafe { CStr::from_ptr(fmt) }.to_str() {
            Ok(fmt) => fmt.trim_end().to_string(),
            Err(_) => String::from("<unprintable log message>"),
        };
    }
    let len = (len as usize).min(buf.len() - 1);
    String::from_utf8_lossy(&buf[..len]).trim_end().to_string()
}

/// Fetch and free the library's error text for `err`.
pub fn vix_error_text(err: VixError) -> String {
    unsafe {
        let msg = VixDiskLib_GetErrorText(err, ptr::null());
        if msg.is_null() {
            return format!("unknown error {}", err);
        }
        let text = CStr::from_ptr(msg).to_string_lossy().into_owned();
        VixDiskLib_FreeErrorText(msg);
        text
    }
}

/// Turn a library status into a `Result`, formatting the error text and the
/// numeric code the way all our diagnostics do.
pub fn vix_check(err: VixError, what: &str) -> Result<(), Error> {
    if err != VIX_OK {
        bail!("{}: {} [{}]", what, vix_error_text(err), err);
    }
    Ok(())
}
