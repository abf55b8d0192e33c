//! Minimal CUDA driver FFI used by the device pool.
//!
//! The driver library is opened at runtime (`dlopen` on Linux,
//! `LoadLibraryA` on Windows) so hosts without an NVIDIA driver still load
//! this crate and simply report zero devices.

use std::ffi::{CStr, CString, c_char, c_int, c_uint, c_void};
use std::sync::OnceLock;

pub type CUresult = c_int;
pub type CUdevice = c_int;
pub type CUcontext = *mut c_void;

pub const CUDA_SUCCESS: CUresult = 0;

/// Failure inside the driver layer, before it is tied to a device id.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DriverError {
    #[error("CUDA driver not loaded: {0}")]
    Load(String),
    #[error("{call} failed with CUDA error code {code}")]
    Call { call: &'static str, code: CUresult },
}

#[inline]
fn check_cu(code: CUresult, call: &'static str) -> Result<(), DriverError> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(DriverError::Call { call, code })
    }
}

// ─── Library loading ─────────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
mod loader {
    use super::*;

    unsafe extern "C" {
        fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void;
        fn dlerror() -> *const c_char;
        fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
    }

    const RTLD_NOW: c_int = 2;
    const RTLD_LOCAL: c_int = 0;

    fn last_error(fallback: &str) -> String {
        // SAFETY: dlerror returns a thread-local C string or null.
        unsafe {
            let p = dlerror();
            if p.is_null() {
                fallback.to_string()
            } else {
                CStr::from_ptr(p).to_string_lossy().into_owned()
            }
        }
    }

    pub(super) fn open() -> Result<*mut c_void, String> {
        let mut last_err = "unknown dlopen error".to_string();
        for candidate in ["libcuda.so.1", "libcuda.so"] {
            let soname =
                CString::new(candidate).map_err(|_| format!("invalid soname: {candidate}"))?;
            // SAFETY: NUL-terminated soname and valid dlopen flags.
            let handle = unsafe { dlopen(soname.as_ptr(), RTLD_NOW | RTLD_LOCAL) };
            if !handle.is_null() {
                return Ok(handle);
            }
            last_err = last_error("unknown dlopen error");
        }
        Err(format!("dlopen(libcuda.so.1|libcuda.so) failed: {last_err}"))
    }

    pub(super) fn symbol(handle: *mut c_void, name: &CStr) -> Result<*mut c_void, String> {
        // SAFETY: handle came from dlopen and name is NUL-terminated.
        let ptr = unsafe { dlsym(handle, name.as_ptr()) };
        if ptr.is_null() {
            Err(format!(
                "dlsym({}) failed: {}",
                name.to_string_lossy(),
                last_error("unknown dlsym error")
            ))
        } else {
            Ok(ptr)
        }
    }
}

#[cfg(windows)]
mod loader {
    use super::*;

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn LoadLibraryA(name: *const c_char) -> *mut c_void;
        fn GetProcAddress(module: *mut c_void, name: *const c_char) -> *mut c_void;
        fn GetLastError() -> u32;
    }

    pub(super) fn open() -> Result<*mut c_void, String> {
        // SAFETY: static NUL-terminated library name.
        let handle = unsafe { LoadLibraryA(c"nvcuda.dll".as_ptr()) };
        if handle.is_null() {
            // SAFETY: plain thread-local error query.
            let code = unsafe { GetLastError() };
            Err(format!("LoadLibrary(nvcuda.dll) failed: error {code}"))
        } else {
            Ok(handle)
        }
    }

    pub(super) fn symbol(handle: *mut c_void, name: &CStr) -> Result<*mut c_void, String> {
        // SAFETY: handle came from LoadLibraryA and name is NUL-terminated.
        let ptr = unsafe { GetProcAddress(handle, name.as_ptr()) };
        if ptr.is_null() {
            // SAFETY: plain thread-local error query.
            let code = unsafe { GetLastError() };
            Err(format!(
                "GetProcAddress({}) failed: error {code}",
                name.to_string_lossy()
            ))
        } else {
            Ok(ptr)
        }
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
mod loader {
    use super::*;

    pub(super) fn open() -> Result<*mut c_void, String> {
        Err("no CUDA driver on this platform".to_string())
    }

    pub(super) fn symbol(_handle: *mut c_void, name: &CStr) -> Result<*mut c_void, String> {
        Err(format!("{} unavailable", name.to_string_lossy()))
    }
}

// ─── Driver API table ────────────────────────────────────────────────────────

/// Resolved driver entry points. `cuInit` has already succeeded.
pub struct DriverApi {
    cu_device_get_count: unsafe extern "C" fn(*mut c_int) -> CUresult,
    cu_device_get: unsafe extern "C" fn(*mut CUdevice, c_int) -> CUresult,
    cu_device_primary_ctx_retain: unsafe extern "C" fn(*mut CUcontext, CUdevice) -> CUresult,
    cu_device_primary_ctx_release_v2: unsafe extern "C" fn(CUdevice) -> CUresult,
    cu_ctx_push_current_v2: unsafe extern "C" fn(CUcontext) -> CUresult,
    cu_ctx_pop_current_v2: unsafe extern "C" fn(*mut CUcontext) -> CUresult,
    cu_mem_get_info_v2: unsafe extern "C" fn(*mut usize, *mut usize) -> CUresult,
}

static DRIVER_API: OnceLock<Result<DriverApi, String>> = OnceLock::new();

fn load_symbol<T: Copy>(handle: *mut c_void, name: &CStr) -> Result<T, String> {
    let ptr = loader::symbol(handle, name)?;
    // SAFETY: ptr is the address of the named driver function, whose C
    // signature matches T.
    Ok(unsafe { std::mem::transmute_copy(&ptr) })
}

fn init_driver_api() -> Result<DriverApi, String> {
    let handle = loader::open()?;
    let cu_init: unsafe extern "C" fn(c_uint) -> CUresult = load_symbol(handle, c"cuInit")?;
    // SAFETY: resolved from the driver; flags must be 0.
    let rc = unsafe { cu_init(0) };
    if rc != CUDA_SUCCESS {
        return Err(format!("cuInit failed with CUDA error code {rc}"));
    }
    Ok(DriverApi {
        cu_device_get_count: load_symbol(handle, c"cuDeviceGetCount")?,
        cu_device_get: load_symbol(handle, c"cuDeviceGet")?,
        cu_device_primary_ctx_retain: load_symbol(handle, c"cuDevicePrimaryCtxRetain")?,
        cu_device_primary_ctx_release_v2: load_symbol(handle, c"cuDevicePrimaryCtxRelease_v2")?,
        cu_ctx_push_current_v2: load_symbol(handle, c"cuCtxPushCurrent_v2")?,
        cu_ctx_pop_current_v2: load_symbol(handle, c"cuCtxPopCurrent_v2")?,
        cu_mem_get_info_v2: load_symbol(handle, c"cuMemGetInfo_v2")?,
    })
}

/// The process-wide driver table, loading and initializing it on first use.
pub fn driver_api() -> Result<&'static DriverApi, DriverError> {
    DRIVER_API
        .get_or_init(init_driver_api)
        .as_ref()
        .map_err(|e| DriverError::Load(e.clone()))
}

impl DriverApi {
    pub fn device_count(&self) -> Result<i32, DriverError> {
        let mut count: c_int = 0;
        // SAFETY: count is a valid writable pointer.
        check_cu(
            unsafe { (self.cu_device_get_count)(&mut count) },
            "cuDeviceGetCount",
        )?;
        Ok(count.max(0))
    }

    pub fn device(&self, ordinal: i32) -> Result<CUdevice, DriverError> {
        let mut dev: CUdevice = 0;
        // SAFETY: dev is a valid writable pointer.
        check_cu(unsafe { (self.cu_device_get)(&mut dev, ordinal) }, "cuDeviceGet")?;
        Ok(dev)
    }

    pub fn retain_primary_context(&self, dev: CUdevice) -> Result<CUcontext, DriverError> {
        let mut ctx: CUcontext = std::ptr::null_mut();
        // SAFETY: ctx is a valid writable pointer; dev came from cuDeviceGet.
        check_cu(
            unsafe { (self.cu_device_primary_ctx_retain)(&mut ctx, dev) },
            "cuDevicePrimaryCtxRetain",
        )?;
        Ok(ctx)
    }

    pub fn release_primary_context(&self, dev: CUdevice) -> Result<(), DriverError> {
        // SAFETY: dev had its primary context retained by this process.
        check_cu(
            unsafe { (self.cu_device_primary_ctx_release_v2)(dev) },
            "cuDevicePrimaryCtxRelease_v2",
        )
    }

    /// `(free, total)` bytes of the device owning `ctx`.
    pub fn mem_get_info(&self, ctx: CUcontext) -> Result<(usize, usize), DriverError> {
        // SAFETY: ctx is a retained primary context.
        check_cu(
            unsafe { (self.cu_ctx_push_current_v2)(ctx) },
            "cuCtxPushCurrent_v2",
        )?;
        let (mut free, mut total) = (0usize, 0usize);
        // SAFETY: both pointers are valid and writable; a context is current.
        let rc = unsafe { (self.cu_mem_get_info_v2)(&mut free, &mut total) };
        let mut popped: CUcontext = std::ptr::null_mut();
        // SAFETY: pops the context pushed above.
        let pop_rc = unsafe { (self.cu_ctx_pop_current_v2)(&mut popped) };
        check_cu(rc, "cuMemGetInfo_v2")?;
        check_cu(pop_rc, "cuCtxPopCurrent_v2")?;
        Ok((free, total))
    }
}
