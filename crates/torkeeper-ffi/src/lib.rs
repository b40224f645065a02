//! C ABI bindings for the torkeeper core library.
//!
//! Gives native hosts (Android via a thin JNI shim, iOS, desktop) access to
//! one supervised Tor daemon per handle. Parameters and results cross the
//! boundary as JSON in NUL-terminated UTF-8 strings, using the camelCase
//! shapes of `torkeeper_core::api`.
//!
//! Strings returned by this library must be released with
//! [`tk_free_cstring`]. Every function tolerates null pointers.

#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

use serde::Serialize;
use std::ffi::{c_char, CStr, CString};
use std::sync::Once;
use tokio::runtime::Runtime;
use torkeeper_core::api::{HiddenServiceParams, HttpRequestParams, ServiceParams};
use torkeeper_core::TorService;
use tracing_subscriber::EnvFilter;

static LOGGING: Once = Once::new();

fn init_logging() {
    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}

/// Error body returned by operations that produce JSON.
#[derive(Serialize)]
struct ErrorJson {
    error: String,
}

fn error_json(error: impl ToString) -> String {
    serde_json::to_string(&ErrorJson {
        error: error.to_string(),
    })
    .unwrap_or_else(|_| r#"{"error":"serialization failed"}"#.to_string())
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(error_json)
}

/// One supervised daemon plus the runtime that drives it.
pub struct TorKeeperHandle {
    runtime: Runtime,
    service: TorService,
}

impl TorKeeperHandle {
    /// Handle that launches `tor` (or `$TOR_BIN`) on start.
    pub fn new() -> Result<Self, String> {
        Self::with_service(TorService::default())
    }

    /// Handle over an already assembled service.
    pub fn with_service(service: TorService) -> Result<Self, String> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("torkeeper")
            .build()
            .map_err(|e| format!("Failed to build runtime: {}", e))?;
        Ok(Self { runtime, service })
    }

    /// Validate and remember startup parameters.
    pub fn init_service(&self, params_json: &str) -> bool {
        match serde_json::from_str::<ServiceParams>(params_json) {
            Ok(params) => self.service.init_service(&params),
            Err(e) => {
                tracing::warn!(error = %e, "Malformed service parameters");
                false
            }
        }
    }

    /// Start unless running; `None` reuses the parameters of `init_service`.
    pub fn start_if_not_running(&self, params_json: Option<&str>) -> String {
        let params = match params_json.map(serde_json::from_str::<ServiceParams>).transpose() {
            Ok(params) => params,
            Err(e) => return error_json(format!("malformed service parameters: {}", e)),
        };
        let response = self
            .runtime
            .block_on(self.service.start_if_not_running(params.as_ref()));
        to_json(&response)
    }

    /// Current status.
    pub fn get_status(&self) -> String {
        to_json(&self.service.get_status())
    }

    /// Create a hidden service; `{"error": ...}` on failure.
    pub fn create_hidden_service(&self, params_json: &str) -> String {
        let params: HiddenServiceParams = match serde_json::from_str(params_json) {
            Ok(params) => params,
            Err(e) => return error_json(format!("malformed hidden service parameters: {}", e)),
        };
        match self.runtime.block_on(self.service.create_hidden_service(&params)) {
            Ok(response) => to_json(&response),
            Err(e) => error_json(e),
        }
    }

    /// Delete a hidden service. `false` on any failure.
    pub fn delete_hidden_service(&self, onion_address: &str) -> bool {
        match self
            .runtime
            .block_on(self.service.delete_hidden_service(onion_address))
        {
            Ok(deleted) => deleted,
            Err(e) if e.is_precondition() => {
                tracing::debug!(error = %e, "Hidden service deletion rejected");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Hidden service deletion failed");
                false
            }
        }
    }

    /// Hex secret key of a live hidden service.
    pub fn hidden_service_secret_key(&self, onion_address: &str) -> Option<String> {
        self.service.hidden_service_secret_key(onion_address).ok()
    }

    /// Tear down the daemon.
    pub fn shutdown_service(&self) -> bool {
        self.runtime.block_on(self.service.shutdown_service())
    }

    /// Proxied HTTP request; failures are reported in the `error` field.
    pub fn http_request(&self, params_json: &str) -> String {
        let params: HttpRequestParams = match serde_json::from_str(params_json) {
            Ok(params) => params,
            Err(e) => return error_json(format!("malformed request parameters: {}", e)),
        };
        to_json(&self.runtime.block_on(self.service.http_request(&params)))
    }
}

impl Drop for TorKeeperHandle {
    fn drop(&mut self) {
        // Hosts are expected to shut down first; make sure the daemon goes too.
        if !matches!(self.service.get_status().code, 0 | 4) {
            self.runtime.block_on(self.service.shutdown_service());
        }
    }
}

// ============================================================================
// C ABI
// ============================================================================

/// Borrow a C string as UTF-8. `None` for null or invalid UTF-8.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn borrow_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// # Safety
/// `handle` must be null or a pointer returned by [`tk_service_new`] that
/// has not been freed.
unsafe fn borrow_handle<'a>(handle: *const TorKeeperHandle) -> Option<&'a TorKeeperHandle> {
    handle.as_ref()
}

fn into_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(c) => c.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Create a service handle. Null on failure.
#[no_mangle]
pub extern "C" fn tk_service_new() -> *mut TorKeeperHandle {
    init_logging();
    match TorKeeperHandle::new() {
        Ok(handle) => Box::into_raw(Box::new(handle)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to create handle");
            std::ptr::null_mut()
        }
    }
}

/// Destroy a handle, shutting the daemon down if it still runs.
///
/// # Safety
/// `handle` must be null or a pointer returned by [`tk_service_new`]; it
/// must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn tk_service_free(handle: *mut TorKeeperHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Validate and remember startup parameters (`ServiceParams` JSON).
///
/// # Safety
/// Pointer arguments must be null or valid as described in the crate docs.
#[no_mangle]
pub unsafe extern "C" fn tk_init_service(
    handle: *const TorKeeperHandle,
    params_json: *const c_char,
) -> bool {
    match (borrow_handle(handle), borrow_str(params_json)) {
        (Some(handle), Some(params)) => handle.init_service(params),
        _ => false,
    }
}

/// Start unless running. Null `params_json` reuses the init parameters.
/// Returns `StartResponse` JSON.
///
/// # Safety
/// Pointer arguments must be null or valid as described in the crate docs.
#[no_mangle]
pub unsafe extern "C" fn tk_start_if_not_running(
    handle: *const TorKeeperHandle,
    params_json: *const c_char,
) -> *mut c_char {
    let Some(handle) = borrow_handle(handle) else {
        return into_c_string(error_json("null handle"));
    };
    if !params_json.is_null() && borrow_str(params_json).is_none() {
        return into_c_string(error_json("parameters are not valid UTF-8"));
    }
    into_c_string(handle.start_if_not_running(borrow_str(params_json)))
}

/// Returns `StatusResponse` JSON.
///
/// # Safety
/// `handle` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn tk_get_status(handle: *const TorKeeperHandle) -> *mut c_char {
    match borrow_handle(handle) {
        Some(handle) => into_c_string(handle.get_status()),
        None => into_c_string(error_json("null handle")),
    }
}

/// Create a hidden service from `HiddenServiceParams` JSON. Returns
/// `HiddenServiceResponse` JSON or `{"error": ...}`.
///
/// # Safety
/// Pointer arguments must be null or valid as described in the crate docs.
#[no_mangle]
pub unsafe extern "C" fn tk_create_hidden_service(
    handle: *const TorKeeperHandle,
    params_json: *const c_char,
) -> *mut c_char {
    match (borrow_handle(handle), borrow_str(params_json)) {
        (Some(handle), Some(params)) => into_c_string(handle.create_hidden_service(params)),
        (None, _) => into_c_string(error_json("null handle")),
        (_, None) => into_c_string(error_json("missing parameters")),
    }
}

/// Delete a hidden service by onion address.
///
/// # Safety
/// Pointer arguments must be null or valid as described in the crate docs.
#[no_mangle]
pub unsafe extern "C" fn tk_delete_hidden_service(
    handle: *const TorKeeperHandle,
    onion_address: *const c_char,
) -> bool {
    match (borrow_handle(handle), borrow_str(onion_address)) {
        (Some(handle), Some(address)) => handle.delete_hidden_service(address),
        _ => false,
    }
}

/// Hex secret key of a live hidden service, or null.
///
/// # Safety
/// Pointer arguments must be null or valid as described in the crate docs.
#[no_mangle]
pub unsafe extern "C" fn tk_hidden_service_secret_key(
    handle: *const TorKeeperHandle,
    onion_address: *const c_char,
) -> *mut c_char {
    match (borrow_handle(handle), borrow_str(onion_address)) {
        (Some(handle), Some(address)) => handle
            .hidden_service_secret_key(address)
            .map(into_c_string)
            .unwrap_or(std::ptr::null_mut()),
        _ => std::ptr::null_mut(),
    }
}

/// Tear down the daemon. `true` when there was nothing to do.
///
/// # Safety
/// `handle` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn tk_shutdown_service(handle: *const TorKeeperHandle) -> bool {
    match borrow_handle(handle) {
        Some(handle) => handle.shutdown_service(),
        None => false,
    }
}

/// Send an HTTP request from `HttpRequestParams` JSON. Returns
/// `HttpResponseBody` JSON.
///
/// # Safety
/// Pointer arguments must be null or valid as described in the crate docs.
#[no_mangle]
pub unsafe extern "C" fn tk_http_request(
    handle: *const TorKeeperHandle,
    params_json: *const c_char,
) -> *mut c_char {
    match (borrow_handle(handle), borrow_str(params_json)) {
        (Some(handle), Some(params)) => into_c_string(handle.http_request(params)),
        (None, _) => into_c_string(error_json("null handle")),
        (_, None) => into_c_string(error_json("missing parameters")),
    }
}

/// Release a string returned by this library.
///
/// # Safety
/// `s` must be null or a string returned by this library, freed once.
#[no_mangle]
pub unsafe extern "C" fn tk_free_cstring(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}
