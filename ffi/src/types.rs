//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! Each type mirrors a core type but uses C-compatible representations:
//! `*mut c_char` instead of `String`, pointer + length pairs instead of
//! `Vec` and `Bytes`, and enums with explicit discriminants. Conversion
//! functions live here to keep `lib.rs` focused on the `extern "C"` surface.

use std::ffi::CString;
use std::os::raw::c_char;

use netkit_core::error::{InternalError, NetworkingError};
use netkit_core::http::{HttpMethod, HttpRequest};
use netkit_core::request::RequestDescriptor;
use netkit_core::status::StatusCategory;

/// Opaque handle to a request under construction. C callers receive a
/// pointer to this from `netkit_request_new` and pass it back into every
/// `netkit_request_*` function.
pub struct FfiRequestBuilder {
    pub(crate) descriptor: RequestDescriptor,
}

impl FfiRequestBuilder {
    /// Replace the descriptor with the result of a consuming builder call.
    pub(crate) fn update(&mut self, f: impl FnOnce(RequestDescriptor) -> RequestDescriptor) {
        self.descriptor = f(self.descriptor.clone());
    }
}

/// Copy `s` into a C string owned by the caller. Interior NULs are dropped.
pub(crate) fn c_string(s: impl Into<String>) -> *mut c_char {
    let mut s = s.into();
    s.retain(|c| c != '\0');
    CString::new(s).unwrap_or_default().into_raw()
}

/// Hand a byte buffer to C as pointer + length. Empty buffers become null.
pub(crate) fn leak_slice<T>(items: Vec<T>) -> (*mut T, u32) {
    if items.is_empty() {
        return (std::ptr::null_mut(), 0);
    }
    let len = items.len() as u32;
    let ptr = Box::into_raw(items.into_boxed_slice()) as *mut T;
    (ptr, len)
}

/// Reclaim a buffer produced by `leak_slice`.
///
/// # Safety
/// `ptr` and `len` must come from one `leak_slice` call and must not have
/// been reclaimed before.
pub(crate) unsafe fn reclaim_slice<T>(ptr: *mut T, len: u32) -> Box<[T]> {
    unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len as usize)) }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// HTTP method as a C enum.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiHttpMethod {
    Get = 0,
    Post = 1,
    Put = 2,
    Delete = 3,
    Patch = 4,
    Head = 5,
    Options = 6,
    Trace = 7,
    Connect = 8,
}

impl From<HttpMethod> for FfiHttpMethod {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => FfiHttpMethod::Get,
            HttpMethod::Post => FfiHttpMethod::Post,
            HttpMethod::Put => FfiHttpMethod::Put,
            HttpMethod::Delete => FfiHttpMethod::Delete,
            HttpMethod::Patch => FfiHttpMethod::Patch,
            HttpMethod::Head => FfiHttpMethod::Head,
            HttpMethod::Options => FfiHttpMethod::Options,
            HttpMethod::Trace => FfiHttpMethod::Trace,
            HttpMethod::Connect => FfiHttpMethod::Connect,
        }
    }
}

impl From<FfiHttpMethod> for HttpMethod {
    fn from(m: FfiHttpMethod) -> Self {
        match m {
            FfiHttpMethod::Get => HttpMethod::Get,
            FfiHttpMethod::Post => HttpMethod::Post,
            FfiHttpMethod::Put => HttpMethod::Put,
            FfiHttpMethod::Delete => HttpMethod::Delete,
            FfiHttpMethod::Patch => HttpMethod::Patch,
            FfiHttpMethod::Head => HttpMethod::Head,
            FfiHttpMethod::Options => HttpMethod::Options,
            FfiHttpMethod::Trace => HttpMethod::Trace,
            FfiHttpMethod::Connect => HttpMethod::Connect,
        }
    }
}

/// A single HTTP header as a key-value pair of C strings.
#[repr(C)]
pub struct FfiHeader {
    pub key: *mut c_char,
    pub value: *mut c_char,
}

/// A transport-native request described as C-compatible plain data.
///
/// Built by `netkit_request_build`. The host executes it and reports the
/// response status and headers back through `netkit_validate_response`.
#[repr(C)]
pub struct FfiHttpRequest {
    pub method: FfiHttpMethod,
    pub url: *mut c_char,
    pub headers: *mut FfiHeader,
    pub headers_len: u32,
    /// Null when the request has no body.
    pub body: *mut u8,
    pub body_len: u32,
    pub timeout_ms: u64,
}

impl FfiHttpRequest {
    /// Convert a core `HttpRequest` into a heap-allocated `FfiHttpRequest`.
    pub(crate) fn from_core(req: HttpRequest) -> *mut Self {
        let headers: Vec<FfiHeader> = req
            .headers
            .into_iter()
            .map(|(k, v)| FfiHeader {
                key: c_string(k),
                value: c_string(v),
            })
            .collect();
        let (headers, headers_len) = leak_slice(headers);
        let (body, body_len) = leak_slice(req.body.map(|b| b.to_vec()).unwrap_or_default());

        Box::into_raw(Box::new(FfiHttpRequest {
            method: req.method.into(),
            url: c_string(req.url),
            headers,
            headers_len,
            body,
            body_len,
            timeout_ms: u64::try_from(req.timeout.as_millis()).unwrap_or(u64::MAX),
        }))
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Status category as a C enum.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiStatusCategory {
    Informational = 0,
    Success = 1,
    Redirection = 2,
    ClientError = 3,
    ServerError = 4,
    Unknown = 5,
}

impl From<StatusCategory> for FfiStatusCategory {
    fn from(c: StatusCategory) -> Self {
        match c {
            StatusCategory::Informational => FfiStatusCategory::Informational,
            StatusCategory::Success => FfiStatusCategory::Success,
            StatusCategory::Redirection => FfiStatusCategory::Redirection,
            StatusCategory::ClientError => FfiStatusCategory::ClientError,
            StatusCategory::ServerError => FfiStatusCategory::ServerError,
            StatusCategory::Unknown => FfiStatusCategory::Unknown,
        }
    }
}

/// Error codes returned in `FfiResult`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    Ok = 0,
    ClientError = 1,
    ServerError = 2,
    UnknownStatus = 3,
    InvalidUrl = 4,
    Internal = 5,
    Panic = 6,
    NullArg = 7,
}

/// Result envelope for response validation.
///
/// On success `error_code` is `Ok` and `error_message` is null. On failure
/// `error_code` describes the category and `error_message` is a
/// human-readable C string. `http_status` and `category` always echo the
/// validated status, or zero and `Unknown` when no status was involved.
#[repr(C)]
pub struct FfiResult {
    pub error_code: FfiErrorCode,
    pub error_message: *mut c_char,
    pub http_status: u16,
    pub category: FfiStatusCategory,
}

impl FfiResult {
    fn boxed(error_code: FfiErrorCode, error_message: *mut c_char, http_status: u16) -> *mut Self {
        Box::into_raw(Box::new(FfiResult {
            error_code,
            error_message,
            http_status,
            category: StatusCategory::from_code(http_status).into(),
        }))
    }

    /// Build a success result for `status`.
    pub(crate) fn ok(status: u16) -> *mut Self {
        Self::boxed(FfiErrorCode::Ok, std::ptr::null_mut(), status)
    }

    /// Build an error result from a `NetworkingError`.
    pub(crate) fn from_error(err: NetworkingError) -> *mut Self {
        let (error_code, status) = match &err {
            NetworkingError::Http(http) => {
                let code = match http.category {
                    StatusCategory::ClientError => FfiErrorCode::ClientError,
                    StatusCategory::ServerError => FfiErrorCode::ServerError,
                    _ => FfiErrorCode::UnknownStatus,
                };
                (code, http.status)
            }
            NetworkingError::Internal(InternalError::InvalidUrl { .. }) => (FfiErrorCode::InvalidUrl, 0),
            _ => (FfiErrorCode::Internal, 0),
        };
        Self::boxed(error_code, c_string(err.to_string()), status)
    }

    /// Build an error result for a null argument.
    pub(crate) fn null_arg(name: &str) -> *mut Self {
        Self::boxed(FfiErrorCode::NullArg, c_string(format!("null argument: {name}")), 0)
    }

    /// Build an error result for a caught panic.
    pub(crate) fn panic(msg: &str) -> *mut Self {
        Self::boxed(FfiErrorCode::Panic, c_string(msg), 0)
    }
}
