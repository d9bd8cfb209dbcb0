//! C-ABI host bridge around `netkit-core`.
//!
//! # Overview
//! Lets a host platform with a C FFI build transport-native requests and
//! classify the responses it receives, without linking to Rust's async
//! runtime. The host performs the I/O; this crate only shapes requests and
//! judges status codes.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - Requests are assembled through an opaque `FfiRequestBuilder` that
//!   mirrors the core `RequestDescriptor` builder 1:1.
//! - A single `FfiResult` envelope conveys validation success and errors
//!   uniformly.
//! - The C caller owns all returned pointers and must call the matching
//!   `netkit_*_free` / `netkit_free_*` function to release them.

pub mod types;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use bytes::Bytes;
use netkit_core::config::SessionConfiguration;
use netkit_core::decode;
use netkit_core::http::HttpResponseInfo;
use netkit_core::request::RequestDescriptor;
use netkit_core::status::{self, StatusCategory};

use types::*;

/// Borrow a C string as UTF-8. Invalid UTF-8 reads as empty.
///
/// # Safety
/// `s` must be a valid, NUL-terminated C string that outlives the borrow.
unsafe fn read_str<'a>(s: *const c_char) -> &'a str {
    unsafe { CStr::from_ptr(s) }.to_str().unwrap_or("")
}

// ---------------------------------------------------------------------------
// Request builder
// ---------------------------------------------------------------------------

/// Start a request for `method` against `base_url`.
///
/// Returns null if `base_url` is null or if an internal panic occurs.
/// The caller must free the returned pointer with `netkit_request_free`.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_new(method: FfiHttpMethod, base_url: *const c_char) -> *mut FfiRequestBuilder {
    catch_unwind(|| {
        if base_url.is_null() {
            return std::ptr::null_mut();
        }
        let url = unsafe { read_str(base_url) };
        let descriptor = RequestDescriptor::new(method.into(), url);
        Box::into_raw(Box::new(FfiRequestBuilder { descriptor }))
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Append a query parameter. Parameters keep their insertion order.
///
/// Returns false if any argument is null.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_add_parameter(
    builder: *mut FfiRequestBuilder,
    key: *const c_char,
    value: *const c_char,
) -> bool {
    catch_unwind(AssertUnwindSafe(|| {
        if builder.is_null() || key.is_null() || value.is_null() {
            return false;
        }
        let builder = unsafe { &mut *builder };
        let (key, value) = unsafe { (read_str(key), read_str(value)) };
        builder.update(|d| d.parameter(key, value));
        true
    }))
    .unwrap_or(false)
}

/// Set a header. A later header with the same name (ignoring case) wins.
///
/// Returns false if any argument is null.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_add_header(
    builder: *mut FfiRequestBuilder,
    name: *const c_char,
    value: *const c_char,
) -> bool {
    catch_unwind(AssertUnwindSafe(|| {
        if builder.is_null() || name.is_null() || value.is_null() {
            return false;
        }
        let builder = unsafe { &mut *builder };
        let (name, value) = unsafe { (read_str(name), read_str(value)) };
        builder.update(|d| d.header(name, value));
        true
    }))
    .unwrap_or(false)
}

/// Copy `len` bytes from `data` into the request body.
///
/// `data` may be null only when `len` is zero. Returns false on a null
/// builder or a null non-empty body.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_set_body(builder: *mut FfiRequestBuilder, data: *const u8, len: u32) -> bool {
    catch_unwind(AssertUnwindSafe(|| {
        if builder.is_null() || (data.is_null() && len > 0) {
            return false;
        }
        let builder = unsafe { &mut *builder };
        let body = if len == 0 {
            Bytes::new()
        } else {
            Bytes::copy_from_slice(unsafe { std::slice::from_raw_parts(data, len as usize) })
        };
        builder.update(|d| d.body(body));
        true
    }))
    .unwrap_or(false)
}

/// Set the timeout forwarded to the transport, in milliseconds.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_set_timeout(builder: *mut FfiRequestBuilder, timeout_ms: u64) -> bool {
    catch_unwind(AssertUnwindSafe(|| {
        if builder.is_null() {
            return false;
        }
        let builder = unsafe { &mut *builder };
        builder.update(|d| d.timeout(Duration::from_millis(timeout_ms)));
        true
    }))
    .unwrap_or(false)
}

/// Build the transport-native request.
///
/// Returns null if `builder` is null or the URL is unusable. The builder
/// stays valid and can be built again. The caller must free the returned
/// pointer with `netkit_free_request`.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_build(builder: *const FfiRequestBuilder) -> *mut FfiHttpRequest {
    catch_unwind(AssertUnwindSafe(|| {
        if builder.is_null() {
            return std::ptr::null_mut();
        }
        let builder = unsafe { &*builder };
        match builder.descriptor.build(&SessionConfiguration::default()) {
            Ok(req) => FfiHttpRequest::from_core(req),
            Err(_) => std::ptr::null_mut(),
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Free a builder created by `netkit_request_new`. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_free(builder: *mut FfiRequestBuilder) {
    if !builder.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(builder) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Response classification
// ---------------------------------------------------------------------------

/// Validate a received response's status.
///
/// `headers` may be null only when `headers_len` is zero. Header keys or
/// values that are null are skipped.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_validate_response(status: u16, headers: *const FfiHeader, headers_len: u32) -> *mut FfiResult {
    catch_unwind(|| {
        if headers.is_null() && headers_len > 0 {
            return FfiResult::null_arg("headers");
        }
        let mut info = HttpResponseInfo::new(status);
        if headers_len > 0 {
            let headers = unsafe { std::slice::from_raw_parts(headers, headers_len as usize) };
            for h in headers.iter().filter(|h| !h.key.is_null() && !h.value.is_null()) {
                let (key, value) = unsafe { (read_str(h.key), read_str(h.value)) };
                info = info.with_header(key, value);
            }
        }
        match decode::validate(Some(info)) {
            Ok(info) => FfiResult::ok(info.status),
            Err(e) => FfiResult::from_error(e),
        }
    })
    .unwrap_or_else(|_| FfiResult::panic("panic in netkit_validate_response"))
}

/// Category of `code`.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_status_category(code: u16) -> FfiStatusCategory {
    StatusCategory::from_code(code).into()
}

/// Reason phrase for `code`. Free with `netkit_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_status_description(code: u16) -> *mut c_char {
    catch_unwind(|| c_string(status::description(code))).unwrap_or(std::ptr::null_mut())
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Free an `FfiHttpRequest` returned by `netkit_request_build`.
/// Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_free_request(req: *mut FfiHttpRequest) {
    if req.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let req = unsafe { Box::from_raw(req) };
        if !req.url.is_null() {
            drop(unsafe { CString::from_raw(req.url) });
        }
        if !req.body.is_null() {
            drop(unsafe { reclaim_slice(req.body, req.body_len) });
        }
        if !req.headers.is_null() {
            let headers = unsafe { reclaim_slice(req.headers, req.headers_len) };
            for h in headers.iter() {
                if !h.key.is_null() {
                    drop(unsafe { CString::from_raw(h.key) });
                }
                if !h.value.is_null() {
                    drop(unsafe { CString::from_raw(h.value) });
                }
            }
        }
    }));
}

/// Free an `FfiResult` returned by `netkit_validate_response`.
/// Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_free_result(result: *mut FfiResult) {
    if result.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let result = unsafe { Box::from_raw(result) };
        if !result.error_message.is_null() {
            drop(unsafe { CString::from_raw(result.error_message) });
        }
    }));
}

/// Free a C string allocated by this library. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { CString::from_raw(s) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
