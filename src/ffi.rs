//! C-compatible FFI API for cross-language bindings.
//!
//! # ABI Contract
//!
//! All exported functions use `extern "C"` calling convention and `#[no_mangle]`
//! to ensure stable symbol names.
//!
//! ## Memory management
//! - Buffers returned by `tabex_*` functions are allocated on the Rust heap.
//! - Callers **must** free them with `tabex_free_buffer` / `tabex_free_string`.
//! - Passing a null pointer to a free function is a no-op.
//!
//! ## Error handling
//! - Functions that can fail return a `c_int` (0 = success, non-zero = error).
//! - Error details can be retrieved via `tabex_last_error`.
//!
//! ## Execution
//! - Each export runs to completion on a private single-threaded runtime;
//!   the call blocks until the file is ready.
//!
//! ## Usage from C
//! ```c
//! uint8_t *buf; uint32_t len; char *name;
//! if (tabex_export(json, json_len, TABEX_FORMAT_XLSX, NULL, "orders",
//!                  &buf, &len, &name, NULL) != 0) {
//!     fprintf(stderr, "%s\n", tabex_last_error());
//! }
//! tabex_free_buffer(buf, len);
//! tabex_free_string(name);
//! ```

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::slice;
use std::sync::Arc;

use crate::config::{ExportConfig, ExportFormat};
use crate::fetch::HttpFetcher;
use crate::pipeline::{run_export, ExportArtifact, ExportRequest};
use crate::progress::LogProgress;
use crate::source::MemorySource;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

// ---------------------------------------------------------------------------
// C-compatible types
// ---------------------------------------------------------------------------

/// Output format selector.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabexFormat {
    Xlsx = 0,
    Docx = 1,
    Pdf = 2,
}

impl From<TabexFormat> for ExportFormat {
    fn from(f: TabexFormat) -> Self {
        match f {
            TabexFormat::Xlsx => ExportFormat::Xlsx,
            TabexFormat::Docx => ExportFormat::Docx,
            TabexFormat::Pdf => ExportFormat::Pdf,
        }
    }
}

/// Read an optional null-terminated UTF-8 string.
///
/// # Safety
/// `s`, if non-null, must point to a valid null-terminated string.
unsafe fn opt_str<'a>(s: *const c_char) -> Result<Option<&'a str>, String> {
    if s.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(s)
        .to_str()
        .map(Some)
        .map_err(|e| format!("Invalid UTF-8: {e}"))
}

fn export_blocking(
    dataset: &[u8],
    format: ExportFormat,
    config: ExportConfig,
    file_name: Option<&str>,
) -> Result<ExportArtifact, (c_int, String)> {
    let source = MemorySource::from_json_bytes(dataset)
        .map_err(|e| (2, format!("Invalid dataset: {e}")))?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| (5, format!("Failed to start runtime: {e}")))?;

    let fetcher = HttpFetcher::new(config.fetch_timeout());
    let request = ExportRequest {
        file_name: file_name.map(str::to_string),
        ..ExportRequest::new(format)
    };
    runtime
        .block_on(run_export(
            Arc::new(source),
            &fetcher,
            &request,
            &config,
            &LogProgress,
        ))
        .map_err(|e| (4, e.to_string()))
}

// ---------------------------------------------------------------------------
// Core API
// ---------------------------------------------------------------------------

/// Export the first (or active) table of a JSON dataset.
///
/// # Parameters
/// - `dataset_ptr`, `dataset_len`: UTF-8 JSON dataset (not null-terminated)
/// - `format`: output format
/// - `config_json`: optional null-terminated JSON config, `NULL` for defaults
/// - `file_name`: optional null-terminated base name, `NULL` for the default
/// - `out_buf`, `out_len`: receive the file bytes
/// - `out_name`: receives the final file name (free with `tabex_free_string`)
/// - `out_layout_json`: optional; when non-null receives the layout as JSON
///   (free with `tabex_free_string`)
///
/// # Returns
/// `0` on success; `1` null argument, `2` invalid input, `3` invalid config,
/// `4` export failed, `5` runtime failure. On error, call `tabex_last_error`.
///
/// # Safety
/// - `dataset_ptr` must point to `dataset_len` valid bytes.
/// - `config_json` and `file_name`, if non-null, must be null-terminated.
/// - `out_buf`, `out_len` and `out_name` must be valid pointers.
/// - The caller must free `*out_buf` by calling `tabex_free_buffer`.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn tabex_export(
    dataset_ptr: *const u8,
    dataset_len: u32,
    format: TabexFormat,
    config_json: *const c_char,
    file_name: *const c_char,
    out_buf: *mut *mut u8,
    out_len: *mut u32,
    out_name: *mut *mut c_char,
    out_layout_json: *mut *mut c_char,
) -> c_int {
    if dataset_ptr.is_null() || out_buf.is_null() || out_len.is_null() || out_name.is_null() {
        set_last_error("Null pointer argument");
        return 1;
    }

    let config = match opt_str(config_json) {
        Ok(Some(json)) => match ExportConfig::from_json(json) {
            Ok(c) => c,
            Err(e) => {
                set_last_error(&e.to_string());
                return 3;
            }
        },
        Ok(None) => ExportConfig::default(),
        Err(e) => {
            set_last_error(&e);
            return 2;
        }
    };
    let file_name = match opt_str(file_name) {
        Ok(name) => name,
        Err(e) => {
            set_last_error(&e);
            return 2;
        }
    };

    let dataset = slice::from_raw_parts(dataset_ptr, dataset_len as usize);
    match export_blocking(dataset, format.into(), config, file_name) {
        Ok(artifact) => {
            let len = artifact.bytes.len() as u32;
            let buf = artifact.bytes.into_boxed_slice();
            *out_buf = Box::into_raw(buf) as *mut u8;
            *out_len = len;

            *out_name = CString::new(artifact.file_name)
                .map(CString::into_raw)
                .unwrap_or(ptr::null_mut());

            if !out_layout_json.is_null() {
                *out_layout_json = CString::new(artifact.layout.to_json())
                    .map(CString::into_raw)
                    .unwrap_or(ptr::null_mut());
            }
            0
        }
        Err((code, msg)) => {
            set_last_error(&msg);
            code
        }
    }
}

// ---------------------------------------------------------------------------
// Memory management
// ---------------------------------------------------------------------------

/// Free a file buffer returned by `tabex_export`.
///
/// # Safety
/// `buf` must have been returned by a previous `tabex_export` call, and `len`
/// must be the corresponding length.
#[no_mangle]
pub unsafe extern "C" fn tabex_free_buffer(buf: *mut u8, len: u32) {
    if !buf.is_null() {
        let _ = Box::from_raw(slice::from_raw_parts_mut(buf, len as usize));
    }
}

/// Free a string returned by `tabex_export` (file name or layout JSON).
///
/// # Safety
/// `s` must have been returned by Rust's `CString::into_raw`.
#[no_mangle]
pub unsafe extern "C" fn tabex_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = CString::from_raw(s);
    }
}

/// Retrieve the last error message. Returns a null-terminated string.
///
/// The returned pointer is valid until the next `tabex_*` call on the same
/// thread. The caller should **not** free this pointer.
///
/// Returns null if no error has occurred.
#[no_mangle]
pub extern "C" fn tabex_last_error() -> *const c_char {
    LAST_ERROR.with(|e| {
        let borrow = e.borrow();
        match borrow.as_ref() {
            Some(cs) => cs.as_ptr(),
            None => ptr::null(),
        }
    })
}

/// Return the library version as a null-terminated string.
/// The caller must **not** free this pointer.
#[no_mangle]
pub extern "C" fn tabex_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const DATASET: &str = r#"{
        "tables": [{
            "id": "t1", "name": "Orders",
            "fields": [{ "id": "f1", "name": "Customer" }, { "id": "f2", "name": "Qty" }],
            "records": [
                { "id": "r1", "cells": { "f1": "Ada", "f2": 3 } },
                { "id": "r2", "cells": { "f1": "Grace" } }
            ]
        }]
    }"#;

    #[test]
    fn ffi_export_xlsx() {
        let mut out_buf: *mut u8 = ptr::null_mut();
        let mut out_len: u32 = 0;
        let mut out_name: *mut c_char = ptr::null_mut();
        let mut layout: *mut c_char = ptr::null_mut();
        let name = CString::new("orders").unwrap();

        let rc = unsafe {
            tabex_export(
                DATASET.as_ptr(),
                DATASET.len() as u32,
                TabexFormat::Xlsx,
                ptr::null(),
                name.as_ptr(),
                &mut out_buf,
                &mut out_len,
                &mut out_name,
                &mut layout,
            )
        };

        assert_eq!(rc, 0, "Expected success");
        let bytes = unsafe { slice::from_raw_parts(out_buf, out_len as usize) };
        assert_eq!(&bytes[0..2], b"PK");
        let file_name = unsafe { CStr::from_ptr(out_name) }.to_str().unwrap();
        assert_eq!(file_name, "orders.xlsx");
        let json = unsafe { CStr::from_ptr(layout) }.to_str().unwrap();
        assert!(json.contains("column_widths"));

        unsafe {
            tabex_free_buffer(out_buf, out_len);
            tabex_free_string(out_name);
            tabex_free_string(layout);
        }
    }

    #[test]
    fn ffi_null_input() {
        let mut out_buf: *mut u8 = ptr::null_mut();
        let mut out_len: u32 = 0;
        let mut out_name: *mut c_char = ptr::null_mut();

        let rc = unsafe {
            tabex_export(
                ptr::null(),
                0,
                TabexFormat::Pdf,
                ptr::null(),
                ptr::null(),
                &mut out_buf,
                &mut out_len,
                &mut out_name,
                ptr::null_mut(),
            )
        };

        assert_eq!(rc, 1, "Should fail on null input");
        let err = unsafe { CStr::from_ptr(tabex_last_error()) }.to_str().unwrap();
        assert_eq!(err, "Null pointer argument");
    }

    #[test]
    fn ffi_bad_config_is_reported() {
        let mut out_buf: *mut u8 = ptr::null_mut();
        let mut out_len: u32 = 0;
        let mut out_name: *mut c_char = ptr::null_mut();
        let config = CString::new("{ \"font_size\": \"big\" }").unwrap();

        let rc = unsafe {
            tabex_export(
                DATASET.as_ptr(),
                DATASET.len() as u32,
                TabexFormat::Docx,
                config.as_ptr(),
                ptr::null(),
                &mut out_buf,
                &mut out_len,
                &mut out_name,
                ptr::null_mut(),
            )
        };

        assert_eq!(rc, 3);
        assert!(out_buf.is_null());
    }

    #[test]
    fn ffi_version() {
        let v = tabex_version();
        let version = unsafe { CStr::from_ptr(v) }.to_str().unwrap();
        assert_eq!(version, env!("CARGO_PKG_VERSION"));
    }
}
