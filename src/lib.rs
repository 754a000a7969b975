// mitm_injector
//
// Response content mutator for an intercepting proxy.  Eligible HTML
// responses get a configured markup fragment and a nonce-bearing <script>
// appended, and their Content-Security-Policy (header and meta) is either
// stripped or extended with the same nonce.
//
// The crate is built as an `rlib` for Rust proxies (see `Pipeline` /
// `ResponseHook`) and as a `cdylib` so non-Rust proxy engines can call it
// through the C ABI below.
//
// Exposed functions:
//   mutator_new(config: *const c_char) -> *mut Pipeline
//   mutator_process(pipeline: *const Pipeline, response: *const c_char) -> *mut c_char
//   mutator_free(pipeline: *mut Pipeline)
//   free_string(ptr: *mut c_char)
//
// Response envelope (input and output):
//   { "host": "…", "path": "…", "headers": [["name", "value"], …], "body": "<base64>" }
// The output additionally carries "mutated": true|false.
//
// Returned strings are allocated with CString; the caller MUST release them
// with `free_string`.

pub mod body;
pub mod config;
pub mod csp;
pub mod dom;
pub mod error;
pub mod filter;
pub mod inject;
pub mod nonce;
pub mod pipeline;
pub mod response;

pub use config::Config;
pub use error::{Error, Result};
pub use nonce::Nonce;
pub use pipeline::{Outcome, Pipeline, ResponseHook, Skip, Stage};
pub use response::Response;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ResponseIn {
    host: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    headers: Vec<(String, String)>,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Serialize)]
struct ResponseOut {
    host: String,
    path: String,
    headers: Vec<(String, String)>,
    body: String,
    mutated: bool,
}

fn decode_envelope(json: &str) -> Option<Response> {
    let input: ResponseIn = serde_json::from_str(json).ok()?;

    let mut headers = HeaderMap::new();
    for (name, value) in &input.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
        let value = HeaderValue::from_str(value).ok()?;
        headers.append(name, value);
    }
    let body = STANDARD.decode(input.body.as_bytes()).ok()?;

    Some(
        Response::new(input.host, input.path)
            .with_headers(headers)
            .with_body(body),
    )
}

fn encode_envelope(response: Response, mutated: bool) -> Option<String> {
    let headers = response
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let out = ResponseOut {
        host: response.host,
        path: response.path,
        headers,
        body: STANDARD.encode(&response.body),
        mutated,
    };
    serde_json::to_string(&out).ok()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Convert a Rust String into a heap-allocated C string.
fn to_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Read a `*const c_char` into a `&str`.  Returns `None` on null or invalid
/// UTF-8.
unsafe fn read_c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

// ---------------------------------------------------------------------------
// C ABI exports
// ---------------------------------------------------------------------------

/// Build a pipeline from a JSON configuration object.
///
/// Returns null when the configuration cannot be parsed.  Release with
/// `mutator_free`.
#[no_mangle]
pub unsafe extern "C" fn mutator_new(config: *const c_char) -> *mut Pipeline {
    let json = match read_c_str(config) {
        Some(s) => s,
        None => return ptr::null_mut(),
    };
    match Config::from_json(json) {
        Ok(config) => Box::into_raw(Box::new(Pipeline::new(config))),
        Err(err) => {
            log::error!("rejected configuration: {}", err);
            ptr::null_mut()
        }
    }
}

/// Run one response through the pipeline.
///
/// Input: the response envelope as JSON.
/// Returns: the (possibly unmodified) response envelope, or null when the
/// input is not a valid envelope.
#[no_mangle]
pub unsafe extern "C" fn mutator_process(
    pipeline: *const Pipeline,
    response: *const c_char,
) -> *mut c_char {
    if pipeline.is_null() {
        return ptr::null_mut();
    }
    let json = match read_c_str(response) {
        Some(s) => s,
        None => return ptr::null_mut(),
    };
    let mut response = match decode_envelope(json) {
        Some(r) => r,
        None => return ptr::null_mut(),
    };

    let outcome = (*pipeline).process(&mut response);
    match encode_envelope(response, outcome.is_mutated()) {
        Some(out) => to_c_string(out),
        None => ptr::null_mut(),
    }
}

/// Free a pipeline previously returned by `mutator_new`.
#[no_mangle]
pub unsafe extern "C" fn mutator_free(pipeline: *mut Pipeline) {
    if !pipeline.is_null() {
        drop(Box::from_raw(pipeline));
    }
}

/// Free a C string previously returned by `mutator_process`.
#[no_mangle]
pub unsafe extern "C" fn free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        let _ = CString::from_raw(ptr);
    }
}
