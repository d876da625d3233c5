//! A stock [`SystemApi`] table for embedders that do not wire their own
//! host services: logging to stderr, monotonic time from process start,
//! an in-memory key/value store, and stubbed sensor reads. Real firmware
//! builds its own table over the hardware abstraction; the shapes here
//! double as a reference for what each slot must do.

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use airlift_abi::{SystemApi, ABI_VERSION, LOG_DEBUG, LOG_ERROR, LOG_INFO, LOG_WARN};

static START: OnceLock<Instant> = OnceLock::new();
static STORE: OnceLock<Mutex<HashMap<String, i32>>> = OnceLock::new();

static API: SystemApi = SystemApi {
    abi_version: ABI_VERSION,
    log: host_log,
    monotonic_ms: host_monotonic_ms,
    read_sensor: host_read_sensor,
    store_value: host_store_value,
    recall_value: host_recall_value,
    query_module: host_query_module,
};

/// The default table. The monotonic clock starts at the first call.
pub fn system_api() -> &'static SystemApi {
    START.get_or_init(Instant::now);
    &API
}

fn cstr_lossy(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return "<null>".to_string();
    }
    // SAFETY: modules pass NUL-terminated strings per the ABI contract;
    // a null pointer was handled above.
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

extern "C" fn host_log(level: u32, message: *const c_char) {
    let tag = match level {
        LOG_ERROR => "error",
        LOG_WARN => "warn",
        LOG_INFO => "info",
        LOG_DEBUG => "debug",
        _ => "trace",
    };
    eprintln!("[module/{tag}] {}", cstr_lossy(message));
}

extern "C" fn host_monotonic_ms() -> u64 {
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}

extern "C" fn host_read_sensor(_channel: u32) -> i32 {
    // No hardware behind the stock table.
    0
}

extern "C" fn host_store_value(key: *const c_char, value: i32) -> bool {
    if key.is_null() {
        return false;
    }
    let key = cstr_lossy(key);
    let store = STORE.get_or_init(|| Mutex::new(HashMap::new()));
    match store.lock() {
        Ok(mut map) => {
            map.insert(key, value);
            true
        }
        Err(_) => false,
    }
}

extern "C" fn host_recall_value(key: *const c_char, out: *mut i32) -> bool {
    if key.is_null() || out.is_null() {
        return false;
    }
    let key = cstr_lossy(key);
    let store = STORE.get_or_init(|| Mutex::new(HashMap::new()));
    let Ok(map) = store.lock() else {
        return false;
    };
    match map.get(&key) {
        Some(value) => {
            // SAFETY: out was null-checked; the caller owns the
            // pointed-to i32 per the ABI contract.
            unsafe { *out = *value };
            true
        }
        None => false,
    }
}

extern "C" fn host_query_module(_name: *const c_char, _slot: u32, _arg: i32) -> i32 {
    // Inter-module queries need the embedder's registry; the stock
    // table reports absence.
    i32::MIN
}
