//! Platform-aware clock helpers.
//!
//! Ring deadlines, connect timestamps, and outcome records all use Unix
//! seconds. `std::time::SystemTime` is unavailable on
//! `wasm32-unknown-unknown`, so the browser build reads the JS clock
//! while native builds go through chrono.

/// Current Unix timestamp in seconds.
#[cfg(not(target_arch = "wasm32"))]
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current Unix timestamp in seconds.
#[cfg(target_arch = "wasm32")]
pub fn now_timestamp() -> i64 {
    (js_sys::Date::now() / 1000.0) as i64
}

/// Current Unix timestamp in milliseconds.
#[cfg(not(target_arch = "wasm32"))]
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current Unix timestamp in milliseconds.
#[cfg(target_arch = "wasm32")]
pub fn now_timestamp_millis() -> i64 {
    js_sys::Date::now() as i64
}
