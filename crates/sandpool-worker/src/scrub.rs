//! Environment scrub.
//!
//! The supervisor spawns workers with a cleared environment; the worker
//! scrubs again on startup so user modules can never observe host
//! environment variables regardless of how the binary was launched.

use std::ffi::OsString;

/// Remove every inherited environment variable.
///
/// Must run before any other thread exists, i.e. before the async runtime
/// is built.
pub fn scrub_environment() {
    let keys: Vec<OsString> = std::env::vars_os().map(|(key, _)| key).collect();
    for key in keys {
        // SAFETY: called from `main` before the runtime (and any other
        // thread) starts, so no concurrent access to the environment exists.
        #[allow(unsafe_code)]
        unsafe {
            std::env::remove_var(&key);
        }
    }
}
