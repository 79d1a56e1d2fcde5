//! Error classification shared by every fallible surface in the crate.
//!
//! DESIGN
//! ======
//! Each module owns its own `thiserror` enum. This trait gives callers a
//! grepable code and a retry hint without matching on concrete variants.

/// Grepable error code plus retry hint.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}
