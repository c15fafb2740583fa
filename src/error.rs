//! Flat error taxonomy shared by every core subsystem.
//!
//! Mirrors the taxonomy the hypervisor core has always used internally
//! (`OK`, `FAIL`, ...) but expressed as a proper enum instead of an
//! integer/string so callers can match on failure kind instead of
//! comparing against `&'static str` literals.

/// Result alias used throughout the core.
pub type HvResult<T> = Result<T, HvError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HvError {
    #[error("generic failure")]
    Fail,
    #[error("invalid argument")]
    Invalid,
    #[error("not available")]
    NotAvailable,
    #[error("out of memory")]
    OutOfMemory,
    #[error("out of resources")]
    OutOfResources,
    #[error("no such device")]
    NoDevice,
    #[error("access denied")]
    Access,
    #[error("busy")]
    Busy,
    #[error("timed out")]
    TimedOut,
    #[error("i/o error")]
    Io,
    #[error("overflow")]
    Overflow,
}
