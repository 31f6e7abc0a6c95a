#![forbid(unsafe_code)]
//! Error types for NFTL.
//!
//! Defines `NftlError` and a `Result<T>` alias used throughout the
//! workspace. Transient exhaustion is deliberately not an error: the write
//! path reports it as a deferred outcome and the request stays queued.

use nftl_types::ConfigError;
use thiserror::Error;

/// Error reported by the physical device on completion.
///
/// The code is propagated verbatim to the upstream completion hook; the core
/// never retries on its own.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("device error (code {code})")]
pub struct DeviceError {
    pub code: i32,
}

/// Unified error type for NFTL operations.
#[derive(Debug, Error)]
pub enum NftlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("address out of range: {addr} (limit {limit})")]
    AddrOutOfRange { addr: u64, limit: u64 },
}

/// Result alias using `NftlError`.
pub type Result<T> = std::result::Result<T, NftlError>;

/// Result of a single device I/O, delivered to completion callbacks.
pub type IoResult = std::result::Result<(), DeviceError>;
