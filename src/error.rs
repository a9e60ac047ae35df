//! Crate-wide error taxonomy.
//!
//! Mirrors the error rows enumerated for each component so that callers can
//! match on a stable, closed set of failure kinds rather than on strings.

use thiserror::Error;

/// The error type returned by every public operation in this crate.
#[derive(Debug, Error)]
pub enum SpmError {
    /// The remote end did not reply within the configured request timeout.
    #[error("request to {0} timed out")]
    TransportTimeout(String),

    /// The underlying socket/IO operation failed.
    #[error("transport IO error: {0}")]
    TransportIo(#[from] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error("frame codec error: {0}")]
    Codec(#[from] Box<bincode::ErrorKind>),

    /// A caller tried to perform a control-gated action without holding control.
    #[error("caller does not hold control")]
    NotInControl,

    /// A control request was issued while another client already holds control.
    #[error("control is already held by another client")]
    AlreadyUnderControl,

    /// An admin-only operation (mode change, experiment end) requires
    /// `ControlMode::Automated` or explicit admin privilege and it was not met.
    #[error("operation not permitted in current control mode")]
    WrongControlMode,

    /// The microscope was not in `ScopeState::Free` when a command required it.
    #[error("microscope is not free (state: {0:?})")]
    NotFree(crate::messages::state::ScopeState),

    /// A requested portable parameter has no mapping on this translator.
    #[error("parameter not supported by this translator: {0}")]
    ParameterNotSupported(String),

    /// A requested portable action has no mapping on this translator.
    #[error("action not supported by this translator: {0}")]
    ActionNotSupported(String),

    /// A parameter get/set failed at the device boundary.
    #[error("parameter error: {0}")]
    ParameterError(String),

    /// An action execution failed at the device boundary.
    #[error("action error: {0}")]
    ActionError(String),

    /// A unit conversion was requested between incompatible dimensions.
    #[error("cannot convert {from} to {to}")]
    ConversionError {
        /// Source unit name.
        from: String,
        /// Target unit name.
        to: String,
    },

    /// The configuration file or environment overrides failed validation.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// A child component process could not be spawned or exited unexpectedly.
    #[error("component process error: {0}")]
    ComponentProcess(String),

    /// Wraps a lower-level configuration-library error.
    #[error("config loading error: {0}")]
    ConfigLoad(#[from] figment::Error),

    /// A CSV log row could not be written or flushed.
    #[error("drift log error: {0}")]
    DriftLog(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SpmError>;
