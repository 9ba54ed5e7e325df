//! Custom error types for the crate.
//!
//! This module defines the primary error type, `GuardError`, used throughout
//! the watchdog subsystem. Using the `thiserror` crate, it provides a
//! centralized and consistent way to handle the different failure classes the
//! design distinguishes:
//!
//! - **Fatal scan-start failures** (`Precondition`, `UnknownScannable`,
//!   `NotListenable`, `Expression` during parsing): these propagate out of a
//!   watchdog's start hook and must prevent the scan from starting.
//! - **Configuration failures** (`Config`, `Configuration`,
//!   `DuplicateWatchdog`): fatal at load or registration time.
//! - **Operational failures** (`Device`, `Positioner`, `Expression` during
//!   steady-state evaluation): callers in the monitoring path log these and
//!   carry on, so one misbehaving watchdog cannot abort a healthy scan.
//!
//! By using `#[from]`, `GuardError` can be seamlessly created from underlying
//! error types, simplifying error handling with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type GuardResult<T> = std::result::Result<T, GuardError>;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Watchdog '{0}' is already registered")]
    DuplicateWatchdog(String),

    #[error("Watchdog '{name}' could not be instantiated: {reason}")]
    Instantiation { name: String, reason: String },

    #[error("Scannable '{0}' is not registered")]
    UnknownScannable(String),

    #[error("Scannable '{0}' does not publish position events")]
    NotListenable(String),

    #[error("Scan precondition failed: {0}")]
    Precondition(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Scannable error: {0}")]
    Scannable(String),

    #[error("Positioner error: {0}")]
    Positioner(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for GuardError {
    fn from(err: figment::Error) -> Self {
        GuardError::Config(Box::new(err))
    }
}
