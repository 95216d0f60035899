//! Custom error types for the application.
//!
//! This module defines the primary error type, `FlowError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of errors that can occur while driving a plate run, from configuration
//! problems to instrument failures.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches
//!   in the configuration files.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine but is
//!   logically wrong (e.g. a gain ladder that does not cover every probe channel).
//!   These are caught by `Config::validate` before any hardware command is issued.
//! - **`Io`** / **`Csv`** / **`Image`**: File, table and image decoding problems.
//! - **`Instrument`**: Failures reported by the command transport to the microscope.
//! - **`Fit`**: A curve fit failed. The estimator maps these to undetermined results, so
//!   they only surface from the low-level fitting API.
//!
//! By using `#[from]`, `FlowError` can be created from underlying error types with `?`.

use thiserror::Error;

use crate::gain::fit::FitError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, FlowError>;

/// Errors raised while configuring or running a plate workflow.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read/write error.
    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Probe image could not be decoded.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// The instrument rejected a command or the transport failed.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// A power-law fit failed.
    #[error("Fit error: {0}")]
    Fit(#[from] FitError),

    /// A channel name that is not part of the configured channel list.
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// A blocking task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Event payload could not be parsed.
    #[error("Event decode error: {0}")]
    EventDecode(#[from] serde_json::Error),

    /// A compile-time feature needed for this operation is disabled.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}
