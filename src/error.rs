//! Error types for Medir
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for Medir operations
pub type Result<T> = std::result::Result<T, MedirError>;

/// Error type for all Medir operations
///
/// Transport errors are carried as strings so the enum stays `Clone`:
/// worker errors are stored in shared cells and surfaced twice (at the
/// measurement boundary and at teardown).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MedirError {
    /// Invalid command line or configuration value
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Reason the argument was rejected
        reason: String,
    },

    /// Requested batch size exceeds what the model supports
    #[error("expecting batch size <= {max_batch_size} for model '{model}', got {batch_size}")]
    BatchTooLarge {
        /// Requested batch size
        batch_size: u32,
        /// Maximum batch size advertised by the model
        max_batch_size: u32,
        /// Model name
        model: String,
    },

    /// Input has a variable-size shape so no fixed buffer can be generated
    #[error(
        "input '{input}' has variable-size shape, unable to create input values for model '{model}'"
    )]
    VariableSizeInput {
        /// Input name
        input: String,
        /// Model name
        model: String,
    },

    /// Failed to create an inference, status or profile context
    #[error("unable to create context: {reason}")]
    ContextCreation {
        /// Underlying failure
        reason: String,
    },

    /// HTTP transport failure
    #[error("HTTP error: {reason}")]
    Http {
        /// Underlying failure
        reason: String,
    },

    /// gRPC transport failure
    #[error("gRPC error: {reason}")]
    Grpc {
        /// Underlying failure
        reason: String,
    },

    /// No completed request fell inside the measurement window
    #[error(
        "no valid requests recorded within time interval, please use a larger time window"
    )]
    NoValidRequests,

    /// A worker reported a terminal error so the requested concurrency
    /// level cannot be sustained
    #[error(
        "failed to maintain concurrency level requested, worker thread(s) failed to generate concurrent requests"
    )]
    FailedToMaintainConcurrency,

    /// An exit signal was received during measurement
    #[error("received exit signal")]
    Interrupted,

    /// The server reported no status for the requested model
    #[error("unable to find status for model '{model}'")]
    MissingModelStatus {
        /// Model name
        model: String,
    },

    /// The server reported no status for the requested model version
    #[error("missing status for version {version} of model '{model}'")]
    MissingVersionStatus {
        /// Model name
        model: String,
        /// Resolved model version
        version: i64,
    },

    /// The server reported no inference stats for the requested batch size
    #[error("missing inference stats for model '{model}' version {version} batch size {batch_size}")]
    MissingInferStats {
        /// Model name
        model: String,
        /// Resolved model version
        version: i64,
        /// Requested batch size
        batch_size: u32,
    },

    /// A monotonic counter decreased between two snapshots, which implies
    /// the server restarted mid-measurement
    #[error("counter '{counter}' went backwards between snapshots")]
    CounterRegression {
        /// Name of the regressing counter
        counter: String,
    },

    /// An async completion arrived for a request id with no recorded start
    #[error("async completion for unknown request id {id}")]
    UnknownAsyncRequest {
        /// Request id returned by the transport
        id: u64,
    },

    /// File I/O failure while writing a report
    #[error("I/O error: {reason}")]
    Io {
        /// Underlying failure
        reason: String,
    },
}
