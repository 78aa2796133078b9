//! Inference client capability surface
//!
//! The driver core never speaks a wire protocol. It depends on the traits
//! in this module and selects a concrete transport exactly once at
//! start-up; hot paths never branch on the protocol. Two transports are
//! provided: HTTP ([`http`]) and gRPC ([`grpc`]). Tests inject synthetic
//! contexts through [`ClientFactory`].

pub mod grpc;
pub mod http;

use serde::{Deserialize, Serialize};

use crate::error::{MedirError, Result};
use crate::status::ServerStatus;

/// Transport protocol used to reach the inference service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// JSON-over-HTTP endpoints
    Http,
    /// gRPC unary calls
    Grpc,
}

impl Protocol {
    /// Get string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Grpc => "grpc",
        }
    }

    /// Parse from string, case-insensitive
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(Self::Http),
            "grpc" => Some(Self::Grpc),
            _ => None,
        }
    }
}

/// Per-context transport statistics
///
/// Maintained by the transport, read by the driver. All four counters are
/// monotonic non-decreasing over the life of a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContextStat {
    /// Requests completed on this context
    pub completed_request_count: u64,
    /// Total wall time spent in completed requests
    pub cumulative_total_request_time_ns: u64,
    /// Time spent marshalling and sending requests
    pub cumulative_send_time_ns: u64,
    /// Time spent receiving and unmarshalling responses
    pub cumulative_receive_time_ns: u64,
}

/// One model input and the raw batch data bound to it
#[derive(Debug, Clone)]
pub struct InferInput {
    name: String,
    byte_size: i64,
    batches: Vec<Vec<u8>>,
}

impl InferInput {
    /// Create an input descriptor with no data bound
    #[must_use]
    pub fn new(name: &str, byte_size: i64) -> Self {
        Self {
            name: name.to_string(),
            byte_size,
            batches: Vec::new(),
        }
    }

    /// Input name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed byte size of one batch entry; negative means variable-size
    #[must_use]
    pub fn byte_size(&self) -> i64 {
        self.byte_size
    }

    /// Raw data bound so far, one entry per batch element
    #[must_use]
    pub fn batches(&self) -> &[Vec<u8>] {
        &self.batches
    }

    /// Discard all bound data
    pub fn reset(&mut self) {
        self.batches.clear();
    }

    /// Bind raw bytes for one batch element
    ///
    /// The length must match the declared byte size for fixed-size inputs.
    pub fn set_raw(&mut self, bytes: &[u8]) -> Result<()> {
        if self.byte_size >= 0 && bytes.len() as i64 != self.byte_size {
            return Err(MedirError::InvalidArgument {
                reason: format!(
                    "input '{}' expects {} bytes per batch entry, got {}",
                    self.name,
                    self.byte_size,
                    bytes.len()
                ),
            });
        }
        self.batches.push(bytes.to_vec());
        Ok(())
    }
}

/// Options applied to every subsequent run of a context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    /// Batch size of each request
    pub batch_size: u32,
    /// Outputs to request from the server
    pub outputs: Vec<String>,
}

/// One inference connection to the server
///
/// Synchronous use is `run`; pipelined use is `async_run` /
/// `get_ready_async_request` / `get_async_run_results`, where completions
/// are identified by the request id handed out by `async_run`.
pub trait InferContext: Send {
    /// Model this context was created for
    fn model_name(&self) -> &str;

    /// Maximum batch size the model supports
    fn max_batch_size(&self) -> u32;

    /// Declared model inputs
    fn inputs(&self) -> &[InferInput];

    /// Declared model inputs, mutable for binding data
    fn inputs_mut(&mut self) -> &mut [InferInput];

    /// Names of the model outputs
    fn outputs(&self) -> &[String];

    /// Set options applied to every subsequent run
    fn set_run_options(&mut self, options: &RunOptions) -> Result<()>;

    /// Issue one synchronous inference request
    fn run(&mut self) -> Result<()>;

    /// Submit one asynchronous inference request, returning its id
    fn async_run(&mut self) -> Result<u64>;

    /// Take one completed async request if available
    ///
    /// Blocks until a completion arrives when `blocking` is true; returns
    /// `None` when `blocking` is false and no completion is ready.
    fn get_ready_async_request(&mut self, blocking: bool) -> Result<Option<u64>>;

    /// Consume the results of a completed async request
    fn get_async_run_results(&mut self, request_id: u64) -> Result<()>;

    /// Snapshot of this context's transport statistics
    fn stat(&self) -> ContextStat;
}

/// Access to the server's status endpoint
pub trait StatusContext: Send {
    /// Fetch a status snapshot for the model this context was created for
    fn server_status(&mut self) -> Result<ServerStatus>;
}

/// Pass-through control of server-side profiling
pub trait ProfileContext: Send {
    /// Ask the server to start profiling
    fn start_profile(&mut self) -> Result<()>;

    /// Ask the server to stop profiling
    fn stop_profile(&mut self) -> Result<()>;
}

/// Creates the contexts the driver needs
///
/// The driver holds exactly one factory, chosen at start-up. Every worker
/// creates its own [`InferContext`] through it; the manager creates one
/// status context and, when profiling is enabled, one profile context.
pub trait ClientFactory: Send + Sync {
    /// Open a new inference context
    fn infer_context(&self) -> Result<Box<dyn InferContext>>;

    /// Open a new status context
    fn status_context(&self) -> Result<Box<dyn StatusContext>>;

    /// Open a new profile context
    fn profile_context(&self) -> Result<Box<dyn ProfileContext>>;
}

/// Factory selecting a real transport by [`Protocol`]
#[derive(Debug, Clone)]
pub struct ProtocolFactory {
    protocol: Protocol,
    url: String,
    model_name: String,
    model_version: i64,
}

impl ProtocolFactory {
    /// Create a factory for the given transport and target model
    #[must_use]
    pub fn new(protocol: Protocol, url: &str, model_name: &str, model_version: i64) -> Self {
        Self {
            protocol,
            url: url.to_string(),
            model_name: model_name.to_string(),
            model_version,
        }
    }
}

impl ClientFactory for ProtocolFactory {
    fn infer_context(&self) -> Result<Box<dyn InferContext>> {
        match self.protocol {
            Protocol::Http => Ok(Box::new(http::HttpInferContext::create(
                &self.url,
                &self.model_name,
                self.model_version,
            )?)),
            Protocol::Grpc => Ok(Box::new(grpc::GrpcInferContext::create(
                &self.url,
                &self.model_name,
                self.model_version,
            )?)),
        }
    }

    fn status_context(&self) -> Result<Box<dyn StatusContext>> {
        match self.protocol {
            Protocol::Http => Ok(Box::new(http::HttpStatusContext::create(
                &self.url,
                &self.model_name,
            )?)),
            Protocol::Grpc => Ok(Box::new(grpc::GrpcStatusContext::create(
                &self.url,
                &self.model_name,
            )?)),
        }
    }

    fn profile_context(&self) -> Result<Box<dyn ProfileContext>> {
        match self.protocol {
            Protocol::Http => Ok(Box::new(http::HttpProfileContext::create(&self.url)?)),
            Protocol::Grpc => Ok(Box::new(grpc::GrpcProfileContext::create(&self.url)?)),
        }
    }
}

/// Prefix `base` with an http scheme when none is present
#[must_use]
pub(crate) fn ensure_scheme(base: &str) -> String {
    if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("http://{base}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse_case_insensitive() {
        assert_eq!(Protocol::parse("HTTP"), Some(Protocol::Http));
        assert_eq!(Protocol::parse("gRPC"), Some(Protocol::Grpc));
        assert_eq!(Protocol::parse("grpc"), Some(Protocol::Grpc));
        assert_eq!(Protocol::parse("quic"), None);
    }

    #[test]
    fn test_protocol_as_str() {
        assert_eq!(Protocol::Http.as_str(), "http");
        assert_eq!(Protocol::Grpc.as_str(), "grpc");
    }

    #[test]
    fn test_input_set_raw_validates_length() {
        let mut input = InferInput::new("tensor_a", 4);
        assert!(input.set_raw(&[1, 2, 3, 4]).is_ok());
        assert!(input.set_raw(&[1, 2]).is_err());
        assert_eq!(input.batches().len(), 1);
    }

    #[test]
    fn test_input_reset_clears_batches() {
        let mut input = InferInput::new("tensor_a", 2);
        input.set_raw(&[1, 2]).expect("set raw");
        input.reset();
        assert!(input.batches().is_empty());
    }

    #[test]
    fn test_ensure_scheme() {
        assert_eq!(ensure_scheme("localhost:8000"), "http://localhost:8000");
        assert_eq!(ensure_scheme("http://host:1"), "http://host:1");
        assert_eq!(ensure_scheme("https://host:1"), "https://host:1");
    }
}
