//! gRPC transport for the inference service
//!
//! Unary Infer/ModelConfig/Status/Profile calls over a lazily connected
//! channel. The message types and client plumbing are written in the shape
//! `tonic-build` generates, with a blocking boundary at the trait surface:
//! synchronous runs block on a private tokio runtime, async runs are
//! spawned onto it and complete into an mpsc channel keyed by request id.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::Instant;

use tonic::transport::Channel;

use super::{
    ensure_scheme, ContextStat, InferContext, InferInput, ProfileContext, RunOptions,
    StatusContext,
};
use crate::error::{MedirError, Result};
use crate::status;

/// Hand-written message types, wire-compatible with the service's
/// `medir.InferenceService` protobuf definition.
pub mod pb {
    /// Request for model metadata
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ModelConfigRequest {
        /// Model to describe
        #[prost(string, tag = "1")]
        pub model_name: ::prost::alloc::string::String,
        /// Requested version; negative means latest
        #[prost(int64, tag = "2")]
        pub model_version: i64,
    }

    /// One input descriptor in the model metadata
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InputConfig {
        /// Input name
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        /// Fixed byte size of one batch entry; negative means variable
        #[prost(int64, tag = "2")]
        pub byte_size: i64,
    }

    /// Model metadata
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ModelConfigResponse {
        /// Model name
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        /// Maximum supported batch size
        #[prost(uint32, tag = "2")]
        pub max_batch_size: u32,
        /// Input descriptors
        #[prost(message, repeated, tag = "3")]
        pub inputs: ::prost::alloc::vec::Vec<InputConfig>,
        /// Output names
        #[prost(string, repeated, tag = "4")]
        pub outputs: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    }

    /// One inference request
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InferRequest {
        /// Target model
        #[prost(string, tag = "1")]
        pub model_name: ::prost::alloc::string::String,
        /// Target version; negative means latest
        #[prost(int64, tag = "2")]
        pub model_version: i64,
        /// Batch size of this request
        #[prost(uint32, tag = "3")]
        pub batch_size: u32,
        /// Outputs to return
        #[prost(string, repeated, tag = "4")]
        pub outputs: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
        /// Raw input tensors, one entry per batch element per input
        #[prost(bytes = "vec", repeated, tag = "5")]
        pub raw_input: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    }

    /// One inference response
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InferResponse {
        /// Raw output tensors
        #[prost(bytes = "vec", repeated, tag = "1")]
        pub raw_output: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    }

    /// Request for a status snapshot
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StatusRequest {
        /// Model to report on
        #[prost(string, tag = "1")]
        pub model_name: ::prost::alloc::string::String,
    }

    /// Count plus accumulated duration for one server-side phase
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StatDuration {
        /// Number of requests accumulated
        #[prost(uint64, tag = "1")]
        pub count: u64,
        /// Accumulated time in nanoseconds
        #[prost(uint64, tag = "2")]
        pub total_time_ns: u64,
    }

    /// Per-batch-size inference statistics
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InferStats {
        /// Successful request count and total request time
        #[prost(message, optional, tag = "1")]
        pub success: ::core::option::Option<StatDuration>,
        /// Queue-phase accumulation
        #[prost(message, optional, tag = "2")]
        pub queue: ::core::option::Option<StatDuration>,
        /// Compute-phase accumulation
        #[prost(message, optional, tag = "3")]
        pub compute: ::core::option::Option<StatDuration>,
    }

    /// Status of one loaded model version
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ModelVersionStatus {
        /// Inference statistics keyed by batch size
        #[prost(map = "uint32, message", tag = "1")]
        pub infer_stats: ::std::collections::HashMap<u32, InferStats>,
    }

    /// Status of one model
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ModelStatus {
        /// Per-version status keyed by version number
        #[prost(map = "int64, message", tag = "1")]
        pub version_status: ::std::collections::HashMap<i64, ModelVersionStatus>,
    }

    /// Full status snapshot
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StatusResponse {
        /// Per-model status keyed by model name
        #[prost(map = "string, message", tag = "1")]
        pub model_status: ::std::collections::HashMap<::prost::alloc::string::String, ModelStatus>,
    }

    /// Profiling control command
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ProfileRequest {
        /// Either "start" or "stop"
        #[prost(string, tag = "1")]
        pub cmd: ::prost::alloc::string::String,
    }

    /// Empty acknowledgement
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ProfileResponse {}
}

const MODEL_CONFIG_PATH: &str = "/medir.InferenceService/ModelConfig";
const INFER_PATH: &str = "/medir.InferenceService/Infer";
const STATUS_PATH: &str = "/medir.InferenceService/Status";
const PROFILE_PATH: &str = "/medir.InferenceService/Profile";

fn grpc_err(status: &tonic::Status) -> MedirError {
    MedirError::Grpc {
        reason: status.to_string(),
    }
}

fn elapsed_ns(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

fn connect(url: &str) -> Result<Channel> {
    let endpoint = tonic::transport::Endpoint::from_shared(ensure_scheme(url)).map_err(|e| {
        MedirError::ContextCreation {
            reason: e.to_string(),
        }
    })?;
    Ok(endpoint.connect_lazy())
}

fn blocking_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| MedirError::ContextCreation {
            reason: e.to_string(),
        })
}

/// One unary call in the shape `tonic-build` generates
async fn unary<M1, M2>(
    channel: Channel,
    path: &'static str,
    message: M1,
) -> std::result::Result<M2, tonic::Status>
where
    M1: prost::Message + Send + Sync + 'static,
    M2: prost::Message + Default + Send + Sync + 'static,
{
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready().await.map_err(|e| {
        tonic::Status::new(
            tonic::Code::Unknown,
            format!("Service was not ready: {e}"),
        )
    })?;
    let codec: tonic::codec::ProstCodec<M1, M2> = tonic::codec::ProstCodec::default();
    let path = tonic::codegen::http::uri::PathAndQuery::from_static(path);
    let response = grpc.unary(tonic::Request::new(message), path, codec).await?;
    Ok(response.into_inner())
}

/// Timing of one completed round trip
#[derive(Debug, Clone, Copy)]
struct Phases {
    total_ns: u64,
    send_ns: u64,
    receive_ns: u64,
}

/// One finished async request
#[derive(Debug)]
struct AsyncDone {
    id: u64,
    result: Result<Phases>,
}

/// Inference context over gRPC
pub struct GrpcInferContext {
    runtime: tokio::runtime::Runtime,
    channel: Channel,
    model_name: String,
    model_version: i64,
    max_batch_size: u32,
    inputs: Vec<InferInput>,
    outputs: Vec<String>,
    options: Option<RunOptions>,
    stat: ContextStat,
    next_request_id: u64,
    done_tx: Sender<AsyncDone>,
    done_rx: Receiver<AsyncDone>,
    ready: HashMap<u64, AsyncDone>,
}

impl GrpcInferContext {
    /// Open a context for `model_name` at `url`, fetching model metadata
    pub fn create(url: &str, model_name: &str, model_version: i64) -> Result<Self> {
        // Async submissions run as background tasks, so the runtime needs
        // worker threads of its own.
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| MedirError::ContextCreation {
                reason: e.to_string(),
            })?;
        let channel = connect(url)?;

        let request = pb::ModelConfigRequest {
            model_name: model_name.to_string(),
            model_version,
        };
        let config: pb::ModelConfigResponse = runtime
            .block_on(unary(channel.clone(), MODEL_CONFIG_PATH, request))
            .map_err(|e| MedirError::ContextCreation {
                reason: e.to_string(),
            })?;

        let inputs = config
            .inputs
            .iter()
            .map(|input| InferInput::new(&input.name, input.byte_size))
            .collect();
        let (done_tx, done_rx) = mpsc::channel();

        Ok(Self {
            runtime,
            channel,
            model_name: model_name.to_string(),
            model_version,
            max_batch_size: config.max_batch_size,
            inputs,
            outputs: config.outputs,
            options: None,
            stat: ContextStat::default(),
            next_request_id: 0,
            done_tx,
            done_rx,
            ready: HashMap::new(),
        })
    }

    /// Marshal the bound inputs and options into a request message
    fn encode_request(&self, options: &RunOptions) -> pb::InferRequest {
        let mut raw_input = Vec::new();
        for input in &self.inputs {
            for batch in input.batches() {
                raw_input.push(batch.clone());
            }
        }
        pb::InferRequest {
            model_name: self.model_name.clone(),
            model_version: self.model_version,
            batch_size: options.batch_size,
            outputs: options.outputs.clone(),
            raw_input,
        }
    }

    fn options(&self) -> Result<&RunOptions> {
        self.options.as_ref().ok_or_else(|| MedirError::Grpc {
            reason: "run options not set".to_string(),
        })
    }

    fn apply(&mut self, phases: Phases) {
        self.stat.completed_request_count += 1;
        self.stat.cumulative_total_request_time_ns += phases.total_ns;
        self.stat.cumulative_send_time_ns += phases.send_ns;
        self.stat.cumulative_receive_time_ns += phases.receive_ns;
    }
}

impl InferContext for GrpcInferContext {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn max_batch_size(&self) -> u32 {
        self.max_batch_size
    }

    fn inputs(&self) -> &[InferInput] {
        &self.inputs
    }

    fn inputs_mut(&mut self) -> &mut [InferInput] {
        &mut self.inputs
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn set_run_options(&mut self, options: &RunOptions) -> Result<()> {
        self.options = Some(options.clone());
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let start = Instant::now();
        let request = self.encode_request(self.options()?);
        let send_ns = elapsed_ns(start);

        let response: pb::InferResponse = self
            .runtime
            .block_on(unary(self.channel.clone(), INFER_PATH, request))
            .map_err(|e| grpc_err(&e))?;

        let receive_start = Instant::now();
        // Take ownership of the decoded outputs; content is not validated.
        let _raw = response.raw_output;
        let receive_ns = elapsed_ns(receive_start);

        self.apply(Phases {
            total_ns: elapsed_ns(start),
            send_ns,
            receive_ns,
        });
        Ok(())
    }

    fn async_run(&mut self) -> Result<u64> {
        let start = Instant::now();
        let request = self.encode_request(self.options()?);
        let send_ns = elapsed_ns(start);

        let id = self.next_request_id;
        self.next_request_id += 1;

        let channel = self.channel.clone();
        let tx = self.done_tx.clone();
        self.runtime.spawn(async move {
            let result = unary::<pb::InferRequest, pb::InferResponse>(channel, INFER_PATH, request)
                .await
                .map(|response| {
                    let receive_start = Instant::now();
                    let _raw = response.raw_output;
                    Phases {
                        total_ns: elapsed_ns(start),
                        send_ns,
                        receive_ns: elapsed_ns(receive_start),
                    }
                })
                .map_err(|e| grpc_err(&e));
            // The receiver lives as long as the context; a send failure
            // means the context is gone and the result is moot.
            let _ = tx.send(AsyncDone { id, result });
        });
        Ok(id)
    }

    fn get_ready_async_request(&mut self, blocking: bool) -> Result<Option<u64>> {
        let done = if blocking {
            self.done_rx.recv().map_err(|_| MedirError::Grpc {
                reason: "async completion channel closed".to_string(),
            })?
        } else {
            match self.done_rx.try_recv() {
                Ok(done) => done,
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => {
                    return Err(MedirError::Grpc {
                        reason: "async completion channel closed".to_string(),
                    })
                }
            }
        };
        let id = done.id;
        self.ready.insert(id, done);
        Ok(Some(id))
    }

    fn get_async_run_results(&mut self, request_id: u64) -> Result<()> {
        let done = self
            .ready
            .remove(&request_id)
            .ok_or(MedirError::UnknownAsyncRequest { id: request_id })?;
        let phases = done.result?;
        self.apply(phases);
        Ok(())
    }

    fn stat(&self) -> ContextStat {
        self.stat
    }
}

/// Status context over gRPC
pub struct GrpcStatusContext {
    runtime: tokio::runtime::Runtime,
    channel: Channel,
    model_name: String,
}

impl GrpcStatusContext {
    /// Open a status context for `model_name` at `url`
    pub fn create(url: &str, model_name: &str) -> Result<Self> {
        Ok(Self {
            runtime: blocking_runtime()?,
            channel: connect(url)?,
            model_name: model_name.to_string(),
        })
    }
}

impl StatusContext for GrpcStatusContext {
    fn server_status(&mut self) -> Result<status::ServerStatus> {
        let request = pb::StatusRequest {
            model_name: self.model_name.clone(),
        };
        let response: pb::StatusResponse = self
            .runtime
            .block_on(unary(self.channel.clone(), STATUS_PATH, request))
            .map_err(|e| grpc_err(&e))?;
        Ok(convert_status(response))
    }
}

/// Profile context over gRPC
pub struct GrpcProfileContext {
    runtime: tokio::runtime::Runtime,
    channel: Channel,
}

impl GrpcProfileContext {
    /// Open a profile context at `url`
    pub fn create(url: &str) -> Result<Self> {
        Ok(Self {
            runtime: blocking_runtime()?,
            channel: connect(url)?,
        })
    }

    fn command(&mut self, cmd: &str) -> Result<()> {
        let request = pb::ProfileRequest {
            cmd: cmd.to_string(),
        };
        let _response: pb::ProfileResponse = self
            .runtime
            .block_on(unary(self.channel.clone(), PROFILE_PATH, request))
            .map_err(|e| grpc_err(&e))?;
        Ok(())
    }
}

impl ProfileContext for GrpcProfileContext {
    fn start_profile(&mut self) -> Result<()> {
        self.command("start")
    }

    fn stop_profile(&mut self) -> Result<()> {
        self.command("stop")
    }
}

fn convert_duration(duration: Option<pb::StatDuration>) -> status::StatDuration {
    let duration = duration.unwrap_or_default();
    status::StatDuration {
        count: duration.count,
        total_time_ns: duration.total_time_ns,
    }
}

fn convert_status(response: pb::StatusResponse) -> status::ServerStatus {
    let mut server = status::ServerStatus::default();
    for (model_name, model) in response.model_status {
        let mut model_out = status::ModelStatus::default();
        for (version, version_status) in model.version_status {
            let mut version_out = status::ModelVersionStatus::default();
            for (batch_size, stats) in version_status.infer_stats {
                version_out.infer_stats.insert(
                    batch_size,
                    status::InferStats {
                        success: convert_duration(stats.success),
                        queue: convert_duration(stats.queue),
                        compute: convert_duration(stats.compute),
                    },
                );
            }
            model_out.version_status.insert(version, version_out);
        }
        server.model_status.insert(model_name, model_out);
    }
    server
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_status_maps_all_phases() {
        let mut response = pb::StatusResponse::default();
        let mut model = pb::ModelStatus::default();
        let mut version = pb::ModelVersionStatus::default();
        version.infer_stats.insert(
            4,
            pb::InferStats {
                success: Some(pb::StatDuration {
                    count: 7,
                    total_time_ns: 700,
                }),
                queue: Some(pb::StatDuration {
                    count: 7,
                    total_time_ns: 300,
                }),
                compute: None,
            },
        );
        model.version_status.insert(2, version);
        response.model_status.insert("m".to_string(), model);

        let server = convert_status(response);
        let stats = &server.model_status["m"].version_status[&2].infer_stats[&4];
        assert_eq!(stats.success.count, 7);
        assert_eq!(stats.queue.total_time_ns, 300);
        assert_eq!(stats.compute, status::StatDuration::default());
    }

    #[test]
    fn test_infer_request_round_trip() {
        use prost::Message;

        let request = pb::InferRequest {
            model_name: "m".to_string(),
            model_version: -1,
            batch_size: 4,
            outputs: vec!["out".to_string()],
            raw_input: vec![vec![1, 2, 3]],
        };
        let bytes = request.encode_to_vec();
        let back = pb::InferRequest::decode(bytes.as_slice()).expect("decode");
        assert_eq!(back, request);
    }
}
