//! HTTP transport for the inference service
//!
//! Real network requests with per-phase timing. Inference is a POST with a
//! JSON metadata header and a raw concatenated-bytes body; model metadata
//! and status are JSON GETs. Request timing is decomposed into marshal
//! (send), response wait, and unmarshal (receive) phases, accumulated into
//! the context's [`ContextStat`].
//!
//! The async variant issues each request on its own thread; completions
//! arrive on an mpsc channel keyed by request id.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{
    ensure_scheme, ContextStat, InferContext, InferInput, ProfileContext, RunOptions,
    StatusContext,
};
use crate::error::{MedirError, Result};
use crate::status::ServerStatus;

/// Header carrying the JSON-encoded run options of an inference POST
pub const INFER_META_HEADER: &str = "x-infer-request";

/// Model metadata as served by the HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelConfig {
    name: String,
    max_batch_size: u32,
    inputs: Vec<InputConfig>,
    outputs: Vec<String>,
}

/// One input descriptor in the model metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InputConfig {
    name: String,
    byte_size: i64,
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

fn http_err(err: &reqwest::Error) -> MedirError {
    MedirError::Http {
        reason: err.to_string(),
    }
}

fn creation_err(err: &reqwest::Error) -> MedirError {
    MedirError::ContextCreation {
        reason: err.to_string(),
    }
}

fn elapsed_ns(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

fn build_client() -> Result<reqwest::blocking::Client> {
    // Request timeouts belong to the server under test, not the driver.
    reqwest::blocking::Client::builder()
        .timeout(Option::<Duration>::None)
        .build()
        .map_err(|e| creation_err(&e))
}

/// Concatenate every bound batch of every input into one request body
fn encode_body(inputs: &[InferInput]) -> Vec<u8> {
    let total: usize = inputs
        .iter()
        .map(|input| input.batches().iter().map(Vec::len).sum::<usize>())
        .sum();
    let mut body = Vec::with_capacity(total);
    for input in inputs {
        for batch in input.batches() {
            body.extend_from_slice(batch);
        }
    }
    body
}

/// One inference round trip with per-phase timing
fn infer_roundtrip(
    client: &reqwest::blocking::Client,
    url: &str,
    meta: &str,
    inputs: &[InferInput],
) -> Result<Phases> {
    let start = Instant::now();
    let body = encode_body(inputs);
    let send_ns = elapsed_ns(start);

    let response = client
        .post(url)
        .header(INFER_META_HEADER, meta)
        .body(body)
        .send()
        .map_err(|e| http_err(&e))?
        .error_for_status()
        .map_err(|e| http_err(&e))?;

    let receive_start = Instant::now();
    // Drain the output tensors; their content is not validated.
    let _payload = response.bytes().map_err(|e| http_err(&e))?;
    let receive_ns = elapsed_ns(receive_start);

    Ok(Phases {
        total_ns: elapsed_ns(start),
        send_ns,
        receive_ns,
    })
}

/// Inference context over HTTP
pub struct HttpInferContext {
    client: reqwest::blocking::Client,
    base: String,
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

impl HttpInferContext {
    /// Open a context for `model_name` at `url`, fetching model metadata
    pub fn create(url: &str, model_name: &str, model_version: i64) -> Result<Self> {
        let base = ensure_scheme(url);
        let client = build_client()?;

        let mut request = client.get(format!("{base}/api/models/{model_name}"));
        if model_version >= 0 {
            request = request.query(&[("version", model_version.to_string())]);
        }
        let config: ModelConfig = request
            .send()
            .map_err(|e| creation_err(&e))?
            .error_for_status()
            .map_err(|e| creation_err(&e))?
            .json()
            .map_err(|e| creation_err(&e))?;

        let inputs = config
            .inputs
            .iter()
            .map(|input| InferInput::new(&input.name, input.byte_size))
            .collect();
        let (done_tx, done_rx) = channel();

        Ok(Self {
            client,
            base,
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

    fn infer_url(&self) -> String {
        if self.model_version >= 0 {
            format!(
                "{}/api/infer/{}?version={}",
                self.base, self.model_name, self.model_version
            )
        } else {
            format!("{}/api/infer/{}", self.base, self.model_name)
        }
    }

    fn meta_json(&self) -> Result<String> {
        let options = self.options.as_ref().ok_or_else(|| MedirError::Http {
            reason: "run options not set".to_string(),
        })?;
        serde_json::to_string(options).map_err(|e| MedirError::Http {
            reason: e.to_string(),
        })
    }

    fn apply(&mut self, phases: Phases) {
        self.stat.completed_request_count += 1;
        self.stat.cumulative_total_request_time_ns += phases.total_ns;
        self.stat.cumulative_send_time_ns += phases.send_ns;
        self.stat.cumulative_receive_time_ns += phases.receive_ns;
    }
}

impl InferContext for HttpInferContext {
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
        let meta = self.meta_json()?;
        let url = self.infer_url();
        let phases = infer_roundtrip(&self.client, &url, &meta, &self.inputs)?;
        self.apply(phases);
        Ok(())
    }

    fn async_run(&mut self) -> Result<u64> {
        let meta = self.meta_json()?;
        let url = self.infer_url();
        let id = self.next_request_id;
        self.next_request_id += 1;

        let client = self.client.clone();
        let inputs = self.inputs.clone();
        let tx = self.done_tx.clone();
        thread::Builder::new()
            .name(format!("medir-http-{id}"))
            .spawn(move || {
                let result = infer_roundtrip(&client, &url, &meta, &inputs);
                // The receiver lives as long as the context; a send failure
                // means the context is gone and the result is moot.
                let _ = tx.send(AsyncDone { id, result });
            })
            .map_err(|e| MedirError::Http {
                reason: e.to_string(),
            })?;
        Ok(id)
    }

    fn get_ready_async_request(&mut self, blocking: bool) -> Result<Option<u64>> {
        let done = if blocking {
            self.done_rx.recv().map_err(|_| MedirError::Http {
                reason: "async completion channel closed".to_string(),
            })?
        } else {
            match self.done_rx.try_recv() {
                Ok(done) => done,
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => {
                    return Err(MedirError::Http {
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

/// Status context over HTTP
pub struct HttpStatusContext {
    client: reqwest::blocking::Client,
    base: String,
    model_name: String,
}

impl HttpStatusContext {
    /// Open a status context for `model_name` at `url`
    pub fn create(url: &str, model_name: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base: ensure_scheme(url),
            model_name: model_name.to_string(),
        })
    }
}

impl StatusContext for HttpStatusContext {
    fn server_status(&mut self) -> Result<ServerStatus> {
        self.client
            .get(format!("{}/api/status/{}", self.base, self.model_name))
            .send()
            .map_err(|e| http_err(&e))?
            .error_for_status()
            .map_err(|e| http_err(&e))?
            .json()
            .map_err(|e| http_err(&e))
    }
}

/// Profile context over HTTP
pub struct HttpProfileContext {
    client: reqwest::blocking::Client,
    base: String,
}

impl HttpProfileContext {
    /// Open a profile context at `url`
    pub fn create(url: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base: ensure_scheme(url),
        })
    }

    fn command(&self, cmd: &str) -> Result<()> {
        self.client
            .post(format!("{}/api/profile", self.base))
            .body(cmd.to_string())
            .send()
            .map_err(|e| http_err(&e))?
            .error_for_status()
            .map_err(|e| http_err(&e))?;
        Ok(())
    }
}

impl ProfileContext for HttpProfileContext {
    fn start_profile(&mut self) -> Result<()> {
        self.command("start")
    }

    fn stop_profile(&mut self) -> Result<()> {
        self.command("stop")
    }
}
