//! Server-side model status snapshot
//!
//! A status snapshot is keyed model → version → batch size and carries the
//! server's monotonic counters for successful requests, queue time and
//! compute time. The summary composer differences two snapshots taken
//! around the measurement sleep.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Count plus accumulated duration for one server-side phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatDuration {
    /// Number of requests accumulated into `total_time_ns`
    #[serde(default)]
    pub count: u64,
    /// Accumulated time in nanoseconds
    #[serde(default)]
    pub total_time_ns: u64,
}

/// Per-batch-size inference statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferStats {
    /// Successful request count and total request time
    #[serde(default)]
    pub success: StatDuration,
    /// Time spent waiting for an available model instance
    #[serde(default)]
    pub queue: StatDuration,
    /// Time spent in the model-execution phase
    #[serde(default)]
    pub compute: StatDuration,
}

/// Status of one loaded model version, keyed by batch size
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersionStatus {
    /// Inference statistics per batch size
    #[serde(default)]
    pub infer_stats: HashMap<u32, InferStats>,
}

/// Status of one model, keyed by version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
    /// Per-version status; keys are version numbers
    #[serde(default)]
    pub version_status: HashMap<i64, ModelVersionStatus>,
}

/// Full server status snapshot, keyed by model name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Per-model status
    #[serde(default)]
    pub model_status: HashMap<String, ModelStatus>,
}

impl ModelStatus {
    /// Highest version number present in this snapshot, if any
    #[must_use]
    pub fn latest_version(&self) -> Option<i64> {
        self.version_status.keys().copied().max()
    }
}
