//! Node topology model shared by the status exporter
//!
//! A [`NodeTopology`] is one point-in-time picture of the simulated GPUs on a
//! node: which allocation owns each GPU and how much each pod running on it
//! should appear to use.

use std::collections::HashMap;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Namespace of the reservation pods that own GPUs handed out by the fake
/// device layer. Only GPUs allocated from this namespace are exported.
pub const RESERVATION_NAMESPACE: &str = "runai-reservation";

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Failed to parse node topology: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// GPU inventory of a single node. The GPU index is its position in `gpus`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeTopology {
    /// Frame buffer size of every GPU in MiB
    pub gpu_memory: u64,
    pub gpu_product: String,
    pub mig_strategy: String,
    pub gpus: Vec<GpuDetails>,
}

impl NodeTopology {
    pub fn from_yaml(content: &str) -> Result<Self, TopologyError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn to_yaml(&self) -> Result<String, TopologyError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuDetails {
    pub id: String,
    pub status: GpuStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuStatus {
    pub allocated_by: AllocatedBy,
    /// Usage per pod UID
    pub pod_gpu_usage_status: HashMap<String, GpuUsageStatus>,
}

impl GpuStatus {
    /// Whether this GPU is owned by an allocation in `namespace`.
    pub fn is_allocated_from(&self, namespace: &str) -> bool {
        self.allocated_by.namespace == namespace
    }
}

/// Identity of the allocation holding a GPU
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocatedBy {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuUsageStatus {
    pub utilization: Range,
    /// Used frame buffer in MiB
    pub fb_used: u64,
    pub use_knative_utilization: bool,
}

/// Inclusive range of utilization percentages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Range {
    pub min: u32,
    pub max: u32,
}

impl Range {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// Draws a value uniformly from `[min, max]`. A degenerate or inverted
    /// range yields `min`.
    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        if self.max <= self.min {
            return self.min;
        }
        rng.random_range(self.min..=self.max)
    }
}
