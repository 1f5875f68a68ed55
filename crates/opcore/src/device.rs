//! Device, stream and placement descriptors consumed from the execution engine.
//!
//! The runtime never allocates device memory or launches work itself. These types only carry
//! the metadata a kernel may query through its context.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::error::OpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Cuda,
}

impl DeviceType {
    /// Tag used in operator configurations (`"cpu"`, `"cuda"`).
    pub fn tag(self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Cuda => "cuda",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for DeviceType {
    type Err = OpError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "cuda" | "gpu" => Ok(DeviceType::Cuda),
            other => Err(OpError::invalid_argument(format!(
                "unknown device tag '{other}'"
            ))),
        }
    }
}

/// Opaque handle to the stream a kernel enqueues work on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    pub device: DeviceType,
    pub device_id: u32,
    pub stream_id: u64,
}

impl StreamHandle {
    pub fn host() -> Self {
        StreamHandle {
            device: DeviceType::Cpu,
            device_id: 0,
            stream_id: 0,
        }
    }
}

/// Position of the current rank within its parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelContext {
    pub parallel_id: usize,
    pub parallel_num: usize,
}

impl Default for ParallelContext {
    fn default() -> Self {
        ParallelContext {
            parallel_id: 0,
            parallel_num: 1,
        }
    }
}

/// Devices an operator is placed on and their hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelDesc {
    pub device_type: DeviceType,
    pub device_ids: Vec<u32>,
    pub hierarchy: Vec<usize>,
}

impl ParallelDesc {
    pub fn single(device_type: DeviceType) -> Self {
        ParallelDesc {
            device_type,
            device_ids: vec![0],
            hierarchy: vec![1],
        }
    }

    pub fn parallel_num(&self) -> usize {
        self.device_ids.len()
    }
}

/// How a logical tensor is distributed along one hierarchy axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SbpParallel {
    Split(usize),
    Broadcast,
    PartialSum,
}

/// Distribution of a tensor over every axis of a (possibly multi-dimensional) hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NdSbp(pub SmallVec<[SbpParallel; 2]>);

impl NdSbp {
    pub fn broadcast() -> Self {
        NdSbp(smallvec![SbpParallel::Broadcast])
    }

    /// The distribution along the outermost axis.
    pub fn first(&self) -> SbpParallel {
        self.0.first().copied().unwrap_or(SbpParallel::Broadcast)
    }
}

/// Placement of one operator instance: where it runs and which rank this is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub parallel_ctx: ParallelContext,
    pub parallel_desc: ParallelDesc,
    pub stream: StreamHandle,
}

impl Placement {
    pub fn single(device_type: DeviceType) -> Self {
        Placement {
            parallel_ctx: ParallelContext::default(),
            parallel_desc: ParallelDesc::single(device_type),
            stream: StreamHandle {
                device: device_type,
                device_id: 0,
                stream_id: 0,
            },
        }
    }

    pub fn device_type(&self) -> DeviceType {
        self.parallel_desc.device_type
    }
}

impl Default for Placement {
    fn default() -> Self {
        Placement::single(DeviceType::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_tags_round_trip() {
        for device in [DeviceType::Cpu, DeviceType::Cuda] {
            assert_eq!(device.tag().parse::<DeviceType>().unwrap(), device);
        }
        assert_eq!("GPU".parse::<DeviceType>().unwrap(), DeviceType::Cuda);
        assert!("tpu".parse::<DeviceType>().is_err());
    }
}
