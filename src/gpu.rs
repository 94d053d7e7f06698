//! Host GPU inventory reported in the connection notice.

use std::{env, io::ErrorKind};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::WorkerError;

/// Environment variable restricting which devices the worker may use.
pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

const NVIDIA_SMI: &str = "nvidia-smi";
const QUERY_ARGS: [&str; 2] = [
    "--query-gpu=index,name,memory.total,uuid",
    "--format=csv,noheader,nounits",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDescriptor {
    pub index: u32,
    pub name: String,
    pub memory_total_mib: u64,
    pub uuid: String,
}

#[async_trait]
pub trait GpuInventory: Send + Sync {
    async fn visible_gpus(&self) -> Result<Vec<GpuDescriptor>, WorkerError>;
}

/// Queries `nvidia-smi` and filters by `CUDA_VISIBLE_DEVICES`.
#[derive(Debug, Clone, Default)]
pub struct NvidiaSmi;

#[async_trait]
impl GpuInventory for NvidiaSmi {
    async fn visible_gpus(&self) -> Result<Vec<GpuDescriptor>, WorkerError> {
        let output = match Command::new(NVIDIA_SMI).args(QUERY_ARGS).output().await {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("nvidia-smi not found, reporting no GPUs");
                return Ok(Vec::new());
            }
            Err(e) => return Err(WorkerError::IoError(e)),
        };

        if !output.status.success() {
            return Err(WorkerError::IoError(std::io::Error::other(format!(
                "nvidia-smi exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }

        let gpus = parse_query_output(&String::from_utf8_lossy(&output.stdout))?;
        let visible = env::var(VISIBLE_DEVICES_ENV).ok();
        Ok(filter_visible(gpus, visible.as_deref()))
    }
}

/// Fixed inventory, for tests and hosts configured out of band.
#[derive(Debug, Clone, Default)]
pub struct StaticGpus(pub Vec<GpuDescriptor>);

#[async_trait]
impl GpuInventory for StaticGpus {
    async fn visible_gpus(&self) -> Result<Vec<GpuDescriptor>, WorkerError> {
        Ok(self.0.clone())
    }
}

fn parse_query_output(raw: &str) -> Result<Vec<GpuDescriptor>, WorkerError> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_query_line)
        .collect()
}

fn parse_query_line(line: &str) -> Result<GpuDescriptor, WorkerError> {
    let invalid = || {
        WorkerError::IoError(std::io::Error::other(format!(
            "unexpected nvidia-smi line: {line}"
        )))
    };

    // The name may itself contain commas, so index/memory/uuid are taken from the ends.
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return Err(invalid());
    }
    let last = fields.len() - 1;

    Ok(GpuDescriptor {
        index: fields[0].parse().map_err(|_| invalid())?,
        name: fields[1..last - 1].join(", "),
        memory_total_mib: fields[last - 1].parse().map_err(|_| invalid())?,
        uuid: fields[last].to_string(),
    })
}

fn filter_visible(gpus: Vec<GpuDescriptor>, visible: Option<&str>) -> Vec<GpuDescriptor> {
    let Some(visible) = visible else {
        return gpus;
    };
    let wanted: Vec<&str> = visible
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect();

    gpus.into_iter()
        .filter(|gpu| {
            wanted
                .iter()
                .any(|token| token.parse::<u32>().ok() == Some(gpu.index) || *token == gpu.uuid)
        })
        .collect()
}
