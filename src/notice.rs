use std::fmt;

use serde::{Deserialize, Serialize};

use crate::gpu::GpuDescriptor;

/// Prefix of the `service` field announced on the status subject.
pub const SERVICE_PREFIX: &str = "inference:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => f.write_str("connected"),
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Presence announcement published on connect and on shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionNotice {
    pub service: String,
    pub gpus: Vec<GpuDescriptor>,
    pub client_id: String,
    pub status: ConnectionStatus,
}

impl ConnectionNotice {
    pub fn new(model_name: &str, gpus: Vec<GpuDescriptor>, client_id: impl Into<String>) -> Self {
        Self {
            service: format!("{SERVICE_PREFIX}{model_name}"),
            gpus,
            client_id: client_id.into(),
            status: ConnectionStatus::Connected,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
