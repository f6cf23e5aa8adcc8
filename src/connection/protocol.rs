//! Event frames exchanged with the orchestrator.
//!
//! Every frame is a JSON text message `{"event": <name>, "data": {...}}`.

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

/// Events the orchestrator sends to a worker.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum InboundEvent {
    #[serde(rename = "executeCommand")]
    ExecuteCommand {
        #[serde(rename = "workerToken", deserialize_with = "de_secret")]
        worker_token: SecretString,
        pentest: String,
        #[serde(rename = "toolId")]
        tool_id: String,
        #[serde(default)]
        infos: serde_json::Value,
    },

    #[serde(rename = "stopCommand")]
    StopCommand { pentest: String, tool_iid: String },

    #[serde(rename = "getProgress")]
    GetProgress { tool_iid: String },

    #[serde(rename = "deleteWorker")]
    DeleteWorker {},

    #[serde(rename = "editToolConfig")]
    EditToolConfig {
        command_name: String,
        remote_bin: String,
        #[serde(default)]
        plugin: String,
    },
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExecuteCommand { .. } => "executeCommand",
            Self::StopCommand { .. } => "stopCommand",
            Self::GetProgress { .. } => "getProgress",
            Self::DeleteWorker {} => "deleteWorker",
            Self::EditToolConfig { .. } => "editToolConfig",
        }
    }
}

/// Events a worker sends to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "register")]
    Register { name: String, binaries: Vec<String> },

    #[serde(rename = "keepalive")]
    Keepalive {
        name: String,
        running_tasks: Vec<String>,
    },

    #[serde(rename = "getProgressResult")]
    ProgressResult { result: String },
}

fn de_secret<'de, D: Deserializer<'de>>(d: D) -> Result<SecretString, D::Error> {
    String::deserialize(d).map(SecretString::from)
}
