use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Commands written to the worker's stdin, one JSON object per line.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WireCommand {
    Init,
    Shutdown,
    LoadModel { model: String },
    Generate { input: serde_json::Value, batch_id: u64 },
}

/// Lines read back from the worker's stdout. A single request (init,
/// load_model, generate) may be answered by zero or more `Progress`/`Image`
/// events followed by exactly one terminal variant.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    /// Terminal, answers `Init`.
    Ready {
        #[serde(default)]
        models_by_category: HashMap<String, Vec<String>>,
        #[serde(default)]
        can_load_models: bool,
        #[serde(default = "default_max_usages")]
        max_usages: u32,
    },
    /// Terminal, answers `Init`: configuration is invalid, do not retry.
    Refused { message: String },
    /// Terminal, answers `Init`: transient failure, worth retrying.
    Transient { message: String },
    /// Terminal, answers `LoadModel`.
    ModelLoaded { ok: bool },
    /// Non-terminal, answers `Generate`.
    Progress { step: u32, total: u32 },
    /// Non-terminal, answers `Generate`.
    Image { data_base64: String },
    /// Terminal, answers `Generate`.
    Done,
    /// Terminal, answers `Generate`: ask the scheduler to retry elsewhere.
    Redirect { message: String },
    /// Terminal, may answer any command.
    Error { message: String },
}

fn default_max_usages() -> u32 {
    1
}
