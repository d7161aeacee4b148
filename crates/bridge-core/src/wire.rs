//! Wire types — JSON request/response shapes for the HTTP Surface (§6.1).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedSource {
    Extension,
    Local,
}

/// Shared response shape for `/toggle-mic`, `/toggle-mic/fast`, and
/// `/bridge/mic-state`.
#[derive(Debug, Clone, Serialize)]
pub struct ToggleResponse {
    pub status: Status,
    pub muted: bool,
    pub confirmed: bool,
    pub source: ReportedSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub muted: bool,
    #[serde(rename = "outputVolume")]
    pub output_volume: f32,
    #[serde(rename = "outputMuted")]
    pub output_muted: bool,
    #[serde(rename = "muteMode")]
    pub mute_mode: String,
    #[serde(rename = "currentInputDevice")]
    pub current_input_device: String,
    #[serde(rename = "realMic")]
    pub real_mic: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MicStateReport {
    pub muted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollResponse {
    pub event: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeResponse {
    pub status: Status,
    pub volume: f32,
    pub muted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartResponse {
    pub status: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogsResponse {
    pub entries: Vec<LogEntryWire>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntryWire {
    pub timestamp: String,
    pub level: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
