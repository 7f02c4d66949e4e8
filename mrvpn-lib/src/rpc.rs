use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{State, TrafficStats};

pub mod handler;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

pub const STATE_CHANGED_METHOD: &str = "vpn.stateChanged";
pub const STATS_UPDATE_METHOD: &str = "vpn.statsUpdate";

/// One request line from a pipe client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Reply to a single request; `id` is null when the request never parsed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// Server-initiated message; the UI treats anything without an `id` as one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangedParams {
    pub state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsParams {
    pub upload: u64,
    pub download: u64,
    pub up_speed: u64,
    pub down_speed: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    pub state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<u64>,
}

impl Response {
    pub fn result(id: impl Into<String>, result: Value) -> Self {
        Response {
            id: Some(id.into()),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: i32, message: impl Into<String>) -> Self {
        Response {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn parse_error() -> Self {
        Response::error(None, PARSE_ERROR, "failed to parse request")
    }
}

impl Notification {
    pub fn state_changed(params: StateChangedParams) -> Self {
        Notification {
            method: STATE_CHANGED_METHOD.to_string(),
            params: serde_json::to_value(params).ok(),
        }
    }

    pub fn stats_update(stats: TrafficStats) -> Self {
        Notification {
            method: STATS_UPDATE_METHOD.to_string(),
            params: serde_json::to_value(StatsParams::from(stats)).ok(),
        }
    }
}

impl From<TrafficStats> for StatsParams {
    fn from(stats: TrafficStats) -> Self {
        StatsParams {
            upload: stats.upload,
            download: stats.download,
            up_speed: stats.up_speed,
            down_speed: stats.down_speed,
        }
    }
}

/// Maps an internal failure onto the message a UI user may see. The raw
/// cause stays in the log; only a recognized class leaks through.
pub fn sanitize_error(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if lower.contains("not connected") {
        "backend service is not connected".to_string()
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "request timed out".to_string()
    } else if lower.contains("connection refused") {
        "unable to reach server".to_string()
    } else if lower.contains("parse") {
        "invalid configuration".to_string()
    } else {
        "an internal error occurred".to_string()
    }
}
