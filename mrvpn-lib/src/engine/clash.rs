use serde::Deserialize;
use thiserror::Error;

use std::time::Duration;

use crate::singbox::CONTROLLER_ADDR;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum Error {
    #[error("control plane request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Snapshot returned by the engine's `GET /connections` endpoint.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConnectionsSnapshot {
    #[serde(rename = "downloadTotal", default)]
    pub download_total: u64,
    #[serde(rename = "uploadTotal", default)]
    pub upload_total: u64,
    #[serde(default)]
    pub connections: Vec<ConnectionEntry>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConnectionEntry {
    pub id: String,
    #[serde(default)]
    pub upload: u64,
    #[serde(default)]
    pub download: u64,
    #[serde(default)]
    pub chains: Vec<String>,
}

/// Minimal client for the engine's Clash-compatible management API.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
}

impl Client {
    pub fn new() -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Client {
            http,
            endpoint: format!("http://{CONTROLLER_ADDR}/connections"),
        })
    }

    pub async fn connections(&self) -> Result<ConnectionsSnapshot, Error> {
        let snapshot = self
            .http
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?
            .json::<ConnectionsSnapshot>()
            .await?;
        Ok(snapshot)
    }
}
