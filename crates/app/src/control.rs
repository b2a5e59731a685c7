//! Remote controller polled by the sync loop.
//!
//! Each round the latest snapshot is posted to the controller, which answers
//! with the commands it wants applied (e.g. a chat bot toggling counting).

use anyhow::{Context, Result, bail};
use dockcount::{
    crossing::ControlCommand,
    sync::{ControlSource, Snapshot},
};
use reqwest::blocking::Client;
use serde::Deserialize;

pub struct HttpControlSource {
    client: Client,
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct ControlResponse {
    #[serde(default)]
    commands: Vec<ControlCommand>,
}

impl HttpControlSource {
    pub fn new(client: Client, url: String) -> Self {
        Self { client, url }
    }
}

impl ControlSource for HttpControlSource {
    fn name(&self) -> &str {
        &self.url
    }

    fn poll(&mut self, snapshot: &Snapshot) -> Result<Vec<ControlCommand>> {
        let response = self
            .client
            .post(&self.url)
            .json(snapshot)
            .send()
            .with_context(|| format!("controller {} unreachable", self.url))?;
        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            bail!("controller returned HTTP {status}");
        }
        let body = response.text().context("failed to read controller response")?;
        parse_commands(&body)
    }
}

pub(crate) fn parse_commands(body: &str) -> Result<Vec<ControlCommand>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let response: ControlResponse =
        serde_json::from_str(body).context("malformed controller response")?;
    Ok(response.commands)
}
