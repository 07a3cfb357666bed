//! HTTP client used by the CLI subcommands to talk to a running daemon.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::Value;

use crate::api::ConfigPatch;
use crate::storage::ExportFormat;

pub const DEFAULT_URL: &str = "http://127.0.0.1:3667";

/// Filter arguments forwarded as query parameters.
#[derive(Debug, Clone, Default)]
pub struct HistoryParams {
    pub provider: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl HistoryParams {
    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(p) = &self.provider {
            pairs.push(("provider", p.clone()));
        }
        if let Some(f) = &self.from {
            pairs.push(("from", f.clone()));
        }
        if let Some(t) = &self.to {
            pairs.push(("to", t.clone()));
        }
        pairs
    }
}

pub struct ApiClient {
    base: String,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }

    pub async fn health(&self) -> Result<Value> {
        data(self.request(Method::GET, "/health")).await
    }

    /// Ask the daemon to start a manual cycle. Errors with the server's
    /// message if a cycle is already running.
    pub async fn trigger(&self) -> Result<Value> {
        data(self.request(Method::POST, "/speedtest/run")).await
    }

    pub async fn history(&self, params: &HistoryParams) -> Result<Value> {
        data(self.request(Method::GET, "/history").query(&params.pairs())).await
    }

    pub async fn export(&self, format: ExportFormat, params: &HistoryParams) -> Result<Vec<u8>> {
        let mut pairs = params.pairs();
        pairs.push(("format", format_name(format).to_string()));
        let resp = send(self.request(Method::GET, "/history/export").query(&pairs)).await?;
        let bytes = resp.bytes().await.context("failed to read export body")?;
        Ok(bytes.to_vec())
    }

    pub async fn clear_history(&self) -> Result<Value> {
        data(self.request(Method::DELETE, "/history")).await
    }

    pub async fn get_config(&self) -> Result<Value> {
        data(self.request(Method::GET, "/config")).await
    }

    pub async fn set_config(&self, patch: &ConfigPatch) -> Result<Value> {
        data(self.request(Method::PUT, "/config").json(patch)).await
    }

    pub async fn status(&self) -> Result<Value> {
        data(self.request(Method::GET, "/scheduler/status")).await
    }
}

fn format_name(format: ExportFormat) -> &'static str {
    match format {
        ExportFormat::Json => "json",
        ExportFormat::Csv => "csv",
        ExportFormat::Columnar => "columnar",
    }
}

async fn send(req: RequestBuilder) -> Result<Response> {
    let resp = req.send().await.context("request to speedchecker daemon failed")?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    Err(anyhow!("{} ({})", error_message(&body), status))
}

/// Unwrap the `data` member of a success envelope.
async fn data(req: RequestBuilder) -> Result<Value> {
    let mut body: Value = send(req)
        .await?
        .json()
        .await
        .context("response was not JSON")?;
    Ok(body.get_mut("data").map(Value::take).unwrap_or(Value::Null))
}

fn error_message(body: &Value) -> String {
    body.pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or("request failed")
        .to_string()
}
