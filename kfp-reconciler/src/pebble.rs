//! Pebble client over the supervisor's unix socket
//!
//! Each request opens a fresh HTTP/1 connection; hooks are short-lived and
//! issue a handful of calls.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::workload::{CheckStatus, Layer, Workload};

const BOUNDARY: &str = "kfp-api-operator-boundary";

/// Response envelope shared by every endpoint
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "status-code", default)]
    status_code: u16,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    change: Option<String>,
}

impl Envelope {
    fn parse(body: &[u8]) -> Result<Self> {
        let envelope: Envelope =
            serde_json::from_slice(body).context("Invalid response from pebble")?;
        if envelope.kind == "error" {
            let message = envelope
                .result
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            bail!("pebble error ({}): {}", envelope.status_code, message);
        }
        Ok(envelope)
    }
}

#[derive(Debug, Deserialize)]
struct CheckInfo {
    name: String,
    status: CheckStatus,
}

#[derive(Debug, Deserialize)]
struct ChangeInfo {
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    err: Option<String>,
}

/// multipart/form-data body for a single file write
fn files_body(path: &str, content: &[u8]) -> Result<Vec<u8>> {
    let request = json!({
        "action": "write",
        "files": [{ "path": path, "make-dirs": true }],
    });
    let mut body = Vec::with_capacity(content.len() + 512);
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Type: application/json\r\n\
             Content-Disposition: form-data; name=\"request\"\r\n\r\n{req}\r\n\
             --{b}\r\nContent-Type: application/octet-stream\r\n\
             Content-Disposition: form-data; name=\"files\"; filename=\"{path}\"\r\n\r\n",
            b = BOUNDARY,
            req = serde_json::to_string(&request)?,
            path = path,
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    Ok(body)
}

fn check_status(result: Value, name: &str) -> Result<Option<CheckStatus>> {
    let checks: Vec<CheckInfo> = serde_json::from_value(result).context("Invalid check list")?;
    Ok(checks
        .into_iter()
        .find(|check| check.name == name)
        .map(|check| check.status))
}

/// [`Workload`] talking to the Pebble API socket
pub struct PebbleClient {
    socket: PathBuf,
}

impl PebbleClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<Envelope> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .with_context(|| format!("Failed to connect to {}", self.socket.display()))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .context("pebble handshake failed")?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "pebble connection closed");
            }
        });

        let req = http::Request::builder()
            .method(method)
            .uri(path)
            .header("host", "localhost")
            .header("content-type", content_type)
            .body(Full::new(Bytes::from(body)))?;
        let response = sender
            .send_request(req)
            .await
            .with_context(|| format!("{} {} failed", method, path))?;
        let body = response.into_body().collect().await?.to_bytes();
        Envelope::parse(&body)
    }

    async fn get(&self, path: &str) -> Result<Envelope> {
        self.request("GET", path, "application/json", Vec::new()).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Envelope> {
        self.request("POST", path, "application/json", serde_json::to_vec(body)?)
            .await
    }

    async fn wait_change(&self, id: &str) -> Result<()> {
        let envelope = self.get(&format!("/v1/changes/{}/wait", id)).await?;
        let change: ChangeInfo = serde_json::from_value(envelope.result)?;
        if let Some(err) = change.err.filter(|e| !e.is_empty()) {
            bail!("change {} failed: {}", id, err);
        }
        if !change.ready {
            bail!("change {} did not complete", id);
        }
        Ok(())
    }
}

#[async_trait]
impl Workload for PebbleClient {
    async fn can_connect(&self) -> bool {
        match self.get("/v1/system-info").await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "cannot connect to workload container");
                false
            }
        }
    }

    async fn push(&self, path: &str, content: &[u8]) -> Result<()> {
        let body = files_body(path, content)?;
        let content_type = format!("multipart/form-data; boundary={}", BOUNDARY);
        let envelope = self.request("POST", "/v1/files", &content_type, body).await?;
        if let Some(err) = envelope
            .result
            .get(0)
            .and_then(|file| file.get("error"))
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
        {
            bail!("Failed to push {}: {}", path, err);
        }
        debug!(path = %path, "pushed file");
        Ok(())
    }

    async fn plan(&self) -> Result<Layer> {
        let envelope = self.get("/v1/plan?format=yaml").await?;
        let raw = envelope.result.as_str().unwrap_or_default();
        if raw.trim().is_empty() {
            return Ok(Layer::default());
        }
        serde_yaml::from_str(raw).context("Invalid plan")
    }

    async fn add_layer(&self, label: &str, layer: &Layer) -> Result<()> {
        let body = json!({
            "action": "add",
            "combine": true,
            "label": label,
            "format": "yaml",
            "layer": serde_yaml::to_string(layer)?,
        });
        self.post_json("/v1/layers", &body).await?;
        Ok(())
    }

    async fn replan(&self) -> Result<()> {
        let body = json!({ "action": "replan", "services": [] });
        let envelope = self.post_json("/v1/services", &body).await?;
        match envelope.change {
            Some(id) => self.wait_change(&id).await,
            None => Ok(()),
        }
    }

    async fn get_check(&self, name: &str) -> Result<Option<CheckStatus>> {
        let envelope = self.get(&format!("/v1/checks?names={}", name)).await?;
        check_status(envelope.result, name)
    }
}
