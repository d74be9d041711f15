//! llama-server backed model collaborators.
//!
//! Each loaded model runs in its own llama-server subprocess: loading spawns
//! one and waits for it to come up, releasing terminates it. The resident
//! embedding model is a second server started once at bootstrap with
//! `--embedding`. All callers go through the accelerator gate, so at most
//! one server is doing accelerator work at any instant.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use unified_ai_common::ChatMessage;

use super::{LoadedModel, ModelBackend, SamplingParams, TextEncoder, TokenStream};
use crate::config::{EmbeddingConfig, LlamaConfig};
use crate::error::{Error, Result};

const HEALTH_CHECK_INTERVAL_MS: u64 = 200;
const DELTA_CHANNEL_CAPACITY: usize = 32;

/// Resolve a model identity to a .gguf file.
///
/// Accepts a path that already names a file, a file name under `model_dir`,
/// or a bare identity that gets the `.gguf` extension appended.
pub fn resolve_model_path(model_dir: &str, identity: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(identity);
    if direct.is_file() {
        return Ok(direct);
    }

    let in_dir = Path::new(model_dir).join(identity);
    if in_dir.is_file() {
        return Ok(in_dir);
    }

    let with_ext = Path::new(model_dir).join(format!("{identity}.gguf"));
    if with_ext.is_file() {
        return Ok(with_ext);
    }

    Err(Error::Communication(format!(
        "no model file for '{}' under {}",
        identity, model_dir
    )))
}

/// A running llama-server child process bound to one model file.
pub struct LlamaServer {
    base_url: String,
    process: Child,
    shutdown_timeout_secs: u64,
}

impl LlamaServer {
    /// Spawn a server for `model_path` and wait until it answers health
    /// checks. `extra_flags` come last, after the configured extra args.
    pub async fn start(
        config: &LlamaConfig,
        http_client: &Client,
        model_path: &Path,
        extra_flags: &[&str],
    ) -> Result<Self> {
        let port = allocate_port().await?;

        let mut cmd = Command::new(&config.server_binary);
        for arg in &config.server_args {
            cmd.arg(arg);
        }
        cmd.arg("-m")
            .arg(model_path)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string());

        if let Some(gpu_layers) = config.gpu_layers {
            cmd.arg("-ngl").arg(gpu_layers.to_string());
        }
        if let Some(ctx_size) = config.context_size {
            cmd.arg("-c").arg(ctx_size.to_string());
        }
        for arg in &config.extra_args {
            cmd.arg(arg);
        }
        for flag in extra_flags {
            cmd.arg(flag);
        }

        cmd.stdin(Stdio::null()).kill_on_drop(true);
        if config.log_server_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let process = cmd.spawn().map_err(|e| {
            Error::Communication(format!(
                "failed to spawn llama-server for {}: {}. Binary: {}",
                model_path.display(),
                e,
                config.server_binary
            ))
        })?;

        tracing::info!(
            model = %model_path.display(),
            port,
            pid = ?process.id(),
            "spawned llama-server"
        );

        let mut server = Self {
            base_url: format!("http://127.0.0.1:{port}"),
            process,
            shutdown_timeout_secs: config.shutdown_timeout_secs,
        };

        if let Err(e) = server
            .wait_for_ready(http_client, config.startup_timeout_secs)
            .await
        {
            server.terminate().await;
            return Err(e);
        }

        Ok(server)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn wait_for_ready(&mut self, http_client: &Client, timeout_secs: u64) -> Result<()> {
        let timeout = Duration::from_secs(timeout_secs);
        let start = Instant::now();
        let health_url = format!("{}/health", self.base_url);

        loop {
            if start.elapsed() > timeout {
                return Err(Error::Communication(format!(
                    "llama-server startup timeout after {:?}",
                    start.elapsed()
                )));
            }

            if !self.is_process_alive() {
                return Err(Error::Communication(
                    "llama-server process died during startup".to_string(),
                ));
            }

            if let Ok(resp) = http_client.get(&health_url).send().await {
                if resp.status().is_success() {
                    tracing::info!(url = %self.base_url, "llama-server ready ({:?})", start.elapsed());
                    return Ok(());
                }
            }

            tokio::time::sleep(Duration::from_millis(HEALTH_CHECK_INTERVAL_MS)).await;
        }
    }

    fn is_process_alive(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    /// Stop the server: SIGTERM first on Unix, SIGKILL after the configured
    /// grace period.
    pub async fn terminate(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.process.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        let wait_result = tokio::time::timeout(
            Duration::from_secs(self.shutdown_timeout_secs),
            self.process.wait(),
        )
        .await;

        match wait_result {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "llama-server exited");
            }
            Ok(Err(e)) => {
                tracing::warn!("error waiting for llama-server: {}", e);
            }
            Err(_timeout) => {
                tracing::warn!("llama-server didn't stop gracefully, killing");
                let _ = self.process.kill().await;
            }
        }
    }
}

// ============================================================================
// llama-server API types
// ============================================================================

#[derive(Debug, Serialize)]
struct ApplyTemplateRequest<'a> {
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ApplyTemplateResponse {
    prompt: String,
}

/// Request body for the /completion endpoint.
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    stream: bool,
    n_predict: u32,
    temperature: f32,
    top_p: f32,
}

/// One SSE event from a streamed /completion response.
#[derive(Debug, Deserialize)]
struct CompletionEvent {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
}

#[derive(Debug, Serialize)]
struct EmbeddingsApiRequest<'a> {
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingsApiResponse {
    data: Vec<EmbeddingsApiRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsApiRow {
    embedding: Vec<f32>,
    index: usize,
}

// ============================================================================
// HTTP client against one llama-server
// ============================================================================

/// Thin request/response layer over a llama-server base URL, separate from
/// process ownership so it can be exercised against a fake server in tests.
#[derive(Clone)]
pub(crate) struct LlamaClient {
    http_client: Client,
    base_url: String,
}

impl LlamaClient {
    pub(crate) fn new(http_client: Client, base_url: &str) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Render messages through the server-side chat template, if the model
    /// has one. Any failure degrades to `None` and the caller falls back to
    /// plain role-prefixed rendering.
    pub(crate) async fn apply_chat_template(&self, messages: &[ChatMessage]) -> Option<String> {
        let url = format!("{}/apply-template", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&ApplyTemplateRequest { messages })
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "apply-template unavailable");
            return None;
        }

        let parsed: ApplyTemplateResponse = response.json().await.ok()?;
        Some(parsed.prompt)
    }

    /// Open a streamed /completion request and decode its SSE events into
    /// text deltas on a bounded channel. The decoder task stops as soon as
    /// the consumer goes away or the server signals `stop`.
    pub(crate) async fn completion_stream(
        &self,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<TokenStream> {
        let url = format!("{}/completion", self.base_url);
        let body = CompletionRequest {
            prompt,
            stream: true,
            n_predict: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
        };

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Communication(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Communication(format!("{}: {}", status, body)));
        }

        let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut decoder = LineDecoder::new();

            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(Error::Communication(e.to_string()))).await;
                        break;
                    }
                };

                for line in decoder.push(&chunk) {
                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let event: CompletionEvent = match serde_json::from_str(payload) {
                        Ok(event) => event,
                        Err(e) => {
                            let _ = tx.send(Err(Error::Communication(e.to_string()))).await;
                            break 'outer;
                        }
                    };
                    if !event.content.is_empty()
                        && tx.send(Ok(event.content)).await.is_err()
                    {
                        break 'outer;
                    }
                    if event.stop {
                        break 'outer;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    pub(crate) async fn embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&EmbeddingsApiRequest { input: texts })
            .send()
            .await
            .map_err(|e| Error::Communication(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Communication(format!("{}: {}", status, body)));
        }

        let parsed: EmbeddingsApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Communication(e.to_string()))?;

        if parsed.data.len() != texts.len() {
            return Err(Error::Communication(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        let mut rows = parsed.data;
        rows.sort_by_key(|row| row.index);
        Ok(rows.into_iter().map(|row| row.embedding).collect())
    }
}

/// Splits a byte stream into complete lines across chunk boundaries.
struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed a chunk; returns every line completed by it, without trailing
    /// newline or carriage return. Incomplete tail bytes stay buffered.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

// ============================================================================
// Collaborator implementations
// ============================================================================

/// Loads generation models by spawning a llama-server per identity.
pub struct LlamaBackend {
    config: LlamaConfig,
    http_client: Client,
}

impl LlamaBackend {
    pub fn new(config: LlamaConfig) -> Self {
        Self {
            config,
            http_client: Client::new(),
        }
    }
}

#[async_trait]
impl ModelBackend for LlamaBackend {
    async fn load(&self, identity: &str) -> Result<Box<dyn LoadedModel>> {
        let model_path = resolve_model_path(&self.config.model_dir, identity)?;
        let server =
            LlamaServer::start(&self.config, &self.http_client, &model_path, &[]).await?;
        let client = LlamaClient::new(self.http_client.clone(), server.base_url());
        Ok(Box::new(LlamaChatModel { server, client }))
    }
}

/// A generation model resident in its own llama-server process.
struct LlamaChatModel {
    server: LlamaServer,
    client: LlamaClient,
}

#[async_trait]
impl LoadedModel for LlamaChatModel {
    async fn apply_chat_template(&self, messages: &[ChatMessage]) -> Option<String> {
        self.client.apply_chat_template(messages).await
    }

    async fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<TokenStream> {
        self.client.completion_stream(prompt, params).await
    }

    async fn release(&mut self) {
        self.server.terminate().await;
    }
}

/// The resident embedding encoder, backed by a llama-server started with
/// `--embedding` once at bootstrap.
pub struct LlamaEncoder {
    // Keeps the process alive (and kill_on_drop armed) for the runner's
    // whole lifetime.
    _server: LlamaServer,
    client: LlamaClient,
}

impl LlamaEncoder {
    pub async fn start(config: &LlamaConfig, embedding: &EmbeddingConfig) -> Result<Self> {
        let http_client = Client::new();
        let model_path = resolve_model_path(&config.model_dir, &embedding.model)?;
        let server =
            LlamaServer::start(config, &http_client, &model_path, &["--embedding"]).await?;
        let client = LlamaClient::new(http_client, server.base_url());
        tracing::info!(model = %model_path.display(), "embedding model resident");
        Ok(Self {
            _server: server,
            client,
        })
    }
}

#[async_trait]
impl TextEncoder for LlamaEncoder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.client.embeddings(texts).await
    }
}

async fn allocate_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| Error::Communication(format!("failed to bind for port allocation: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Communication(format!("failed to get local addr: {}", e)))?
        .port();
    drop(listener);
    Ok(port)
}
