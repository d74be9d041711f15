//! Configuration for the unified runner.

use clap::Parser;
use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Command-line arguments. Everything else comes from the config file or
/// `RUNNER__*` environment variables; the port flag wins over both.
#[derive(Debug, Parser)]
#[command(name = "unified-ai-runner")]
#[command(about = "Unified chat + embeddings runner over a single accelerator")]
pub struct Cli {
    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Config file name or path (without extension), loaded if present.
    #[arg(long, default_value = "config")]
    pub config: String,
}

/// Main configuration structure for the unified runner.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub llama: LlamaConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// llama-server process configuration.
///
/// One server runs per loaded model; the runner spawns and terminates them
/// as the active generation model is swapped.
#[derive(Debug, Clone, Deserialize)]
pub struct LlamaConfig {
    /// Path to the llama-server binary or wrapper command.
    #[serde(default = "default_server_binary")]
    pub server_binary: String,
    /// Extra arguments inserted BEFORE the model args.
    /// Use this for wrapper commands like toolbox.
    #[serde(default)]
    pub server_args: Vec<String>,
    /// Directory containing .gguf model files.
    #[serde(default = "default_model_dir")]
    pub model_dir: String,
    /// Number of layers to offload to the accelerator (-ngl flag).
    #[serde(default)]
    pub gpu_layers: Option<u32>,
    /// Context window size (-c flag).
    #[serde(default)]
    pub context_size: Option<u32>,
    /// Server startup timeout in seconds.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    /// Server graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Log llama-server stderr output for debugging.
    #[serde(default)]
    pub log_server_output: bool,
    /// Extra arguments appended AFTER the standard llama-server flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for LlamaConfig {
    fn default() -> Self {
        Self {
            server_binary: default_server_binary(),
            server_args: vec![],
            model_dir: default_model_dir(),
            gpu_layers: None,
            context_size: None,
            startup_timeout_secs: default_startup_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            log_server_output: false,
            extra_args: vec![],
        }
    }
}

/// Resident embedding model configuration. Loaded once at startup and never
/// swapped out.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    /// GGUF file for the embedding model, resolved like a generation
    /// identity (relative names are looked up under `llama.model_dir`).
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Name advertised in embedding responses when the request omits one.
    #[serde(default = "default_embedding_model_name")]
    pub model_name: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            model_name: default_embedding_model_name(),
        }
    }
}

// Default values
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    11434
}
fn default_server_binary() -> String {
    "llama-server".to_string()
}
fn default_model_dir() -> String {
    "models".to_string()
}
fn default_startup_timeout() -> u64 {
    120
}
fn default_shutdown_timeout() -> u64 {
    10
}
fn default_embedding_model() -> String {
    "nomic-embed-text-v1.5.Q8_0".to_string()
}
fn default_embedding_model_name() -> String {
    "nomic-embed-text".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. The `--port` command-line flag
    /// 2. Environment variables (RUNNER__SECTION__KEY format)
    /// 3. The config file named by `--config` (if present)
    /// 4. Built-in defaults
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("api.host", default_host())?
            .set_default("api.port", default_port() as i64)?
            .add_source(File::with_name(&cli.config).required(false))
            .add_source(
                Environment::with_prefix("RUNNER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        if let Some(port) = cli.port {
            config.api.port = port;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_api_config() {
        let api = ApiConfig::default();
        assert_eq!(api.host, "127.0.0.1");
        assert_eq!(api.port, 11434);
    }

    #[test]
    fn test_default_llama_config() {
        let llama = LlamaConfig::default();
        assert_eq!(llama.server_binary, "llama-server");
        assert_eq!(llama.model_dir, "models");
        assert_eq!(llama.startup_timeout_secs, 120);
        assert_eq!(llama.shutdown_timeout_secs, 10);
        assert!(llama.server_args.is_empty());
        assert!(!llama.log_server_output);
    }

    #[test]
    fn test_cli_port_overrides_defaults() {
        let cli = Cli {
            port: Some(8123),
            config: "does-not-exist".to_string(),
        };
        let config = Config::load(&cli).unwrap();
        assert_eq!(config.api.port, 8123);
        assert_eq!(config.api.host, "127.0.0.1");
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["unified-ai-runner"]);
        assert!(cli.port.is_none());
        assert_eq!(cli.config, "config");
    }

    #[test]
    fn test_cli_port_flag_parses() {
        let cli = Cli::parse_from(["unified-ai-runner", "--port", "9000"]);
        assert_eq!(cli.port, Some(9000));
    }
}
