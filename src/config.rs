//! Layered application configuration and the command line.
//!
//! Priority, lowest first: built-in defaults, the config file (`--config`,
//! else `./config.yaml` when present), `ASSISTANT_*` environment variables
//! (`ASSISTANT_SERVER__PORT=9000`), then explicit CLI flags and their env
//! aliases (`PORT`, `TENANTS_CONFIG_PATH`, `DATABASE_URL`).

use std::env;
use std::path::Path;

use clap::{Parser, Subcommand};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use uuid::Uuid;

use crate::llm::LlmSettings;
use crate::memory::{MemoryBackend, PipelineConfig};
use crate::orchestrator::OrchestratorConfig;
use crate::telemetry::LoggingConfig;
use crate::tenant::manager::TenantResourceManager;
use crate::tenant::TenantDefaults;

const ENV_PREFIX: &str = "ASSISTANT";
const CWD_CONFIG: &str = "config.yaml";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Tenants file path
    #[arg(long, env = "TENANTS_CONFIG_PATH")]
    pub tenants: Option<String>,

    /// Shared Postgres DSN
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Process a single message and print the outcome
    Turn {
        /// Routing key of the tenant (e.g. its channel number)
        #[arg(long)]
        routing_key: String,
        /// User id; a fresh one is generated when omitted
        #[arg(long)]
        user: Option<Uuid>,
        #[arg(long)]
        message: String,
    },
    /// List configured tenants
    Tenants,
    /// Apply database migrations
    Migrate,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmSettings,
    pub database: DatabaseConfig,
    pub memory: MemoryConfig,
    pub orchestrator: OrchestratorSection,
    pub tenants: TenantsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Upper bound on one HTTP request, turns included.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    pub backend: MemoryBackend,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub min_score: f32,
    pub max_context_tokens: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorSection {
    pub max_tool_calls: u32,
    pub max_tokens: u32,
    pub temperature: f32,
    pub enable_rag: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TenantSourceKind {
    Yaml,
    Database,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TenantsConfig {
    pub source: TenantSourceKind,
    pub path: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_args(env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).map_err(|e| ConfigError::Message(e.to_string()))?;
        Self::from_cli(&cli)
    }

    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("server.port", 8080)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.request_timeout_secs", 120)?
            .set_default("llm.provider", "openai")?
            .set_default("llm.model_chat", crate::llm::provider::DEFAULT_CHAT_MODEL)?
            .set_default("llm.model_embed", crate::llm::provider::DEFAULT_EMBEDDING_MODEL)?
            .set_default("llm.request_timeout_secs", 60)?
            .set_default("database.max_connections", 5)?
            .set_default("memory.backend", "pgvector")?
            .set_default("memory.chunk_size", 500)?
            .set_default("memory.chunk_overlap", 50)?
            .set_default("memory.top_k", 5)?
            .set_default("memory.min_score", 0.7)?
            .set_default("memory.max_context_tokens", 2000)?
            .set_default("orchestrator.max_tool_calls", 3)?
            .set_default("orchestrator.max_tokens", 500)?
            .set_default("orchestrator.temperature", 0.7)?
            .set_default("orchestrator.enable_rag", true)?
            .set_default("tenants.source", "yaml")?
            .set_default("tenants.path", "tenants.yaml")?
            .set_default("logging.format", "compact")?;

        match &cli.config {
            Some(path) => builder = builder.add_source(File::with_name(path).required(true)),
            None if Path::new(CWD_CONFIG).exists() => {
                builder = builder.add_source(File::with_name(CWD_CONFIG).required(false));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        // Provider credentials under their conventional names.
        if let Ok(key) = env::var("LLM_API_KEY") {
            if !key.trim().is_empty() {
                builder = builder.set_override("llm.api_key", key)?;
            }
        }
        if let Ok(url) = env::var("LLM_BASE_URL") {
            if !url.trim().is_empty() {
                builder = builder.set_override("llm.base_url", url)?;
            }
        }

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(path) = &cli.tenants {
            builder = builder.set_override("tenants.path", path.as_str())?;
        }
        if let Some(url) = &cli.database_url {
            builder = builder.set_override("database.url", url.as_str())?;
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.chunk_size == 0 {
            return Err(ConfigError::Message("memory.chunk_size must be positive".into()));
        }
        if self.memory.chunk_overlap >= self.memory.chunk_size {
            return Err(ConfigError::Message(
                "memory.chunk_overlap must be smaller than memory.chunk_size".into(),
            ));
        }
        if self.orchestrator.max_tool_calls == 0 {
            return Err(ConfigError::Message("orchestrator.max_tool_calls must be at least 1".into()));
        }
        if self.tenants.source == TenantSourceKind::Database && self.database.url.is_none() {
            return Err(ConfigError::Message(
                "tenants.source = database requires database.url".into(),
            ));
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_context_tokens: self.memory.max_context_tokens,
            default_top_k: self.memory.top_k,
            default_min_score: self.memory.min_score,
            chunk_size: self.memory.chunk_size,
            chunk_overlap: self.memory.chunk_overlap,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_tokens: self.orchestrator.max_tokens,
            temperature: self.orchestrator.temperature,
            max_tool_calls: self.orchestrator.max_tool_calls,
            enable_rag: self.orchestrator.enable_rag,
            rag_top_k: self.memory.top_k,
            rag_min_score: self.memory.min_score,
            context_tokens: self.memory.max_context_tokens,
        }
    }

    pub fn tenant_defaults(&self) -> TenantDefaults {
        TenantDefaults {
            database_url: self.database.url.clone(),
            vector_store: self.memory.backend,
            embedding_model: self.llm.model_embed.clone(),
        }
    }

    /// Apply the pipeline and orchestrator sections to a manager.
    pub fn configure(&self, manager: TenantResourceManager) -> TenantResourceManager {
        manager
            .with_pipeline_config(self.pipeline_config())
            .with_orchestrator_config(self.orchestrator_config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_turn_subcommand() {
        let cli = Cli::try_parse_from([
            "assistant-orchestrator",
            "turn",
            "--routing-key",
            "+1555",
            "--message",
            "hello",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Turn { ref routing_key, user: None, .. }) if routing_key == "+1555"
        ));
    }

    #[test]
    fn test_cli_without_subcommand_serves() {
        let cli = Cli::try_parse_from(["assistant-orchestrator", "--port", "9000"]).unwrap();
        assert_eq!(cli.command, None);
        assert_eq!(cli.port, Some(9000));
    }
}
