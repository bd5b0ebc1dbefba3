use assistant_orchestrator::config::{AppConfig, TenantSourceKind};
use assistant_orchestrator::llm::ProviderKind;
use assistant_orchestrator::memory::MemoryBackend;
use assistant_orchestrator::telemetry::LogFormat;
use serial_test::serial;
use std::env;
use std::io::Write;

const BIN: &str = "assistant-orchestrator";

// Helper to clear environment variables that might interfere with tests
fn clear_env_vars() {
    unsafe {
        for key in [
            "ASSISTANT_SERVER__PORT",
            "ASSISTANT_MEMORY__BACKEND",
            "ASSISTANT_ORCHESTRATOR__MAX_TOOL_CALLS",
            "ASSISTANT_LLM__PROVIDER",
            "CONFIG_FILE",
            "PORT",
            "TENANTS_CONFIG_PATH",
            "DATABASE_URL",
            "LLM_API_KEY",
            "LLM_BASE_URL",
        ] {
            env::remove_var(key);
        }
    }
}

fn yaml_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_default_config() {
    clear_env_vars();

    let config = AppConfig::load_from_args([BIN]).expect("defaults should load");
    assert_eq!(config.server.port, 8080);
    assert_eq!(config.llm.kind, ProviderKind::OpenAI);
    assert_eq!(config.llm.model_embed, "text-embedding-ada-002");
    assert_eq!(config.memory.backend, MemoryBackend::PgVector);
    assert_eq!(config.memory.chunk_size, 500);
    assert_eq!(config.orchestrator.max_tool_calls, 3);
    assert_eq!(config.tenants.source, TenantSourceKind::Yaml);
    assert_eq!(config.logging.format, LogFormat::Compact);
    assert!(config.database.url.is_none());

    let pipeline = config.pipeline_config();
    assert_eq!(pipeline.chunk_overlap, 50);
    assert!((config.orchestrator_config().rag_min_score - 0.7).abs() < f32::EPSILON);
}

#[test]
#[serial]
fn test_env_override() {
    clear_env_vars();
    unsafe {
        env::set_var("ASSISTANT_SERVER__PORT", "9090");
        env::set_var("ASSISTANT_MEMORY__BACKEND", "in_memory");
        env::set_var("LLM_API_KEY", "sk-test");
    }

    let config = AppConfig::load_from_args([BIN]).expect("Failed to load config");
    assert_eq!(config.server.port, 9090);
    assert_eq!(config.memory.backend, MemoryBackend::InMemory);
    assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));

    clear_env_vars();
}

#[test]
#[serial]
fn test_file_load_and_cli_priority() {
    clear_env_vars();

    let file = yaml_file(
        r"
server:
  port: 7070
llm:
  provider: mock
orchestrator:
  max_tool_calls: 5
logging:
  format: json
",
    );
    unsafe {
        env::set_var("ASSISTANT_ORCHESTRATOR__MAX_TOOL_CALLS", "4");
    }

    let path = file.path().to_str().unwrap();
    let config = AppConfig::load_from_args([BIN, "--config", path]).expect("Failed to load config from file");
    assert_eq!(config.server.port, 7070);
    assert_eq!(config.llm.kind, ProviderKind::Mock);
    assert_eq!(config.logging.format, LogFormat::Json);
    // env beats file
    assert_eq!(config.orchestrator.max_tool_calls, 4);

    // CLI beats file
    let config = AppConfig::load_from_args([BIN, "--config", path, "--port", "6000"]).unwrap();
    assert_eq!(config.server.port, 6000);

    clear_env_vars();
}

#[test]
#[serial]
fn test_missing_explicit_file_fails() {
    clear_env_vars();
    assert!(AppConfig::load_from_args([BIN, "--config", "/nonexistent/config.yaml"]).is_err());
}

#[test]
#[serial]
fn test_invalid_values_rejected() {
    clear_env_vars();

    let overlap = yaml_file("memory:\n  chunk_size: 100\n  chunk_overlap: 100\n");
    assert!(AppConfig::load_from_args([BIN, "--config", overlap.path().to_str().unwrap()]).is_err());

    let db_source = yaml_file("tenants:\n  source: database\n");
    assert!(AppConfig::load_from_args([BIN, "--config", db_source.path().to_str().unwrap()]).is_err());

    let with_url = AppConfig::load_from_args([
        BIN,
        "--config",
        db_source.path().to_str().unwrap(),
        "--database-url",
        "postgres://localhost/assistant",
    ])
    .unwrap();
    assert_eq!(with_url.tenants.source, TenantSourceKind::Database);
    assert_eq!(
        with_url.tenant_defaults().database_url.as_deref(),
        Some("postgres://localhost/assistant")
    );
}
