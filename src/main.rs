//! Assistant orchestrator server and CLI.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use assistant_orchestrator::config::{AppConfig, Cli, Command};
use assistant_orchestrator::orchestrator::TurnRequest;
use assistant_orchestrator::{build_tenant_manager, connect_admin_pool, run_migrations, server, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let cli = Cli::parse();
    let config = Arc::new(AppConfig::from_cli(&cli).context("failed to load configuration")?);
    telemetry::init(&config.logging);

    info!(
        name: "llm.config.loaded",
        provider = %config.llm.kind.as_str(),
        model = %config.llm.model_chat,
        embedding_model = %config.llm.model_embed,
        "LLM configuration loaded"
    );

    match cli.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => {
            let manager = build_tenant_manager(&config)
                .await
                .context("failed to load tenants")?;
            server::start_server(config, manager).await
        }
        Command::Turn {
            routing_key,
            user,
            message,
        } => {
            let manager = build_tenant_manager(&config)
                .await
                .context("failed to load tenants")?;
            let tenant = manager.resolve(&routing_key).await?;
            let orchestrator = manager.build_orchestrator(&tenant.tenant_id).await?;

            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });

            let request = TurnRequest::new(tenant.tenant_id.clone(), user.unwrap_or_else(Uuid::new_v4), message);
            let outcome = orchestrator.process_turn(&request, &cancel).await;
            manager.close().await?;

            println!("{}", serde_json::to_string_pretty(&outcome?)?);
            Ok(())
        }
        Command::Tenants => {
            let manager = build_tenant_manager(&config)
                .await
                .context("failed to load tenants")?;
            let tenants = manager.list_all().await;
            let tenants: Vec<_> = tenants.iter().map(|t| &**t).collect();
            println!("{}", serde_json::to_string_pretty(&tenants)?);
            Ok(())
        }
        Command::Migrate => {
            let pool = connect_admin_pool(&config).await?;
            run_migrations(&pool).await?;
            info!(name: "db.migrated", "Database migrations applied");
            pool.close().await;
            Ok(())
        }
    }
}
