use std::panic;
use std::sync::Arc;

use clap::Parser;
use itertools::Itertools;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, Isolation};
use crate::core::orchestrator::Orchestrator;
use crate::core::registry::LanguageRegistry;
use crate::core::workspace::WorkspaceManager;
use crate::native::cgroup::CgroupTree;
use crate::native::executor::NativeExecutor;
use crate::native::sandbox::{self, ConfinementError};

mod config;
mod constants;
mod core;
mod http;
mod native;


#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("polyrun=info,tower_http=info")),
        )
        .init();
    set_panic_hook();

    let config = Config::parse();
    let registry = LanguageRegistry::new(&config.registry_defaults());

    if config.skip_toolchain_check {
        tracing::warn!("Toolchain check skipped");
    } else {
        native::toolchain::validate(&registry.toolchains())
            .inspect_err(|e| tracing::error!(error = %e, "Toolchain check failed"))?;
    }

    let languages = registry.languages().iter().map(|l| l.id()).join(",");

    let workspaces = WorkspaceManager::new(config.workspace_root());
    let swept = workspaces.sweep().await?;
    tracing::info!(
        root = %workspaces.root().display(),
        swept,
        "Workspace root ready"
    );

    let mut executor = NativeExecutor::new().with_confinement(confinement(&config).await?);
    if let Some(base) = &config.cgroup_root {
        let tree = CgroupTree::open(base)
            .inspect_err(|e| tracing::error!(error = %e, "Cgroup setup failed"))?;
        executor = executor.with_cgroups(Arc::new(tree));
    }

    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        workspaces.clone(),
        Arc::new(executor),
        config.admission_limits(),
    );
    let app = http::services::router(orchestrator, config.body_limit_bytes());

    let listener = TcpListener::bind(&config.bind).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        languages = %languages,
        "HTTP server listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let swept = workspaces.sweep().await?;
    tracing::info!(swept, "Server stopped");

    Ok(())
}

/// Decides whether children get their own mount namespace.
async fn confinement(config: &Config) -> Result<bool, ConfinementError> {
    if config.isolation == Isolation::Off {
        tracing::warn!("Workspace isolation disabled");
        return Ok(false);
    }

    match sandbox::verify(&config.workspace_root()).await {
        Ok(()) => {
            tracing::info!("Workspace isolation enabled");
            Ok(true)
        }
        Err(e) if config.isolation == Isolation::Auto => {
            tracing::warn!(error = %e, "Namespaces unavailable, workspace isolation disabled");
            Ok(false)
        }
        Err(e) => {
            tracing::error!(error = %e, "Workspace isolation check failed");
            Err(e)
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        futures::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
