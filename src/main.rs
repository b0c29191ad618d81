use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use toolport::config::GlobalConfig;
use toolport::events::LoggingObserver;
use toolport::health::HealthChecker;
use toolport::installed::InstalledStore;
use toolport::ipc::IPCServer;
use toolport::manifest::ManifestStore;
use toolport::orchestrator::ToolOrchestrator;
use toolport::supervisor::ProcessSupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("toolport daemon starting");

    let cfg = GlobalConfig::load().context("Failed to load configuration")?;

    let manifests = Arc::new(ManifestStore::new(
        &cfg.bundled_manifests_dir,
        &cfg.user_manifests_dir,
    ));
    tracing::info!("{} tool manifests available", manifests.load_all().len());

    let installed = Arc::new(
        InstalledStore::open(&cfg.installed_state_path)
            .with_context(|| format!("Failed to open {}", cfg.installed_state_path.display()))?,
    );

    let supervisor = ProcessSupervisor::new(
        cfg.supervisor_config(),
        Arc::new(cfg.port_allocator()),
        HealthChecker::default(),
    );
    supervisor.add_observer(Arc::new(LoggingObserver));

    let orchestrator = ToolOrchestrator::new(manifests, installed, supervisor);

    // 자동 시작 도구는 IPC 서버와 병렬로 띄움
    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let started = orchestrator.start_auto_start_tools().await;
            if started > 0 {
                tracing::info!("Auto-started {} tool(s)", started);
            }
        });
    }

    let shutdown = CancellationToken::new();
    let ipc_server = IPCServer::new(orchestrator.clone(), &cfg.ipc_listen);
    let server_task = tokio::spawn(ipc_server.start(shutdown.clone()));

    // Graceful shutdown: Ctrl+C 시 모든 도구 정리
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
        result = wait_server(server_task) => {
            if let Err(e) = result {
                tracing::error!("IPC server error: {}", e);
            }
            orchestrator.shutdown().await;
            return Err(anyhow::anyhow!("IPC server exited unexpectedly"));
        }
    }

    shutdown.cancel();
    orchestrator.shutdown().await;
    tracing::info!("toolport daemon shut down");
    Ok(())
}

async fn wait_server(task: tokio::task::JoinHandle<anyhow::Result<()>>) -> anyhow::Result<()> {
    task.await.context("IPC server task panicked")?
}
