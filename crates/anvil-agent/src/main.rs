use anvil_agent::{Orchestrator, config::AgentConfig, http};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let stdout = tracing_subscriber::fmt::layer();
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(stdout);

    match std::env::var("ANVIL_LOG_DIR").ok().filter(|v| !v.trim().is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "anvil-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let cfg = AgentConfig::load()?;
    let addr = cfg.bind;
    let orchestrator = Orchestrator::new(cfg);
    orchestrator.load().await?;

    let app = http::router(orchestrator.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "anvil-agent HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown().await?;
    tracing::info!("anvil-agent stopped");
    Ok(())
}
