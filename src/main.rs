use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use code_assistant_service::{
    AppConfig, BackendKind, DeviceSelection, InferenceBackend, LocalBackend, RemoteBackend,
    backend::local::default_loader, build_router,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(backend = %config.backend, model = %config.model_id, "starting code assistant");

    let device = DeviceSelection::probe(config.use_gpu);
    let backend: Arc<dyn InferenceBackend> = match config.backend {
        BackendKind::Remote => Arc::new(RemoteBackend::new(&config, &device)?),
        BackendKind::Local => {
            let loader = default_loader(&config);
            Arc::new(LocalBackend::initialize(&config, loader.as_ref(), &device)?)
        }
    };
    let router = build_router(config.clone(), backend);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
