//! Trust Registry binary: logging, state, jobs, serve.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trust_registry::{
    jobs::{schedule_defaults, TaskPool, TokioTaskPool},
    router, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "trust_registry=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = Arc::new(AppState::connect().await?);

    let jobs = TokioTaskPool::new();
    schedule_defaults(&jobs, state.config.clone(), state.trust.clone());

    let app = router(state);

    let addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:4443".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Trust Registry listening on http://{addr}");

    axum::serve(listener, app).await?;
    jobs.shutdown();
    Ok(())
}
