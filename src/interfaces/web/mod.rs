mod handlers;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::core::brain::Brain;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::memory::MemorySystem;
use crate::core::scheduler::Scheduler;
use crate::core::workflow::IngestionWorkflow;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) memory: Arc<MemorySystem>,
    pub(crate) brain: Arc<Brain>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) workflow: Arc<IngestionWorkflow>,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
}

pub struct ApiServer {
    state: AppState,
    api_host: String,
    api_port: u16,
    shutdown: tokio_util::sync::CancellationToken,
}

impl ApiServer {
    pub(crate) fn new(state: AppState, api_host: String, api_port: u16) -> Self {
        Self {
            state,
            api_host,
            api_port,
            shutdown: tokio_util::sync::CancellationToken::new(),
        }
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| {
        match msg {
            Ok(log) => Ok(Event::default().data(log)), // SSE properly encodes this
            Err(_) => Ok(Event::default().data("Log stream lagged")),
        }
    });

    Sse::new(stream)
}

// --- Lifecycle Implementations ---

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.api_host, self.api_port);
        let app = router::build_api_router(self.state.clone(), self.api_port);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!("API Server running at http://{addr}");
                    let serve = axum::serve(listener, app)
                        .with_graceful_shutdown(async move { shutdown.cancelled().await });
                    if let Err(e) = serve.await {
                        tracing::error!("API Server crashed: {}", e);
                    }
                }
                Err(e) => tracing::error!("API Server failed to bind {}: {}", addr, e),
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        self.shutdown.cancel();
        Ok(())
    }
}
