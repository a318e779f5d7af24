use crate::config::SegmentationConfig;
use crate::handlers;
use crate::services::{LocalSessionStore, SessionStore, SessionSweeper};
use crate::workers::{JobQueue, Segmenter, TotalSegmentator, WorkerOrchestrator};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    metrics_middleware, request_id_middleware, security_headers_middleware,
};
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: SegmentationConfig,
    pub sessions: Arc<dyn SessionStore>,
    pub jobs: JobQueue,
}

pub fn build_router(state: AppState) -> Router {
    let max_upload = state.config.upload.max_bytes;

    Router::new()
        .route("/", get(handlers::upload_form))
        .route("/segment", post(handlers::segment_image))
        .route("/segment/", post(handlers::segment_image))
        .route("/example/", get(handlers::segment_example))
        .route(
            "/download/:session_id/segmentation.nii",
            get(handlers::download_segmentation),
        )
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route_layer(middleware::from_fn(metrics_middleware))
        .layer(DefaultBodyLimit::max(max_upload))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type ServerFuture = Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>;

pub struct Application {
    port: u16,
    server: ServerFuture,
    state: AppState,
    shutdown_token: CancellationToken,
}

impl Application {
    pub async fn build(config: SegmentationConfig) -> Result<Self, AppError> {
        let segmenter: Arc<dyn Segmenter> = Arc::new(TotalSegmentator::new(config.segmenter.clone()));
        Self::build_with_segmenter(config, segmenter).await
    }

    /// Builds the service around a caller-supplied segmenter.
    pub async fn build_with_segmenter(
        config: SegmentationConfig,
        segmenter: Arc<dyn Segmenter>,
    ) -> Result<Self, AppError> {
        let sessions: Arc<dyn SessionStore> = Arc::new(
            LocalSessionStore::new(&config.sessions.root)
                .await
                .map_err(|e| {
                    tracing::error!(
                        "Failed to initialize session root at {:?}: {}",
                        config.sessions.root,
                        e
                    );
                    e
                })?,
        );

        let shutdown_token = CancellationToken::new();

        let (orchestrator, jobs) = WorkerOrchestrator::new(
            config.worker.clone(),
            segmenter,
            sessions.clone(),
            shutdown_token.clone(),
        );
        tokio::spawn(orchestrator.start());

        if let Some(ttl) = config.sessions.ttl() {
            if let Some(timeout) = config.segmenter.timeout() {
                if ttl < timeout {
                    tracing::warn!(
                        ttl_secs = ttl.as_secs(),
                        timeout_secs = timeout.as_secs(),
                        "Session TTL is shorter than the segmentation timeout"
                    );
                }
            }
            SessionSweeper::new(
                sessions.clone(),
                ttl,
                config.sessions.sweep_interval(),
                shutdown_token.clone(),
            )
            .start();
        }

        let state = AppState {
            config: config.clone(),
            sessions,
            jobs,
        };

        let app = build_router(state.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        let server = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_token.clone()))
            .into_future();

        Ok(Self {
            port,
            server: Box::pin(server),
            state,
            shutdown_token,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Token that stops the server, worker pool and sweeper when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let result = self.server.await;

        self.shutdown_token.cancel();

        if self.state.config.sessions.cleanup_on_exit {
            if let Err(e) = self.state.sessions.clear().await {
                tracing::error!("Failed to clean up sessions on exit: {}", e);
            }
        }

        tracing::info!("Server stopped");
        result
    }
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => {},
    }

    tracing::info!("Shutdown signal received");
}
