mod error;
mod routes;

pub use error::{ApiError, ApiResult};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::response::IntoResponse;
use database::InMemoryRepository;
use log::{error, info};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;

use crate::routes::ServerRoutes;

/// Read-only operational surface over ranking output and review queue
/// state (SPEC_FULL §2.1). Not part of the ingestion/matching write path —
/// every handler only ever reads through `repository`.
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<InMemoryRepository>,
}

pub struct RankingServer {
    state: AppState,
    port: u16,
}

impl RankingServer {
    pub fn new(repository: Arc<InMemoryRepository>, port: u16) -> Self {
        RankingServer {
            state: AppState { repository },
            port,
        }
    }

    pub async fn run(&self) {
        let app = ServerRoutes::create().layer(
            ServiceBuilder::new().layer(CatchPanicLayer::custom(|_err| {
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error - handler panicked".to_string(),
                )
                    .into_response()
            })),
        );
        let app = app.with_state(self.state.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to bind to address {addr}: {e}");
                panic!("cannot start server without binding to port");
            }
        };

        info!("listen at: http://localhost:{}", self.port);

        if let Err(e) = axum::serve(listener, app).await {
            error!("server error: {e}");
            error!("server stopped unexpectedly, but not crashing the process");
        }
    }
}
