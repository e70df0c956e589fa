//! API layer -- axum routes, handlers, and middleware.

mod error;
mod routes;
pub mod state;

pub use self::error::ApiError;

use std::path::Path;

use self::state::AppState;
use axum::Router;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Build the application router.  When `artifacts_dir` is given, the files
/// written by the filesystem sink are served under `/artifacts`.
pub fn router(state: AppState, artifacts_dir: Option<&Path>) -> Router {
    let mut app = Router::new().nest("/api/v1", routes::api_routes());
    if let Some(dir) = artifacts_dir {
        app = app.nest_service("/artifacts", ServeDir::new(dir));
    }
    app.fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> ApiError {
    ApiError::NotFound("no such route".into())
}
