pub mod api;
pub mod app_state;
pub mod config;
pub mod error;
pub mod job;
pub mod media;
pub mod upload;
pub mod workspace;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::Any;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

//
// Re-export
//
pub use api::{
    cancel_job, download, index, job_events, job_status, log_request_errors, submit_merge,
};
pub use app_state::AppState;
pub use config::Config;
pub use error::{ErrorKind, MergeError};
pub use job::{JobManager, JobStatus, JobView};
pub use media::{MergeProgress, MergeSummary, merge_clips};
pub use upload::{ALLOWED_EXTENSIONS, ClipCount, UploadSet, UploadedFile};
pub use workspace::{JobWorkspace, OUTPUT_FILE};

/// All HTTP routes of the merger, ready to serve.
pub fn router(state: AppState) -> Router {
    // CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route(
            "/merge",
            post(submit_merge).layer(DefaultBodyLimit::max(state.max_upload_bytes)),
        )
        .route("/jobs/{job_id}", get(job_status).delete(cancel_job))
        .route("/jobs/{job_id}/events", get(job_events))
        .route("/jobs/{job_id}/download", get(download))
        .layer(axum::middleware::from_fn(log_request_errors))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state))
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = AppState::new(&config).await?;
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.listen_on_port);
    info!(workspace = %config.workspace, "Video merger listening on {addr}");
    let listener = TcpListener::bind(&addr).await?;

    axum::serve(listener, app).await?;
    Ok(())
}
