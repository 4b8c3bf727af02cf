pub mod middleware;
pub mod page;
pub mod routes;

// Re-export public types and functions
pub use middleware::log_request_errors;
pub use routes::{
    ApiError, MergeResponse, cancel_job, download, index, job_events, job_status, submit_merge,
};
