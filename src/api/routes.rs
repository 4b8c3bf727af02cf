use crate::AppState;
use crate::api::page::INDEX_HTML;
use crate::error::{ErrorResponse, MergeError};
use crate::job::JobView;
use crate::upload::{ClipCount, UploadSet, UploadedFile, allowed_extension};
use crate::workspace::OUTPUT_FILE;
use axum::body::Body;
use axum::extract::multipart::MultipartError;
use axum::extract::{Extension, Multipart, Path as AxumPath};
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Json};
use futures::{Stream, StreamExt};
use mime_guess::from_path;
use serde::{Deserialize, Serialize};
use std::io::Error as IoError;
use std::path::PathBuf;
use tokio::io::AsyncSeekExt;
use tokio_stream::wrappers::WatchStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const COUNT_FIELD: &str = "count";
const VIDEO_FIELD_PREFIX: &str = "video_";
const DOWNLOAD_DISPOSITION: &str = "attachment; filename=\"merged_video.mp4\"";

#[derive(Debug, Serialize, Deserialize)]
pub struct MergeResponse {
    pub job_id: Uuid,
    pub status_url: String,
    pub events_url: String,
    pub download_url: String,
}

impl MergeResponse {
    fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            status_url: format!("/jobs/{job_id}"),
            events_url: format!("/jobs/{job_id}/events"),
            download_url: format!("/jobs/{job_id}/download"),
        }
    }
}

/// Everything a handler can answer with besides success.
#[derive(Debug)]
pub enum ApiError {
    Merge(MergeError),
    Multipart(MultipartError),
    JobNotFound,
    NotReady(&'static str),
    RangeNotSatisfiable(u64),
}

impl From<MergeError> for ApiError {
    fn from(error: MergeError) -> Self {
        ApiError::Merge(error)
    }
}

impl From<MultipartError> for ApiError {
    fn from(error: MultipartError) -> Self {
        ApiError::Multipart(error)
    }
}

impl From<IoError> for ApiError {
    fn from(error: IoError) -> Self {
        ApiError::Merge(MergeError::Io(error))
    }
}

fn error_body(status: StatusCode, kind: &'static str, message: String) -> axum::response::Response {
    (status, Json(ErrorResponse { kind, message })).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiError::Merge(error) => error.into_response(),
            ApiError::Multipart(error) => {
                error_body(error.status(), "invalid_request", error.body_text())
            }
            ApiError::JobNotFound => {
                error_body(StatusCode::NOT_FOUND, "not_found", "Job not found".into())
            }
            ApiError::NotReady(state) => error_body(
                StatusCode::CONFLICT,
                "not_ready",
                format!("Merged video is not available, job is {state}"),
            ),
            ApiError::RangeNotSatisfiable(size) => {
                let mut res = error_body(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    "invalid_range",
                    "Requested range not satisfiable".into(),
                );
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    res.headers_mut().insert(header::CONTENT_RANGE, value);
                }
                res
            }
        }
    }
}

fn parse_job_id(job_id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(job_id).map_err(|_| ApiError::JobNotFound)
}

/// Zero-based slot of a `video_<n>` field, `n` counting from 1.
fn parse_slot(field: &str) -> Option<usize> {
    field
        .strip_prefix(VIDEO_FIELD_PREFIX)?
        .parse::<usize>()
        .ok()?
        .checked_sub(1)
}

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Reads the `count` field and the `video_<n>` file fields into an upload set.
async fn collect_uploads(mut multipart: Multipart) -> Result<UploadSet, ApiError> {
    let mut count = None;
    let mut uploads = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };

        if name == COUNT_FIELD {
            count = Some(field.text().await?.parse::<ClipCount>()?);
            continue;
        }

        let Some(slot) = parse_slot(&name) else {
            debug!(field = %name, "Ignoring unknown form field");
            continue;
        };

        // browsers send an unnamed empty part for an untouched file input
        let file_name = field.file_name().unwrap_or_default().to_owned();
        if file_name.is_empty() {
            continue;
        }
        if allowed_extension(&file_name).is_none() {
            return Err(MergeError::UnsupportedFormat { name: file_name }.into());
        }

        let content = field.bytes().await?;
        debug!(slot, name = %file_name, bytes = content.len(), "Upload received");
        uploads.push((slot, UploadedFile::new(file_name, content)?));
    }

    let count = count.ok_or(MergeError::MissingCount)?;
    let mut set = UploadSet::new(count);
    for (slot, file) in uploads {
        set.accept(slot, file)?;
    }
    Ok(set)
}

pub async fn submit_merge(
    Extension(state): Extension<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let uploads = collect_uploads(multipart).await?;
    let files = uploads.into_files()?;
    let job_id = state.jobs_manager.submit(files).await?;
    info!(%job_id, "Merge submitted");

    Ok((StatusCode::ACCEPTED, Json(MergeResponse::new(job_id))))
}

pub async fn job_status(
    Extension(state): Extension<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> Result<Json<JobView>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let view = state
        .jobs_manager
        .status(&job_id)
        .await
        .ok_or(ApiError::JobNotFound)?;
    Ok(Json(view))
}

/// Server-sent `status` events, one per status change, closing after the
/// job reaches a terminal state.
pub async fn job_events(
    Extension(state): Extension<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let rx = state
        .jobs_manager
        .subscribe(&job_id)
        .await
        .ok_or(ApiError::JobNotFound)?;

    let stream = WatchStream::new(rx)
        .map(|status| Event::default().event("status").json_data(status));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn cancel_job(
    Extension(state): Extension<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> Result<StatusCode, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    if state.jobs_manager.cancel(&job_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::JobNotFound)
    }
}

pub async fn download(
    Extension(state): Extension<AppState>,
    AxumPath(job_id): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Response<Body>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let (status, path) = state
        .jobs_manager
        .output(&job_id)
        .await
        .ok_or(ApiError::JobNotFound)?;
    if !status.is_done() {
        return Err(ApiError::NotReady(status.state()));
    }

    let size = tokio::fs::metadata(&path).await?.len();
    if size == 0 {
        warn!(%job_id, path = %path.display(), "Merged video is empty");
        return Err(MergeError::Media("Merged video is empty".into()).into());
    }

    let (status, start, end) = parse_range(&headers, size).ok_or(ApiError::RangeNotSatisfiable(size))?;
    let len = end - start + 1;
    let stream = open_range(path, start, len).await?;
    debug!(%job_id, start, end, size, "Serving merged video");

    let mut res = Response::new(Body::from_stream(stream));
    *res.status_mut() = status;
    let headers = res.headers_mut();
    if let Ok(mime) = HeaderValue::from_str(from_path(OUTPUT_FILE).first_or_octet_stream().as_ref()) {
        headers.insert(header::CONTENT_TYPE, mime);
    }
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static(DOWNLOAD_DISPOSITION),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if status == StatusCode::PARTIAL_CONTENT
        && let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{size}"))
    {
        headers.insert(header::CONTENT_RANGE, value);
    }
    Ok(res)
}

async fn open_range(
    path: PathBuf,
    start: u64,
    len: u64,
) -> std::io::Result<impl Stream<Item = Result<bytes::Bytes, IoError>> + Send> {
    let mut fh = tokio::fs::File::open(&path).await?;
    fh.seek(std::io::SeekFrom::Start(start)).await?;

    use tokio::io::AsyncReadExt as _;
    Ok(ReaderStream::new(fh.take(len)))
}

/// Resolves a single `Range: bytes=` request against `file_size` (> 0).
/// Missing or malformed headers select the whole file; `None` means the
/// range cannot be satisfied.
fn parse_range(headers: &HeaderMap, file_size: u64) -> Option<(StatusCode, u64, u64)> {
    let whole = Some((StatusCode::OK, 0, file_size - 1));

    let Some(ranges) = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().strip_prefix("bytes="))
    else {
        return whole;
    };
    // multiple ranges are answered with the whole file
    if ranges.contains(',') {
        return whole;
    }
    let Some((start, end)) = ranges.split_once('-') else {
        return whole;
    };

    match (start.trim(), end.trim()) {
        ("", suffix) => {
            let Ok(suffix) = suffix.parse::<u64>() else {
                return whole;
            };
            if suffix == 0 {
                return None;
            }
            Some((
                StatusCode::PARTIAL_CONTENT,
                file_size.saturating_sub(suffix),
                file_size - 1,
            ))
        }
        (start, end) => {
            let Ok(start) = start.parse::<u64>() else {
                return whole;
            };
            if start >= file_size {
                return None;
            }
            let end = match end {
                "" => file_size - 1,
                end => match end.parse::<u64>() {
                    Ok(end) if end >= start => end.min(file_size - 1),
                    Ok(_) => return None,
                    Err(_) => return whole,
                },
            };
            Some((StatusCode::PARTIAL_CONTENT, start, end))
        }
    }
}
