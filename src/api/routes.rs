use crate::api::listing::{FileEntry, FilesResponse, read_entries};
use crate::api::middleware::{TOKEN_HEADER, log_request_errors, require_token, security_headers};
use crate::api::range::{RangeOutcome, last_modified, not_modified, range_applies, select_range};
use crate::app_state::AppState;
use crate::error::ShareError;
use crate::security::OpenedFile;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, HeaderName, Method, Request, Response, StatusCode, Uri, header};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{Json, Redirect};
use axum::routing::get;
use mime_guess::{Mime, from_path};
use std::io::SeekFrom;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

const STREAM_CHUNK: usize = 64 * 1024;

/// Build the HTTP surface.
///
/// Listing and download routes sit behind the token middleware; the legacy
/// `/download/...` route only redirects and stays public.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    let protected = Router::new()
        .route("/api/files", get(list_root))
        .route("/api/files/{*path}", get(list_files))
        .route("/api/download", get(download_root))
        .route("/api/download/{*path}", get(download_file))
        .route_layer(from_fn_with_state(state.clone(), require_token));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(TOKEN_HEADER),
        ])
        .max_age(Duration::from_secs(86400));

    // Spans carry the path only: query strings may hold the token.
    let trace = TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
        tracing::debug_span!("request", method = %req.method(), path = %req.uri().path())
    });

    Router::new()
        .merge(protected)
        .route("/download/{*path}", get(legacy_download))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(from_fn(log_request_errors))
        .layer(from_fn(security_headers))
        .layer(cors)
        .layer(trace)
        .with_state(state)
}

pub async fn list_root(State(state): State<AppState>) -> Result<Json<FilesResponse>, ShareError> {
    list(&state, "").await.map(Json)
}

pub async fn list_files(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> Result<Json<FilesResponse>, ShareError> {
    list(&state, &path).await.map(Json)
}

pub async fn download_root(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response<Body>, ShareError> {
    download(&state, "", &method, &headers).await
}

pub async fn download_file(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response<Body>, ShareError> {
    download(&state, &path, &method, &headers).await
}

/// `/download/<path>` from older links, kept as a redirect to the API.
pub async fn legacy_download(uri: Uri) -> Redirect {
    // The raw path keeps its percent-encoding intact.
    let rest = uri.path().strip_prefix("/download").unwrap_or_default();
    let target = match uri.query() {
        Some(query) => format!("/api/download{rest}?{query}"),
        None => format!("/api/download{rest}"),
    };
    Redirect::temporary(&target)
}

async fn list(state: &AppState, requested: &str) -> Result<FilesResponse, ShareError> {
    let gate = &state.gate;
    let resolved = gate.resolve(requested).await?;
    let meta = gate.stat(&resolved).await?;

    let current_dir = gate.root().relative(&resolved);
    let name = resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base_info = FileEntry::new(name, current_dir.clone(), &meta);

    let files = if meta.is_dir() {
        read_entries(&resolved, &current_dir).await?
    } else {
        vec![base_info.clone()]
    };
    debug!(dir = %current_dir, entries = files.len(), "Listing served");

    Ok(FilesResponse {
        current_dir,
        base_info,
        files,
    })
}

async fn download(
    state: &AppState,
    requested: &str,
    method: &Method,
    headers: &HeaderMap,
) -> Result<Response<Body>, ShareError> {
    let resolved = state.gate.resolve(requested).await?;
    let OpenedFile {
        mut file,
        size,
        modified,
    } = state.gate.open(&resolved).await?;

    let name = resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let mime = from_path(&resolved).first_or_octet_stream();

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::CONTENT_DISPOSITION, content_disposition(&mime, &name))
        .header(header::CACHE_CONTROL, "no-store")
        .header(header::ACCEPT_RANGES, "bytes");

    if let Some(modified) = modified {
        builder = builder.header(header::LAST_MODIFIED, last_modified(modified));
        if not_modified(headers, modified) {
            return build(builder.status(StatusCode::NOT_MODIFIED), Body::empty());
        }
    }

    let honour_range = match modified {
        Some(modified) => range_applies(headers, modified),
        None => !headers.contains_key(header::IF_RANGE),
    };
    let outcome = if honour_range {
        select_range(headers.get(header::RANGE), size)
    } else {
        RangeOutcome::Full
    };

    let (start, len) = match outcome {
        RangeOutcome::Full => {
            builder = builder.status(StatusCode::OK);
            (0, size)
        }
        RangeOutcome::Partial(range) => {
            builder = builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, range.content_range(size));
            (range.start, range.len())
        }
        RangeOutcome::Unsatisfiable => {
            let builder = builder
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{size}"));
            return build(builder, Body::empty());
        }
    };
    builder = builder.header(header::CONTENT_LENGTH, len.to_string());

    debug!(file = %name, start, len, "Serving file");
    if *method == Method::HEAD {
        return build(builder, Body::empty());
    }

    if start > 0 {
        file.seek(SeekFrom::Start(start)).await.map_err(|error| {
            error!(?error, "Failed to seek file");
            ShareError::Internal
        })?;
    }
    let stream = ReaderStream::with_capacity(file.take(len), STREAM_CHUNK);
    build(builder, Body::from_stream(stream))
}

fn build(builder: axum::http::response::Builder, body: Body) -> Result<Response<Body>, ShareError> {
    builder.body(body).map_err(|error| {
        error!(?error, "Failed to build response");
        ShareError::Internal
    })
}

/// `inline` for images, `attachment` otherwise. The quoted name is reduced
/// to printable ASCII; the exact name travels in `filename*`.
fn content_disposition(mime: &Mime, name: &str) -> String {
    let disposition = if mime.type_() == mime_guess::mime::IMAGE {
        "inline"
    } else {
        "attachment"
    };

    let fallback = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect::<String>();

    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }

    format!("{disposition}; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}
