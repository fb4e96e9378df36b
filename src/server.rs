//! HTTP surface: preview, download, and download outcome lookup.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    audio::{AudioJob, AudioTransfer},
    config::Settings,
    error::DownloadError,
    format::{Container, Quality, SelectionRequest, format_bytes, select},
    ledger::{DownloadLedger, DownloadRecord},
    metadata::fetch_metadata,
    naming::{attachment_filename, content_disposition, is_supported_url, media_type, sanitize_filename},
    process::Invocation,
    stream::{PipeTransfer, TransferLimits},
};

pub const DOWNLOAD_ID_HEADER: &str = "x-download-id";
const DEFAULT_BITRATE_KBPS: u32 = 192;
const MIN_BITRATE_KBPS: u32 = 32;
const MAX_BITRATE_KBPS: u32 = 320;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub ledger: Arc<DownloadLedger>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let ledger = Arc::new(DownloadLedger::new(settings.ledger_capacity));
        Self {
            settings: Arc::new(settings),
            ledger,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/video_info", post(video_info))
        .route("/api/download", post(download))
        .route("/api/download/{id}/status", get(download_status))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        let status = err.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct VideoInfoRequest {
    pub url: Option<String>,
    pub format: Option<String>,
    pub quality: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadRequest {
    pub url: Option<String>,
    pub format: Option<String>,
    pub quality: Option<String>,
    pub bitrate: Option<Bitrate>,
}

/// Clients send the bitrate either as a number or as a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Bitrate {
    Number(u64),
    Text(String),
}

#[derive(Debug, Serialize)]
pub struct VideoInfoResponse {
    pub title: String,
    pub thumbnail_url: Option<String>,
    pub estimated_size: String,
}

/// A request that passed validation.
struct Admitted {
    url: String,
    selection: SelectionRequest,
}

fn admit(
    url: Option<&str>,
    format: Option<&str>,
    quality: Option<&str>,
    bitrate: Option<&Bitrate>,
    invalid_url: &str,
) -> Result<Admitted, DownloadError> {
    if !is_supported_url(url) {
        return Err(DownloadError::InvalidRequest(invalid_url.to_string()));
    }
    let url = url.unwrap_or_default().trim().to_string();
    let container = format
        .unwrap_or("mp4")
        .parse::<Container>()
        .map_err(DownloadError::InvalidRequest)?;
    let quality = quality
        .unwrap_or("best")
        .parse::<Quality>()
        .map_err(DownloadError::InvalidRequest)?;
    let audio_bitrate_kbps = parse_bitrate(bitrate)?;

    Ok(Admitted {
        url,
        selection: SelectionRequest {
            container,
            quality,
            audio_bitrate_kbps,
        },
    })
}

fn parse_bitrate(bitrate: Option<&Bitrate>) -> Result<u32, DownloadError> {
    let value = match bitrate {
        None => return Ok(DEFAULT_BITRATE_KBPS),
        Some(Bitrate::Number(value)) => u32::try_from(*value).ok(),
        Some(Bitrate::Text(text)) => text
            .trim()
            .trim_end_matches(['k', 'K'])
            .parse::<u32>()
            .ok(),
    };
    match value {
        Some(kbps) if (MIN_BITRATE_KBPS..=MAX_BITRATE_KBPS).contains(&kbps) => Ok(kbps),
        _ => Err(DownloadError::InvalidRequest(format!(
            "Bitrate must be between {MIN_BITRATE_KBPS} and {MAX_BITRATE_KBPS} kbps."
        ))),
    }
}

/// Title, thumbnail and estimated size for a URL.
pub async fn video_info(
    State(state): State<AppState>,
    Json(payload): Json<VideoInfoRequest>,
) -> ApiResult<Json<VideoInfoResponse>> {
    let request = admit(
        payload.url.as_deref(),
        payload.format.as_deref(),
        payload.quality.as_deref(),
        None,
        "Invalid YouTube URL.",
    )?;
    let settings = &state.settings;
    settings.toolchain.require(Container::Mp4)?;

    let metadata = fetch_metadata(&settings.toolchain.ytdlp, &request.url, settings.metadata_timeout).await?;
    let selection = select(&request.selection, &metadata.streams);

    Ok(Json(VideoInfoResponse {
        title: metadata.title,
        thumbnail_url: metadata.thumbnail_url,
        estimated_size: format_bytes(selection.estimated_size_bytes),
    }))
}

/// Streams the requested rendition as an attachment.
pub async fn download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<Response> {
    let request = admit(
        payload.url.as_deref(),
        payload.format.as_deref(),
        payload.quality.as_deref(),
        payload.bitrate.as_ref(),
        "Please provide a valid YouTube URL.",
    )?;
    let settings = &state.settings;
    let SelectionRequest {
        container, quality, ..
    } = request.selection;
    settings.toolchain.require(container)?;

    let metadata = fetch_metadata(&settings.toolchain.ytdlp, &request.url, settings.metadata_timeout).await?;
    let safe_title = sanitize_filename(&metadata.title);
    let filename = attachment_filename(&safe_title, container, quality);
    let ticket = state
        .ledger
        .begin(&format!("{} {}", container.extension(), request.url));

    let (download_id, body) = if container.is_audio() {
        let job = AudioJob {
            ytdlp: &settings.toolchain.ytdlp,
            ffmpeg: &settings.toolchain.ffmpeg,
            url: &request.url,
            safe_title: &safe_title,
            bitrate_kbps: request.selection.audio_bitrate_kbps,
            temp_root: &settings.temp_dir,
            timeout: settings.transfer_timeout,
        };
        let transfer = AudioTransfer::prepare(job, ticket).await?;
        (
            transfer.download_id().to_string(),
            Body::from_stream(transfer.into_stream()),
        )
    } else {
        let selection = select(&request.selection, &metadata.streams);
        let invocation = Invocation::pipe(
            &settings.toolchain.ytdlp,
            &request.url,
            &selection.format_expression,
            container,
        );
        let limits = TransferLimits {
            max_bytes: settings.max_bytes,
            timeout: settings.transfer_timeout,
        };
        let transfer = PipeTransfer::start(&invocation, limits, ticket).await?;
        (
            transfer.download_id().to_string(),
            Body::from_stream(transfer.into_stream()),
        )
    };

    info!(download_id = %download_id, filename = %filename, "streaming download");
    let headers = [
        (header::CONTENT_TYPE, header_value(&media_type(container))?),
        (header::CONTENT_DISPOSITION, header_value(&content_disposition(&filename))?),
        (HeaderName::from_static(DOWNLOAD_ID_HEADER), header_value(&download_id)?),
    ];
    Ok((headers, body).into_response())
}

/// How a download ended, or `running`.
pub async fn download_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<DownloadRecord>> {
    state
        .ledger
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("download not found"))
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|err| ApiError::internal(format!("invalid header value: {err}")))
}
