//! Failure taxonomy shared by the fetcher, the orchestrator and the HTTP layer.

use std::{io, time::Duration};

use axum::http::StatusCode;
use thiserror::Error;

use crate::classify::FailureKind;

/// Everything that can stop a preview or a download before its body starts.
///
/// Once bytes have been sent the same causes can only end the body early, so
/// they are logged and written to the ledger instead of being returned.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Bad or missing request input. Nothing was spawned.
    #[error("{0}")]
    InvalidRequest(String),

    /// A required external tool is not installed.
    #[error("{name} not found. {hint}")]
    BinaryMissing { name: String, hint: String },

    #[error("This video is age-restricted and cannot be downloaded.")]
    AgeRestricted,

    /// The extraction engine exited non-zero for any other reason.
    #[error("{0}")]
    UpstreamFailure(String),

    /// The engine succeeded but its metadata document was unreadable.
    #[error("{0}")]
    ParseFailure(String),

    #[error("yt-dlp did not finish within {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DownloadError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::BinaryMissing { .. } | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::AgeRestricted => StatusCode::FORBIDDEN,
            Self::UpstreamFailure(_) | Self::ParseFailure(_) | Self::Timeout(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// Builds the error for a classified failure, using `upstream` as the
    /// message when the cause is not more specific.
    pub fn from_kind(kind: FailureKind, upstream: impl Into<String>) -> Option<Self> {
        match kind {
            FailureKind::Ok => None,
            FailureKind::AgeRestricted => Some(Self::AgeRestricted),
            FailureKind::UpstreamFailure => Some(Self::UpstreamFailure(upstream.into())),
            FailureKind::ParseFailure => {
                Some(Self::ParseFailure("Could not parse video metadata.".into()))
            }
        }
    }

    /// Semantic kind recorded in the download ledger.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::AgeRestricted => Some(FailureKind::AgeRestricted),
            Self::UpstreamFailure(_) | Self::Timeout(_) => Some(FailureKind::UpstreamFailure),
            Self::ParseFailure(_) => Some(FailureKind::ParseFailure),
            _ => None,
        }
    }
}
