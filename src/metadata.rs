//! Metadata fetch: runs yt-dlp in `--dump-json` mode and turns its document
//! into the handful of fields stream selection needs.
//!
//! The raw structs mirror yt-dlp's `info.json` and leave every field optional,
//! because extractors differ in what they fill in. Only [`AssetMetadata`] and
//! [`SourceStream`] leave this module.

use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::{
    classify::{ExitReport, FailureKind, classify},
    error::DownloadError,
    process::{Invocation, Spawned, tail},
};

const DEFAULT_TITLE: &str = "video";

/// One rendition the host offers.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceStream {
    pub has_video: bool,
    pub has_audio: bool,
    pub height_pixels: Option<i64>,
    pub video_bitrate: Option<f64>,
    pub audio_bitrate: Option<f64>,
    pub container: Option<String>,
    /// Exact size when yt-dlp knows it, otherwise its approximation.
    pub size_bytes: Option<u64>,
}

impl SourceStream {
    pub fn height_or_zero(&self) -> i64 {
        self.height_pixels.unwrap_or(0)
    }
}

/// What one `--dump-json` run tells us about an asset.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetMetadata {
    pub title: String,
    pub thumbnail_url: Option<String>,
    pub streams: Vec<SourceStream>,
}

#[derive(Debug, Deserialize)]
struct InfoJson {
    title: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<FormatInfo>,
}

#[derive(Debug, Deserialize)]
struct FormatInfo {
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<f64>,
    vbr: Option<f64>,
    abr: Option<f64>,
    ext: Option<String>,
    filesize: Option<f64>,
    #[serde(rename = "filesize_approx")]
    filesize_approx: Option<f64>,
}

impl From<FormatInfo> for SourceStream {
    fn from(format: FormatInfo) -> Self {
        // yt-dlp spells a missing track as the string "none"; an absent field
        // means the codec is unknown, not missing.
        let present = |codec: &Option<String>| codec.as_deref() != Some("none");
        let size = |value: Option<f64>| value.filter(|bytes| *bytes > 0.0).map(|bytes| bytes as u64);

        Self {
            has_video: present(&format.vcodec),
            has_audio: present(&format.acodec),
            height_pixels: format.height.map(|height| height as i64),
            video_bitrate: format.vbr,
            audio_bitrate: format.abr,
            container: format.ext,
            size_bytes: size(format.filesize).or_else(|| size(format.filesize_approx)),
        }
    }
}

/// Parses a `--dump-json` document.
pub fn parse_metadata(raw: &[u8]) -> Result<AssetMetadata, serde_json::Error> {
    let info: InfoJson = serde_json::from_slice(raw)?;
    Ok(AssetMetadata {
        title: info
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
        thumbnail_url: info.thumbnail,
        streams: info.formats.into_iter().map(SourceStream::from).collect(),
    })
}

/// Runs yt-dlp against `url` and returns the parsed metadata.
///
/// `url` must already have passed [`crate::naming::is_supported_url`]. The run
/// is killed after `limit`.
pub async fn fetch_metadata(
    ytdlp: &std::path::Path,
    url: &str,
    limit: Duration,
) -> Result<AssetMetadata, DownloadError> {
    let Spawned {
        mut guard,
        stdout,
        diagnostics,
    } = Invocation::metadata(ytdlp, url).spawn()?;
    let mut stdout = stdout.ok_or_else(|| std::io::Error::other("child stdout was not captured"))?;

    let run = async {
        let mut document = Vec::new();
        stdout.read_to_end(&mut document).await?;
        let status = guard.wait().await?;
        Ok::<_, std::io::Error>((status, document))
    };
    let finished = tokio::time::timeout(limit, run).await;
    let (status, document) = match finished {
        Ok(result) => result?,
        Err(_) => {
            guard.terminate().await;
            warn!(url, limit_secs = limit.as_secs(), "metadata fetch timed out");
            return Err(DownloadError::Timeout(limit));
        }
    };
    let diagnostics = diagnostics.collect().await;

    let parsed = if status.success() {
        Some(parse_metadata(&document))
    } else {
        None
    };
    let kind = classify(ExitReport {
        success: status.success(),
        diagnostics: &diagnostics,
        output_parsed: matches!(parsed, Some(Ok(_))),
    });

    match (kind, parsed) {
        (FailureKind::Ok, Some(Ok(metadata))) => {
            info!(url, title = %metadata.title, streams = metadata.streams.len(), "fetched metadata");
            Ok(metadata)
        }
        (FailureKind::ParseFailure, Some(Err(err))) => {
            warn!(url, error = %err, "yt-dlp returned unparseable metadata");
            Err(DownloadError::ParseFailure("Could not parse video metadata.".into()))
        }
        (kind, _) => {
            warn!(url, ?kind, %status, stderr = tail(&diagnostics, 1000), "metadata fetch failed");
            Err(match kind {
                FailureKind::AgeRestricted => DownloadError::AgeRestricted,
                FailureKind::ParseFailure => {
                    DownloadError::ParseFailure("Could not parse video metadata.".into())
                }
                FailureKind::Ok | FailureKind::UpstreamFailure => DownloadError::UpstreamFailure(
                    "yt-dlp metadata error: Could not fetch video details.".into(),
                ),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubYtDlp;

    const SAMPLE: &str = r#"{
        "id": "abc",
        "title": "Sample Title",
        "thumbnail": "https://i.ytimg.com/vi/abc/hq.jpg",
        "formats": [
            {"format_id": "sb0", "vcodec": "none", "acodec": "none", "ext": "mhtml"},
            {"format_id": "140", "vcodec": "none", "acodec": "mp4a.40.2", "abr": 129.5, "ext": "m4a", "filesize": 3400000},
            {"format_id": "137", "vcodec": "avc1.640028", "acodec": "none", "height": 1080, "vbr": 4400.1, "ext": "mp4", "filesize_approx": 90000000},
            {"format_id": "18", "vcodec": "avc1.42001E", "acodec": "mp4a.40.2", "height": 360, "ext": "mp4", "filesize": 0, "filesize_approx": 12000000}
        ]
    }"#;

    #[test]
    fn parses_streams_and_codec_presence() {
        let metadata = parse_metadata(SAMPLE.as_bytes()).unwrap();
        assert_eq!(metadata.title, "Sample Title");
        assert_eq!(metadata.streams.len(), 4);

        let storyboard = &metadata.streams[0];
        assert!(!storyboard.has_video && !storyboard.has_audio);

        let audio = &metadata.streams[1];
        assert!(audio.has_audio && !audio.has_video);
        assert_eq!(audio.size_bytes, Some(3_400_000));

        let video = &metadata.streams[2];
        assert_eq!(video.height_pixels, Some(1080));
        assert_eq!(video.size_bytes, Some(90_000_000));

        // A zero exact size falls back to the approximation.
        assert_eq!(metadata.streams[3].size_bytes, Some(12_000_000));
    }

    #[test]
    fn missing_fields_use_defaults() {
        let metadata = parse_metadata(br#"{"formats": [{"format_id": "x"}]}"#).unwrap();
        assert_eq!(metadata.title, "video");
        assert!(metadata.thumbnail_url.is_none());
        // Unknown codecs count as present.
        assert!(metadata.streams[0].has_video && metadata.streams[0].has_audio);
    }

    #[tokio::test]
    async fn fetch_returns_parsed_document() {
        let stub = StubYtDlp::new(&format!("cat <<'JSON'\n{SAMPLE}\nJSON\n"));
        let metadata = fetch_metadata(stub.path(), "https://youtu.be/abc", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(metadata.thumbnail_url.as_deref(), Some("https://i.ytimg.com/vi/abc/hq.jpg"));
        assert!(stub.arguments().contains("--dump-json"));
        assert!(stub.arguments().contains("--no-playlist"));
    }

    #[tokio::test]
    async fn fetch_maps_age_restriction() {
        let stub = StubYtDlp::new(
            "echo 'ERROR: [youtube] abc: Sign in to confirm your age' >&2\nexit 1\n",
        );
        let err = fetch_metadata(stub.path(), "https://youtu.be/abc", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::AgeRestricted));
    }

    #[tokio::test]
    async fn fetch_maps_other_failures_to_upstream() {
        let stub = StubYtDlp::new("echo 'ERROR: Video unavailable' >&2\nexit 1\n");
        let err = fetch_metadata(stub.path(), "https://youtu.be/abc", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::UpstreamFailure(_)));
    }

    #[tokio::test]
    async fn fetch_reports_unparseable_output() {
        let stub = StubYtDlp::new("echo 'not json'\n");
        let err = fetch_metadata(stub.path(), "https://youtu.be/abc", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::ParseFailure(_)));
    }

    #[tokio::test]
    async fn fetch_times_out_and_kills_the_process() {
        let stub = StubYtDlp::new("echo $$ > \"$STUB_DIR/pid\"\nexec sleep 30\n");
        let err = fetch_metadata(stub.path(), "https://youtu.be/abc", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Timeout(_)));
        assert!(!stub.recorded_process_alive());
    }
}
