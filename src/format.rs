//! Pure stream selection: picks the renditions yt-dlp would fetch for a
//! request, builds the `-f` expression, and estimates the transfer size.

use std::{fmt, str::FromStr};

use crate::metadata::SourceStream;

/// Height used for `Quality::Best`, above anything a host offers.
const UNBOUNDED_HEIGHT: i64 = 10_000;

const SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Output container family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Mp4,
    Webm,
    Mp3,
}

impl Container {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::Mp3 => "mp3",
        }
    }

    pub fn is_audio(self) -> bool {
        self == Self::Mp3
    }
}

impl FromStr for Container {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" => Ok(Self::Mp4),
            "webm" => Ok(Self::Webm),
            "mp3" => Ok(Self::Mp3),
            other => Err(format!("Unsupported format '{other}'; expected mp4, webm or mp3.")),
        }
    }
}

/// Upper bound on the video height the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Best,
    Height(u32),
}

impl Quality {
    fn ceiling(self) -> i64 {
        match self {
            Self::Best => UNBOUNDED_HEIGHT,
            Self::Height(height) => i64::from(height),
        }
    }

    /// `[height<=N]` filter clause, empty for `Best`.
    fn filter_clause(self) -> String {
        match self {
            Self::Best => String::new(),
            Self::Height(height) => format!("[height<={height}]"),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Best => f.write_str("best"),
            Self::Height(height) => write!(f, "{height}p"),
        }
    }
}

impl FromStr for Quality {
    type Err = String;

    /// Accepts `best`, `720p` or `720`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("best") {
            return Ok(Self::Best);
        }
        let digits = trimmed
            .strip_suffix('p')
            .or_else(|| trimmed.strip_suffix('P'))
            .unwrap_or(trimmed);
        match digits.parse::<u32>() {
            Ok(height) if height > 0 => Ok(Self::Height(height)),
            _ => Err(format!("Unsupported quality '{trimmed}'; expected 'best' or e.g. '720p'.")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRequest {
    pub container: Container,
    pub quality: Quality,
    /// Target bitrate in kbit/s. Only used for mp3.
    pub audio_bitrate_kbps: u32,
}

/// Indices into the stream list that the selection settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamChoice {
    /// Silent video plus a separate audio-only stream, merged by yt-dlp.
    Separate { video: usize, audio: usize },
    Combined(usize),
    Audio(usize),
    /// Nothing eligible. yt-dlp still gets an expression with a final `best`.
    Nothing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionResult {
    pub format_expression: String,
    pub estimated_size_bytes: Option<u64>,
    pub choice: StreamChoice,
}

/// The `-f` expression for a container/quality pair.
///
/// Each expression ends in a fallback that yt-dlp can always satisfy.
pub fn format_expression(container: Container, quality: Quality) -> String {
    let height = quality.filter_clause();
    match container {
        Container::Mp4 => {
            format!("bestvideo[vcodec^=avc1]{height}+bestaudio[ext=m4a]/best[ext=mp4]{height}/best")
        }
        Container::Webm => {
            format!("bestvideo[ext=webm]{height}+bestaudio[ext=webm]/best[ext=webm]{height}/best")
        }
        Container::Mp3 => "bestaudio/best".to_string(),
    }
}

pub fn select(request: &SelectionRequest, streams: &[SourceStream]) -> SelectionResult {
    let format_expression = format_expression(request.container, request.quality);
    let (choice, estimated_size_bytes) = match request.container {
        Container::Mp3 => match best_audio(streams) {
            Some(index) => (StreamChoice::Audio(index), streams[index].size_bytes),
            None => (StreamChoice::Nothing, None),
        },
        Container::Mp4 | Container::Webm => select_video(request.quality.ceiling(), streams),
    };

    SelectionResult {
        format_expression,
        estimated_size_bytes,
        choice,
    }
}

fn select_video(ceiling: i64, streams: &[SourceStream]) -> (StreamChoice, Option<u64>) {
    let video = first_max_by(
        streams,
        |stream| stream.has_video && !stream.has_audio && stream.height_or_zero() <= ceiling,
        video_rank,
    );
    let audio = best_audio(streams);

    if let (Some(video), Some(audio)) = (video, audio) {
        // An unknown half counts as zero, so this is a lower bound.
        let total = streams[video].size_bytes.unwrap_or(0) + streams[audio].size_bytes.unwrap_or(0);
        return (StreamChoice::Separate { video, audio }, Some(total));
    }

    let combined = first_max_by(
        streams,
        |stream| stream.has_video && stream.has_audio && stream.height_or_zero() <= ceiling,
        video_rank,
    );
    match combined {
        Some(index) => (StreamChoice::Combined(index), streams[index].size_bytes),
        None => (StreamChoice::Nothing, None),
    }
}

fn best_audio(streams: &[SourceStream]) -> Option<usize> {
    first_max_by(
        streams,
        |stream| stream.has_audio && !stream.has_video,
        |stream| (0, stream.audio_bitrate.unwrap_or(0.0)),
    )
}

fn video_rank(stream: &SourceStream) -> (i64, f64) {
    (stream.height_or_zero(), stream.video_bitrate.unwrap_or(0.0))
}

/// Index of the first stream with the greatest rank among those passing
/// `eligible`. Later streams must rank strictly higher to replace it.
fn first_max_by<F, R>(streams: &[SourceStream], eligible: F, rank: R) -> Option<usize>
where
    F: Fn(&SourceStream) -> bool,
    R: Fn(&SourceStream) -> (i64, f64),
{
    streams
        .iter()
        .enumerate()
        .filter(|(_, stream)| eligible(stream))
        .map(|(index, stream)| (index, rank(stream)))
        .reduce(|best, candidate| {
            let ordering = candidate
                .1
                .0
                .cmp(&best.1.0)
                .then(candidate.1.1.total_cmp(&best.1.1));
            if ordering.is_gt() { candidate } else { best }
        })
        .map(|(index, _)| index)
}

/// Renders a byte count with base-1024 units and two decimals; `None` is
/// `N/A`.
pub fn format_bytes(size: Option<u64>) -> String {
    let Some(size) = size else {
        return "N/A".to_string();
    };
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", SIZE_UNITS[unit])
}
