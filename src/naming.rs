//! URL admission and the names/media types put on responses.

use std::sync::LazyLock;

use regex::Regex;

use crate::format::{Container, Quality};

static SUPPORTED_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(https?://)?(www\.)?(youtube\.com|youtu\.be)/").expect("url pattern is valid")
});
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));
static DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.-]").expect("filename pattern is valid"));

const FALLBACK_FILENAME: &str = "download";

/// True for youtube.com and youtu.be links, scheme and `www.` optional.
pub fn is_supported_url(url: Option<&str>) -> bool {
    url.is_some_and(|url| SUPPORTED_URL.is_match(url.trim()))
}

/// Filesystem and header safe version of a title.
pub fn sanitize_filename(name: &str) -> String {
    let underscored = WHITESPACE.replace_all(name, "_");
    let stripped = DISALLOWED.replace_all(&underscored, "");
    let trimmed = stripped.trim_matches(|c| matches!(c, '_' | '.' | '-'));
    if trimmed.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Attachment name for a sanitized title. Video names carry the requested
/// quality unless it was `best`.
pub fn attachment_filename(safe_title: &str, container: Container, quality: Quality) -> String {
    let ext = container.extension();
    match (container, quality) {
        (Container::Mp3, _) | (_, Quality::Best) => format!("{safe_title}.{ext}"),
        (_, quality) => format!("{safe_title}-{quality}.{ext}"),
    }
}

pub fn content_disposition(filename: &str) -> String {
    format!("attachment; filename=\"{filename}\"")
}

/// `video/mp4`, `video/webm` or `audio/mpeg`.
pub fn media_type(container: Container) -> String {
    mime_guess::from_ext(container.extension())
        .first_or_octet_stream()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_youtube_hosts_only() {
        for url in [
            "https://www.youtube.com/watch?v=abc",
            "http://youtube.com/watch?v=abc",
            "youtu.be/abc",
            "  HTTPS://WWW.YOUTUBE.COM/watch?v=abc  ",
        ] {
            assert!(is_supported_url(Some(url)), "{url}");
        }
        for url in [
            "https://vimeo.com/123",
            "",
            "https://youtube.com.evil.example/x",
            "https://m.youtube.com/watch?v=abc",
            "ftp://youtube.com/x",
        ] {
            assert!(!is_supported_url(Some(url)), "{url}");
        }
        assert!(!is_supported_url(None));
    }

    #[test]
    fn sanitize_strips_rather_than_replaces() {
        assert_eq!(sanitize_filename("My Video!! (2023).mp4"), "My_Video_2023.mp4");
        assert_eq!(sanitize_filename("  tabs\tand\nnewlines  "), "tabs_and_newlines");
        assert_eq!(sanitize_filename("...--__"), "download");
        assert_eq!(sanitize_filename("日本語"), "download");
        assert_eq!(sanitize_filename("-.Edge_Case.-"), "Edge_Case");
    }

    #[test]
    fn attachment_names_and_media_types() {
        assert_eq!(
            attachment_filename("Clip", Container::Mp4, Quality::Best),
            "Clip.mp4"
        );
        assert_eq!(
            attachment_filename("Clip", Container::Webm, Quality::Height(720)),
            "Clip-720p.webm"
        );
        assert_eq!(
            attachment_filename("Clip", Container::Mp3, Quality::Height(720)),
            "Clip.mp3"
        );
        assert_eq!(content_disposition("Clip.mp4"), "attachment; filename=\"Clip.mp4\"");
        assert_eq!(media_type(Container::Mp4), "video/mp4");
        assert_eq!(media_type(Container::Webm), "video/webm");
        assert_eq!(media_type(Container::Mp3), "audio/mpeg");
    }
}
