//! Maps yt-dlp's exit status and stderr text onto a small set of causes.
//!
//! yt-dlp has no machine-readable error channel, so this is substring matching
//! against its current wording. Callers only see [`FailureKind`]; when the
//! wording changes, only the marker lists below need to move.

use serde::Serialize;

/// Case-sensitive stderr markers that mean the host demands an age check.
const AGE_RESTRICTION_MARKERS: &[&str] = &["age-restricted", "Sign in to confirm your age"];

/// Emitted by the merge step on piped output. Harmless even with a non-zero exit.
const BENIGN_WARNING_MARKERS: &[&str] = &["does not start with a start code"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Ok,
    AgeRestricted,
    UpstreamFailure,
    ParseFailure,
}

impl FailureKind {
    pub fn is_fatal(self) -> bool {
        self != Self::Ok
    }
}

/// What is known about a finished process.
#[derive(Debug, Clone, Copy)]
pub struct ExitReport<'a> {
    pub success: bool,
    pub diagnostics: &'a str,
    /// Whether stdout held a document that parsed. Only meaningful on success.
    pub output_parsed: bool,
}

pub fn classify(report: ExitReport<'_>) -> FailureKind {
    if is_age_restricted(report.diagnostics) {
        return FailureKind::AgeRestricted;
    }
    if !report.success {
        return FailureKind::UpstreamFailure;
    }
    if !report.output_parsed {
        return FailureKind::ParseFailure;
    }
    FailureKind::Ok
}

/// Classification for processes whose stdout is media rather than a document.
/// Diagnostics only matter after a non-zero exit, and a non-zero exit carrying
/// only a benign warning is not a failure.
pub fn classify_transfer(success: bool, diagnostics: &str) -> FailureKind {
    if success {
        return FailureKind::Ok;
    }
    let kind = classify(ExitReport {
        success,
        diagnostics,
        output_parsed: true,
    });
    if kind == FailureKind::UpstreamFailure && is_benign_warning(diagnostics) {
        return FailureKind::Ok;
    }
    kind
}

pub fn is_age_restricted(diagnostics: &str) -> bool {
    AGE_RESTRICTION_MARKERS
        .iter()
        .any(|marker| diagnostics.contains(marker))
}

pub fn is_benign_warning(diagnostics: &str) -> bool {
    BENIGN_WARNING_MARKERS
        .iter()
        .any(|marker| diagnostics.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(success: bool, diagnostics: &str, output_parsed: bool) -> ExitReport<'_> {
        ExitReport {
            success,
            diagnostics,
            output_parsed,
        }
    }

    #[test]
    fn age_markers_win_regardless_of_status() {
        for text in [
            "ERROR: [youtube] abc: Sign in to confirm your age. This video may be inappropriate",
            "ERROR: this video is age-restricted",
        ] {
            assert_eq!(classify(report(false, text, false)), FailureKind::AgeRestricted);
            assert_eq!(classify(report(true, text, true)), FailureKind::AgeRestricted);
        }
    }

    #[test]
    fn markers_are_case_sensitive() {
        assert_eq!(
            classify(report(false, "SIGN IN TO CONFIRM YOUR AGE", false)),
            FailureKind::UpstreamFailure
        );
    }

    #[test]
    fn nonzero_exit_is_upstream_failure() {
        assert_eq!(
            classify(report(false, "ERROR: Video unavailable", true)),
            FailureKind::UpstreamFailure
        );
    }

    #[test]
    fn clean_exit_with_bad_document_is_parse_failure() {
        assert_eq!(classify(report(true, "", false)), FailureKind::ParseFailure);
        assert_eq!(classify(report(true, "", true)), FailureKind::Ok);
    }

    #[test]
    fn benign_merge_warning_is_not_fatal_for_transfers() {
        let text = "[mp4 @ 0x1] Packet does not start with a start code";
        assert_eq!(classify_transfer(false, text), FailureKind::Ok);
        assert_eq!(
            classify_transfer(false, "ERROR: unable to download"),
            FailureKind::UpstreamFailure
        );
        assert!(classify_transfer(false, "ERROR: age-restricted").is_fatal());
    }

    #[test]
    fn clean_transfer_exit_ignores_stderr_markers() {
        let text = "WARNING: [youtube] abc: age-restricted video, using workaround";
        assert_eq!(classify_transfer(true, text), FailureKind::Ok);
        assert_eq!(classify_transfer(false, text), FailureKind::AgeRestricted);
        // Documents still go through the full check.
        assert_eq!(classify(report(true, text, true)), FailureKind::AgeRestricted);
    }
}
