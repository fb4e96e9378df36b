#![forbid(unsafe_code)]

//! Download proxy core for YouTube links.
//!
//! Requests are validated, yt-dlp is asked for metadata, a rendition is
//! picked, and the bytes are streamed back as an attachment. mp4/webm pipe
//! straight from yt-dlp's stdout; mp3 goes through a scratch file so ffmpeg
//! can embed cover art and tags.

pub mod audio;
pub mod classify;
pub mod config;
pub mod error;
pub mod format;
pub mod ledger;
pub mod metadata;
pub mod naming;
pub mod preflight;
pub mod process;
pub mod server;
pub mod stream;

#[cfg(test)]
mod test_support;
