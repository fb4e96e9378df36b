//! mp3 extraction. yt-dlp cannot embed a thumbnail and tags while writing to
//! a pipe, so this path runs it to completion into a per-request scratch
//! directory and then serves the finished file.
//!
//! Failures are known before the response starts and come back as ordinary
//! errors. The scratch directory belongs to the body stream and is removed
//! when the stream is dropped, however the response ends.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use axum::body::Bytes;
use futures_util::{Stream, StreamExt, stream};
use tempfile::TempDir;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    classify::{FailureKind, classify_transfer},
    error::DownloadError,
    ledger::{DownloadTicket, Outcome},
    process::{Invocation, Spawned, tail},
    stream::CHUNK_SIZE,
};

/// Unique directory for one request, deleted on drop.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl ScratchDir {
    /// Creates `<root>/<safe_title>_<random>/`.
    pub fn create(root: &Path, safe_title: &str) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{safe_title}_"))
            .tempdir_in(root)?;
        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            match dir.close() {
                Ok(()) => debug!(path = %self.path.display(), "removed scratch directory"),
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "failed to remove scratch directory")
                }
            }
        }
    }
}

/// Where yt-dlp lives and how long it may run.
#[derive(Debug, Clone)]
pub struct AudioJob<'a> {
    pub ytdlp: &'a Path,
    pub ffmpeg: &'a Path,
    pub url: &'a str,
    pub safe_title: &'a str,
    pub bitrate_kbps: u32,
    pub temp_root: &'a Path,
    pub timeout: Duration,
}

/// A finished mp3 ready to be streamed.
pub struct AudioTransfer {
    file: File,
    scratch: ScratchDir,
    ticket: DownloadTicket,
}

impl AudioTransfer {
    /// Runs the extraction and opens its output.
    pub async fn prepare(job: AudioJob<'_>, ticket: DownloadTicket) -> Result<Self, DownloadError> {
        let scratch = match ScratchDir::create(job.temp_root, job.safe_title) {
            Ok(scratch) => scratch,
            Err(err) => {
                warn!(root = %job.temp_root.display(), error = %err, "cannot create scratch directory");
                return Err(ticket.reject(err.into()));
            }
        };
        let template = scratch.path().join(format!("{}.%(ext)s", job.safe_title));
        let output = scratch.path().join(format!("{}.mp3", job.safe_title));

        let invocation = Invocation::audio(job.ytdlp, job.ffmpeg, job.url, job.bitrate_kbps, &template);
        let Spawned {
            mut guard,
            diagnostics,
            ..
        } = match invocation.spawn() {
            Ok(spawned) => spawned,
            Err(err) => return Err(ticket.reject(err.into())),
        };

        let finished = tokio::time::timeout(job.timeout, guard.wait()).await;
        let status = match finished {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return Err(ticket.reject(err.into())),
            Err(_) => {
                guard.terminate().await;
                return Err(ticket.reject(DownloadError::Timeout(job.timeout)));
            }
        };
        let diagnostics = diagnostics.collect().await;

        let produced = tokio::fs::try_exists(&output).await.unwrap_or(false);
        if !status.success() || !produced {
            let kind = match classify_transfer(status.success(), &diagnostics) {
                FailureKind::AgeRestricted => FailureKind::AgeRestricted,
                _ => FailureKind::UpstreamFailure,
            };
            warn!(url = job.url, %status, produced, stderr = tail(&diagnostics, 1000), "mp3 extraction failed");
            ticket.resolve(Outcome::Failed {
                kind,
                detail: tail(&diagnostics, 1000).to_string(),
            });
            return Err(match kind {
                FailureKind::AgeRestricted => DownloadError::AgeRestricted,
                _ => DownloadError::UpstreamFailure("Failed to create MP3 file.".into()),
            });
        }

        let file = match File::open(&output).await {
            Ok(file) => file,
            Err(err) => return Err(ticket.reject(err.into())),
        };
        info!(url = job.url, path = %output.display(), "mp3 ready");
        Ok(Self {
            file,
            scratch,
            ticket,
        })
    }

    pub fn download_id(&self) -> &str {
        self.ticket.id()
    }

    /// Reads the file front to back. The scratch directory goes away when
    /// the stream is finished or dropped.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        let state = FileBody {
            reader: ReaderStream::with_capacity(self.file, CHUNK_SIZE),
            ticket: Some(self.ticket),
            _scratch: self.scratch,
        };
        stream::unfold(state, |mut state| async move {
            match state.reader.next().await {
                Some(Ok(chunk)) => {
                    if let Some(ticket) = state.ticket.as_mut() {
                        ticket.add_bytes(chunk.len() as u64);
                    }
                    Some((Ok(chunk), state))
                }
                Some(Err(err)) => {
                    if let Some(ticket) = state.ticket.take() {
                        ticket.resolve(Outcome::Failed {
                            kind: FailureKind::UpstreamFailure,
                            detail: format!("reading extracted file failed: {err}"),
                        });
                    }
                    Some((Err(err), state))
                }
                None => {
                    if let Some(ticket) = state.ticket.take() {
                        ticket.resolve(Outcome::Completed);
                    }
                    None
                }
            }
        })
    }
}

/// Field order matters: the file closes before its directory is removed.
struct FileBody {
    reader: ReaderStream<File>,
    ticket: Option<DownloadTicket>,
    _scratch: ScratchDir,
}

/// Removes entries directly under `root` older than `max_age`. Catches
/// scratch directories left behind by a crash. Returns how many went.
pub fn sweep_stale(root: &Path, max_age: Duration) -> usize {
    if !root.exists() {
        return 0;
    }
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable scratch entry");
                continue;
            }
        };
        let age = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }
        let result = if entry.file_type().is_dir() {
            fs::remove_dir_all(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        match result {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %entry.path().display(), error = %err, "failed to remove stale scratch entry"),
        }
    }
    if removed > 0 {
        info!(root = %root.display(), removed, "swept stale scratch entries");
    }
    removed
}
