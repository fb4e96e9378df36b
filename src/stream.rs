//! Direct-pipe transfers (mp4/webm): yt-dlp writes media to stdout and the
//! bytes are relayed to the HTTP body as they arrive.
//!
//! Headers wait for the first chunk. If yt-dlp exits before producing any
//! data, its failure is classified and returned as an ordinary error, so the
//! handler can still answer 403/502. After that, a fatal exit can only cut the
//! body short: the stream yields an `Err`, the connection is aborted instead
//! of closed cleanly, and the ledger records why.
//!
//! The size ceiling is enforced on whole 64 KiB chunks. The chunk that would
//! cross it is dropped, yt-dlp is killed, and the body ends cleanly.

use std::{io, time::Duration};

use axum::body::Bytes;
use futures_util::{Stream, stream};
use tokio::{
    io::AsyncReadExt,
    process::ChildStdout,
    sync::mpsc,
    time::{Instant, timeout_at},
};
use tracing::debug;

use crate::{
    classify::{FailureKind, classify_transfer},
    error::DownloadError,
    ledger::{DownloadTicket, Outcome},
    process::{Diagnostics, Invocation, ProcessGuard, Spawned, tail},
};

pub const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the reader task and the HTTP body.
const CHANNEL_DEPTH: usize = 4;

/// How much stderr goes into logs and ledger details.
const DETAIL_CHARS: usize = 1000;

pub type BodyChunk = Result<Bytes, io::Error>;

#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    pub max_bytes: u64,
    pub timeout: Duration,
}

/// A transfer whose first chunk has arrived and whose headers may be sent.
pub struct PipeTransfer {
    download_id: String,
    receiver: mpsc::Receiver<BodyChunk>,
}

impl PipeTransfer {
    /// Spawns `invocation` and waits for its first chunk or its exit.
    pub async fn start(
        invocation: &Invocation,
        limits: TransferLimits,
        ticket: DownloadTicket,
    ) -> Result<Self, DownloadError> {
        let Spawned {
            guard,
            stdout,
            diagnostics,
        } = match invocation.spawn() {
            Ok(spawned) => spawned,
            Err(err) => return Err(ticket.reject(err.into())),
        };
        let Some(stdout) = stdout else {
            let err = io::Error::other("child stdout was not captured");
            return Err(ticket.reject(err.into()));
        };
        let download_id = ticket.id().to_string();

        let mut session = StreamSession {
            guard,
            stdout,
            diagnostics: Some(diagnostics),
            ticket,
            max_bytes: limits.max_bytes,
            timeout: limits.timeout,
            deadline: Instant::now() + limits.timeout,
        };

        let (sender, receiver) = mpsc::channel(CHANNEL_DEPTH);
        match session.read_chunk().await {
            Ok(Some(first)) => {
                tokio::spawn(session.pump(first, sender));
            }
            Ok(None) => match session.exit_kind().await {
                Ok((kind, _)) if !kind.is_fatal() => session.ticket.resolve(Outcome::Completed),
                Ok((kind, diagnostics)) => {
                    let detail = tail(&diagnostics, DETAIL_CHARS).to_string();
                    session.ticket.resolve(Outcome::Failed {
                        kind,
                        detail: detail.clone(),
                    });
                    return Err(DownloadError::from_kind(kind, "Failed to download video.")
                        .unwrap_or(DownloadError::UpstreamFailure(detail)));
                }
                Err(fault) => return Err(session.abandon(fault).await),
            },
            Err(fault) => return Err(session.abandon(fault).await),
        }

        Ok(Self {
            download_id,
            receiver,
        })
    }

    pub fn download_id(&self) -> &str {
        &self.download_id
    }

    /// The body stream. Dropping it cancels the transfer and kills yt-dlp.
    pub fn into_stream(self) -> impl Stream<Item = BodyChunk> + Send + 'static {
        stream::unfold(self.receiver, |mut receiver| async move {
            receiver.recv().await.map(|chunk| (chunk, receiver))
        })
    }
}

enum Fault {
    TimedOut,
    Io(io::Error),
}

/// One in-flight transfer. Owns the child; whatever path leaves the session
/// also ends the process.
struct StreamSession {
    guard: ProcessGuard,
    stdout: ChildStdout,
    diagnostics: Option<Diagnostics>,
    ticket: DownloadTicket,
    max_bytes: u64,
    timeout: Duration,
    deadline: Instant,
}

impl StreamSession {
    /// Next full chunk, or a shorter final one; `None` at end of output.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, Fault> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;
        let stdout = &mut self.stdout;
        let fill = async {
            while filled < CHUNK_SIZE {
                let read = stdout.read(&mut buf[filled..]).await?;
                if read == 0 {
                    break;
                }
                filled += read;
            }
            Ok::<_, io::Error>(())
        };
        match timeout_at(self.deadline, fill).await {
            Err(_) => return Err(Fault::TimedOut),
            Ok(Err(err)) => return Err(Fault::Io(err)),
            Ok(Ok(())) => {}
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(Bytes::from(buf)))
    }

    /// Waits for exit and classifies it together with the captured stderr.
    async fn exit_kind(&mut self) -> Result<(FailureKind, String), Fault> {
        let status = match timeout_at(self.deadline, self.guard.wait()).await {
            Err(_) => return Err(Fault::TimedOut),
            Ok(result) => result.map_err(Fault::Io)?,
        };
        let diagnostics = match self.diagnostics.take() {
            Some(diagnostics) => timeout_at(self.deadline, diagnostics.collect())
                .await
                .unwrap_or_default(),
            None => String::new(),
        };
        debug!(download_id = self.ticket.id(), %status, "yt-dlp exited");
        Ok((classify_transfer(status.success(), &diagnostics), diagnostics))
    }

    /// Kills the process and settles the ticket for a fault seen before any
    /// byte was sent.
    async fn abandon(mut self, fault: Fault) -> DownloadError {
        self.guard.terminate().await;
        let err = match fault {
            Fault::TimedOut => DownloadError::Timeout(self.timeout),
            Fault::Io(err) => DownloadError::Io(err),
        };
        self.ticket.reject(err)
    }

    /// Relays chunks until end of output, the ceiling, a fault, or the body
    /// being dropped.
    async fn pump(mut self, first: Bytes, sender: mpsc::Sender<BodyChunk>) {
        let mut pending = Some(first);
        loop {
            let chunk = match pending.take() {
                Some(chunk) => chunk,
                None => {
                    let next = tokio::select! {
                        next = self.read_chunk() => next,
                        _ = sender.closed() => return self.cancel().await,
                    };
                    match next {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => break,
                        Err(fault) => return self.fail_fault(fault, &sender).await,
                    }
                }
            };

            let len = chunk.len() as u64;
            if self.ticket.bytes() + len > self.max_bytes {
                self.guard.terminate().await;
                self.ticket.resolve(Outcome::Truncated);
                return;
            }
            if sender.send(Ok(chunk)).await.is_err() {
                return self.cancel().await;
            }
            self.ticket.add_bytes(len);
        }

        match self.exit_kind().await {
            Ok((kind, _)) if !kind.is_fatal() => self.ticket.resolve(Outcome::Completed),
            Ok((kind, diagnostics)) => {
                let detail = tail(&diagnostics, DETAIL_CHARS).to_string();
                self.fail(kind, detail, &sender).await;
            }
            Err(fault) => self.fail_fault(fault, &sender).await,
        }
    }

    async fn cancel(mut self) {
        self.guard.terminate().await;
        self.ticket.resolve(Outcome::Cancelled);
    }

    async fn fail_fault(self, fault: Fault, sender: &mpsc::Sender<BodyChunk>) {
        let detail = match fault {
            Fault::TimedOut => DownloadError::Timeout(self.timeout).to_string(),
            Fault::Io(err) => format!("reading yt-dlp output failed: {err}"),
        };
        self.fail(FailureKind::UpstreamFailure, detail, sender).await;
    }

    /// Aborts a body that has already started.
    async fn fail(mut self, kind: FailureKind, detail: String, sender: &mpsc::Sender<BodyChunk>) {
        self.guard.terminate().await;
        let _ = sender
            .send(Err(io::Error::other(format!("download aborted: {kind:?}"))))
            .await;
        self.ticket.resolve(Outcome::Failed { kind, detail });
    }
}
