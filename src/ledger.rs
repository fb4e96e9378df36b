//! In-memory record of how each download ended.
//!
//! Headers are committed before a transfer's fate is known, so a short body
//! alone cannot tell the client whether it hit the size ceiling or a yt-dlp
//! failure. Every response carries an id; clients can poll the outcome here.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{classify::FailureKind, error::DownloadError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Running,
    Completed,
    Truncated,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadRecord {
    pub id: String,
    pub state: DownloadState,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// How a transfer ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Truncated,
    Failed { kind: FailureKind, detail: String },
    Cancelled,
}

#[derive(Default)]
struct Records {
    by_id: HashMap<String, DownloadRecord>,
    order: VecDeque<String>,
}

pub struct DownloadLedger {
    records: Mutex<Records>,
    capacity: usize,
    sequence: AtomicU64,
}

impl DownloadLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(Records::default()),
            capacity: capacity.max(1),
            sequence: AtomicU64::new(0),
        }
    }

    /// Registers a running download. The ticket settles the record when it
    /// is resolved, or as cancelled when dropped unresolved.
    pub fn begin(self: &Arc<Self>, label: &str) -> DownloadTicket {
        let started_at = Utc::now();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let id = format!("{:x}-{sequence:x}", started_at.timestamp_millis());

        let mut records = self.records.lock();
        while records.order.len() >= self.capacity {
            if let Some(oldest) = records.order.pop_front() {
                records.by_id.remove(&oldest);
            }
        }
        records.order.push_back(id.clone());
        records.by_id.insert(
            id.clone(),
            DownloadRecord {
                id: id.clone(),
                state: DownloadState::Running,
                bytes: 0,
                kind: None,
                detail: None,
                started_at,
                finished_at: None,
            },
        );
        drop(records);

        info!(download_id = %id, label, "download started");
        DownloadTicket {
            ledger: Arc::clone(self),
            id,
            bytes: 0,
            resolved: false,
        }
    }

    pub fn get(&self, id: &str) -> Option<DownloadRecord> {
        self.records.lock().by_id.get(id).cloned()
    }

    fn settle(&self, id: &str, bytes: u64, outcome: Outcome) {
        let mut records = self.records.lock();
        let Some(record) = records.by_id.get_mut(id) else {
            return;
        };
        if record.state != DownloadState::Running {
            return;
        }
        record.bytes = bytes;
        record.finished_at = Some(Utc::now());
        match outcome {
            Outcome::Completed => {
                record.state = DownloadState::Completed;
                info!(download_id = id, outcome = "completed", bytes, "download finished");
            }
            Outcome::Truncated => {
                record.state = DownloadState::Truncated;
                warn!(download_id = id, outcome = "truncated", bytes, "download hit the size ceiling");
            }
            Outcome::Cancelled => {
                record.state = DownloadState::Cancelled;
                warn!(download_id = id, outcome = "cancelled", bytes, "client went away mid-download");
            }
            Outcome::Failed { kind, detail } => {
                error!(download_id = id, outcome = "failed", bytes, ?kind, detail = %detail, "download failed");
                record.state = DownloadState::Failed;
                record.kind = Some(kind);
                record.detail = Some(detail);
            }
        }
    }
}

/// Handle for one running download.
pub struct DownloadTicket {
    ledger: Arc<DownloadLedger>,
    id: String,
    bytes: u64,
    resolved: bool,
}

impl DownloadTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn add_bytes(&mut self, count: u64) {
        self.bytes += count;
    }

    pub fn resolve(mut self, outcome: Outcome) {
        self.resolved = true;
        self.ledger.settle(&self.id, self.bytes, outcome);
    }

    /// Records `err` as the reason the download never got going and hands
    /// it back for the caller to return.
    pub fn reject(self, err: DownloadError) -> DownloadError {
        self.resolve(Outcome::Failed {
            kind: err.kind().unwrap_or(FailureKind::UpstreamFailure),
            detail: err.to_string(),
        });
        err
    }
}

impl Drop for DownloadTicket {
    fn drop(&mut self) {
        if !self.resolved {
            self.ledger.settle(&self.id, self.bytes, Outcome::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_ticket_records_outcome() {
        let ledger = Arc::new(DownloadLedger::new(8));
        let mut ticket = ledger.begin("test");
        let id = ticket.id().to_string();
        assert_eq!(ledger.get(&id).unwrap().state, DownloadState::Running);

        ticket.add_bytes(42);
        ticket.resolve(Outcome::Failed {
            kind: FailureKind::UpstreamFailure,
            detail: "boom".into(),
        });
        let record = ledger.get(&id).unwrap();
        assert_eq!(record.state, DownloadState::Failed);
        assert_eq!(record.bytes, 42);
        assert_eq!(record.kind, Some(FailureKind::UpstreamFailure));
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn dropped_ticket_counts_as_cancelled() {
        let ledger = Arc::new(DownloadLedger::new(8));
        let id = {
            let ticket = ledger.begin("test");
            ticket.id().to_string()
        };
        assert_eq!(ledger.get(&id).unwrap().state, DownloadState::Cancelled);
    }

    #[test]
    fn oldest_records_are_evicted() {
        let ledger = Arc::new(DownloadLedger::new(2));
        let ids: Vec<String> = (0..3)
            .map(|_| {
                let ticket = ledger.begin("test");
                let id = ticket.id().to_string();
                ticket.resolve(Outcome::Completed);
                id
            })
            .collect();
        assert!(ledger.get(&ids[0]).is_none());
        assert!(ledger.get(&ids[1]).is_some());
        assert!(ledger.get(&ids[2]).is_some());
    }

    #[test]
    fn rejected_ticket_records_server_side_failure() {
        let ledger = Arc::new(DownloadLedger::new(8));
        let ticket = ledger.begin("test");
        let id = ticket.id().to_string();
        let err = ticket.reject(DownloadError::Io(std::io::Error::other("spawn failed")));
        assert!(matches!(err, DownloadError::Io(_)));

        let record = ledger.get(&id).unwrap();
        assert_eq!(record.state, DownloadState::Failed);
        assert_eq!(record.kind, Some(FailureKind::UpstreamFailure));
        assert!(record.detail.unwrap().contains("spawn failed"));
    }

    #[test]
    fn ids_are_unique() {
        let ledger = Arc::new(DownloadLedger::new(8));
        let a = ledger.begin("a");
        let b = ledger.begin("b");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn record_serializes_state_in_snake_case() {
        let ledger = Arc::new(DownloadLedger::new(8));
        let ticket = ledger.begin("test");
        let id = ticket.id().to_string();
        ticket.resolve(Outcome::Truncated);
        let json = serde_json::to_value(ledger.get(&id).unwrap()).unwrap();
        assert_eq!(json["state"], "truncated");
        assert!(json.get("kind").is_none());
    }
}
