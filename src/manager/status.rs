//! Status cache entries.
//!
//! Each connection id maps to one [`CacheEntry`]. While a check is running the
//! entry holds a shared handle to it, and every caller that arrives in the
//! meantime awaits that same handle.

use crate::config::ConnectionStatus;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// What callers (and status subscribers) see for one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub connection_id: Uuid,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl StatusReport {
    pub fn new(connection_id: Uuid, status: ConnectionStatus) -> Self {
        Self {
            connection_id,
            status,
            last_error: None,
            checked_at: None,
        }
    }

    pub fn settled(connection_id: Uuid, result: Result<(), String>) -> Self {
        let (status, last_error) = match result {
            Ok(()) => (ConnectionStatus::Connected, None),
            Err(message) => (ConnectionStatus::Error, Some(message)),
        };
        Self {
            connection_id,
            status,
            last_error,
            checked_at: Some(Utc::now()),
        }
    }
}

pub(crate) type SharedCheck = Shared<BoxFuture<'static, StatusReport>>;

pub(crate) struct InFlight {
    pub id: u64,
    pub check: SharedCheck,
}

pub(crate) struct CacheEntry {
    pub report: StatusReport,
    /// Monotonic time of the last settled result; `None` until one exists
    pub settled_at: Option<Instant>,
    pub in_flight: Option<InFlight>,
    /// Settings revision the report was taken against
    pub revision: Option<u64>,
}

impl CacheEntry {
    pub fn new(connection_id: Uuid, revision: Option<u64>) -> Self {
        Self {
            report: StatusReport::new(connection_id, ConnectionStatus::Disconnected),
            settled_at: None,
            in_flight: None,
            revision,
        }
    }

    /// Point the entry at a new settings revision. A report or running check
    /// taken against older settings no longer counts.
    pub fn retarget(&mut self, revision: Option<u64>) {
        if self.revision != revision {
            self.revision = revision;
            self.settled_at = None;
            self.in_flight = None;
        }
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.report.status.is_settled() && self.settled_at.is_some_and(|at| at.elapsed() < ttl)
    }

    /// Store a settled report, returning false when `check_id` is no longer the
    /// running check (a cache clear or newer check got there first)
    pub fn settle(&mut self, check_id: u64, report: StatusReport) -> bool {
        match &self.in_flight {
            Some(running) if running.id == check_id => {
                self.in_flight = None;
                self.set(report);
                true
            }
            _ => false,
        }
    }

    /// Overwrite with a result learned outside a status check
    pub fn set(&mut self, report: StatusReport) {
        self.report = report;
        self.settled_at = Some(Instant::now());
    }
}
