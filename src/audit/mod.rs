//! Append-only audit trail of mutations, kept as a fixed-capacity ring buffer.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

/// Entries kept when no capacity is configured.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub resource: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// What to record; [`AuditLog::record`] stamps the id and timestamp.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    actor: String,
    action: String,
    resource: String,
    resource_id: Option<String>,
    detail: Option<String>,
}

impl AuditEvent {
    /// `actor` performed `action` on `resource`.
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            resource: resource.into(),
            resource_id: None,
            detail: None,
        }
    }

    /// The id of the record acted on.
    #[must_use]
    pub fn resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    /// Free-form context for the entry.
    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The `capacity` most recent audit entries; older ones are evicted.
///
/// # Examples
///
/// ```
/// use upguard::audit::{AuditEvent, AuditLog};
///
/// let log = AuditLog::new(2);
/// log.record(AuditEvent::new("alice", "create", "jobs"));
/// log.record(AuditEvent::new("alice", "update", "jobs").resource_id("job-1"));
/// log.record(AuditEvent::new("bob", "delete", "jobs").resource_id("job-1"));
///
/// let recent = log.recent(10);
/// assert_eq!(recent.len(), 2);
/// assert_eq!(recent[0].action, "delete");
/// assert_eq!(recent[1].action, "update");
/// ```
#[derive(Debug)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl AuditLog {
    /// A log keeping at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Stamps `event` with an id and the current time, evicting the oldest
    /// entry when full. The entry is also logged at `info`.
    pub fn record(&self, event: AuditEvent) -> AuditEntry {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: event.actor,
            action: event.action,
            resource: event.resource,
            resource_id: event.resource_id,
            detail: event.detail,
        };
        info!(
            audit_id = %entry.id,
            actor = %entry.actor,
            action = %entry.action,
            resource = %entry.resource,
            resource_id = entry.resource_id.as_deref().unwrap_or("-"),
            "audit"
        );

        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        entry
    }

    /// Up to `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Entries currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The most entries the log keeps.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
