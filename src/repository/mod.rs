//! Application persistence with optimistic concurrency.
//!
//! A repository keeps, per application, the current aggregate, its
//! append-only history log and its outbox. [`ApplicationRepository::commit`]
//! writes all three at once or not at all, and only when the stored version
//! still equals the version the caller loaded.

mod file;
mod memory;

pub use file::FileRepository;
pub use memory::InMemoryRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::HistoryEntry;
use crate::error::RepositoryError;
use crate::outbox::{self, OutboxChange, OutboxEntry, OutboxStatus};
use crate::state_machine::{Application, ApplicationId};

/// One atomic unit of work: the next aggregate, its history entry, the
/// outbox entries produced by the transition and any change to the entries
/// already queued.
#[derive(Debug, Clone)]
pub struct Commit {
    pub application: Application,
    pub expected_version: u64,
    pub entry: HistoryEntry,
    pub outbox: Vec<OutboxEntry>,
    pub outbox_change: Option<OutboxChange>,
}

#[async_trait]
pub trait ApplicationRepository: Send + Sync {
    /// Store a new aggregate with its creation entry.
    async fn create(
        &self,
        application: &Application,
        entry: &HistoryEntry,
    ) -> Result<(), RepositoryError>;

    async fn load(&self, id: ApplicationId) -> Result<Application, RepositoryError>;

    /// Apply a commit if the stored version equals `expected_version`,
    /// otherwise fail with `VersionConflict` and change nothing.
    async fn commit(&self, commit: Commit) -> Result<(), RepositoryError>;

    async fn history(&self, id: ApplicationId) -> Result<Vec<HistoryEntry>, RepositoryError>;

    async fn list(&self) -> Result<Vec<Application>, RepositoryError>;

    async fn outbox(&self, id: ApplicationId) -> Result<Vec<OutboxEntry>, RepositoryError>;

    /// Entries that may be attempted now, ordered by application and then by
    /// the order they were enqueued in. An application contributes nothing
    /// past its first entry still waiting on a backoff delay.
    async fn due_outbox(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, RepositoryError>;

    /// Replace an outbox entry's delivery bookkeeping. An entry parked in the
    /// meantime stays parked unless the update completes it.
    async fn update_outbox(&self, entry: &OutboxEntry) -> Result<(), RepositoryError>;
}

/// Everything stored for one application. Both backends keep this shape; the
/// file backend writes it as a single JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredApplication {
    pub application: Application,
    pub history: Vec<HistoryEntry>,
    pub outbox: Vec<OutboxEntry>,
}

impl StoredApplication {
    pub fn new(application: &Application, entry: &HistoryEntry) -> Self {
        Self {
            application: application.clone(),
            history: vec![entry.clone()],
            outbox: Vec::new(),
        }
    }

    /// Validate the commit against this record, then apply it. Validation
    /// happens before any mutation so a rejected commit leaves no trace.
    pub fn apply(&mut self, commit: Commit) -> Result<(), RepositoryError> {
        let stored = self.application.version;
        if stored != commit.expected_version {
            return Err(RepositoryError::VersionConflict {
                expected: commit.expected_version,
                actual: stored,
            });
        }
        let next = stored + 1;
        if commit.application.version != next || commit.entry.version != next {
            return Err(RepositoryError::Corrupt(format!(
                "commit for {} must carry version {next}, got aggregate {} and entry {}",
                self.application.id, commit.application.version, commit.entry.version
            )));
        }
        if commit.application.id != self.application.id
            || commit.entry.application_id != self.application.id
        {
            return Err(RepositoryError::Corrupt(format!(
                "commit does not belong to {}",
                self.application.id
            )));
        }

        if let Some(change) = commit.outbox_change {
            change.apply(&mut self.outbox, commit.application.updated_at);
        }
        self.application = commit.application;
        self.history.push(commit.entry);
        self.outbox.extend(commit.outbox);
        Ok(())
    }

    pub fn due(&self, now: DateTime<Utc>) -> impl Iterator<Item = &OutboxEntry> {
        outbox::deliverable(&self.outbox, now)
    }

    pub fn replace_outbox(&mut self, entry: &OutboxEntry) -> Result<(), RepositoryError> {
        let slot = self
            .outbox
            .iter_mut()
            .find(|e| e.id == entry.id)
            .ok_or(RepositoryError::OutboxEntryNotFound(entry.id))?;
        let parked = slot.status == OutboxStatus::Parked;
        *slot = entry.clone();
        if parked {
            slot.park();
        }
        Ok(())
    }
}

/// Order due entries by application, then by enqueue order, and cap them.
pub(crate) fn order_due(mut entries: Vec<OutboxEntry>, limit: usize) -> Vec<OutboxEntry> {
    entries.sort_by(|a, b| {
        (a.key.application_id, a.key.entered_version, a.key.ordinal).cmp(&(
            b.key.application_id,
            b.key.entered_version,
            b.key.ordinal,
        ))
    });
    entries.truncate(limit);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::Command;
    use crate::state_machine::{Actor, Role, State};

    fn stored() -> StoredApplication {
        let app = Application::draft("farmer", 2, Utc::now());
        let entry = HistoryEntry::created(&app, &Actor::new("farmer", Role::Applicant));
        StoredApplication::new(&app, &entry)
    }

    fn next_commit(record: &StoredApplication, expected_version: u64) -> Commit {
        let mut app = record.application.clone();
        let from = app.current_state;
        app.current_state = State::Submitted;
        app.version += 1;
        app.state_entered_version = app.version;
        let entry = HistoryEntry::transition(&app, from, "SUBMIT", &Actor::system(), String::new());
        let outbox = OutboxEntry::for_commands(&app, &[Command::RequestApproval]);
        Commit {
            application: app,
            expected_version,
            entry,
            outbox,
            outbox_change: None,
        }
    }

    #[test]
    fn apply_commits_all_parts() {
        let mut record = stored();
        let commit = next_commit(&record, 1);
        record.apply(commit).unwrap();
        assert_eq!(record.application.version, 2);
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.outbox.len(), 1);
    }

    #[test]
    fn stale_commit_changes_nothing() {
        let mut record = stored();
        let first = next_commit(&record, 1);
        let stale = next_commit(&record, 1);
        record.apply(first).unwrap();

        let before = (record.application.clone(), record.history.len(), record.outbox.len());
        let err = record.apply(stale).unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::VersionConflict { expected: 1, actual: 2 }
        ));
        assert_eq!(
            (record.application.clone(), record.history.len(), record.outbox.len()),
            before
        );
    }

    #[test]
    fn hold_commit_parks_queued_entries() {
        let mut record = stored();
        record.apply(next_commit(&record, 1)).unwrap();
        let mut hold = next_commit(&record, 2);
        hold.outbox.clear();
        hold.outbox_change = Some(OutboxChange::Park);
        record.apply(hold).unwrap();

        assert_eq!(record.outbox[0].status, OutboxStatus::Parked);
        assert_eq!(record.due(Utc::now()).count(), 0);

        // A drainer finishing a retry after the hold does not unpark it.
        let mut retried = record.outbox[0].clone();
        retried.status = OutboxStatus::Pending;
        retried.attempts = 1;
        record.replace_outbox(&retried).unwrap();
        assert_eq!(record.outbox[0].status, OutboxStatus::Parked);
        assert_eq!(record.outbox[0].attempts, 1);
    }

    #[test]
    fn commit_skipping_a_version_is_refused() {
        let mut record = stored();
        let mut commit = next_commit(&record, 1);
        commit.application.version = 5;
        assert!(matches!(record.apply(commit), Err(RepositoryError::Corrupt(_))));
        assert_eq!(record.application.version, 1);
    }
}
