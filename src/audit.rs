//! Append-only audit trail.
//!
//! One [`HistoryEntry`] is produced per committed transition and stored by the
//! repository in the same write as the aggregate. Entries are never edited;
//! this module builds them, checks that a log is well formed and summarises it
//! into an [`AuditRecord`] for compliance review.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::{Actor, Application, ApplicationId, State};

/// Action code of the entry written when an application is created.
pub const CREATE_ACTION: &str = "CREATE";

/// One immutable line of an application's history. `version` is the
/// aggregate version the transition produced and keys the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub application_id: ApplicationId,
    pub version: u64,
    pub from_state: Option<State>,
    pub to_state: State,
    pub action: String,
    pub actor: Actor,
    pub at: DateTime<Utc>,
    pub note: String,
}

impl HistoryEntry {
    pub fn created(app: &Application, actor: &Actor) -> Self {
        Self {
            application_id: app.id,
            version: app.version,
            from_state: None,
            to_state: app.current_state,
            action: CREATE_ACTION.to_string(),
            actor: actor.clone(),
            at: app.created_at,
            note: format!("application {} created", app.application_number),
        }
    }

    pub fn transition(
        app: &Application,
        from: State,
        action: &str,
        actor: &Actor,
        note: String,
    ) -> Self {
        Self {
            application_id: app.id,
            version: app.version,
            from_state: Some(from),
            to_state: app.current_state,
            action: action.to_string(),
            actor: actor.clone(),
            at: app.updated_at,
            note,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuditViolation {
    #[error("history is empty")]
    Empty,

    #[error("entry {index} has version {found}, expected {expected}")]
    VersionGap {
        index: usize,
        expected: u64,
        found: u64,
    },

    #[error("entry at version {version} starts from {found:?}, previous entry ended in {expected}")]
    BrokenChain {
        version: u64,
        expected: State,
        found: Option<State>,
    },

    #[error("last entry ends in {last}, application is in {current}")]
    StateMismatch { last: State, current: State },

    #[error("last entry has version {last}, application is at {current}")]
    VersionMismatch { last: u64, current: u64 },
}

/// Check a history log against its aggregate: versions start at 1 and are
/// gapless, each entry starts where the previous one ended, and the log ends
/// at the aggregate's current state and version.
pub fn verify(app: &Application, history: &[HistoryEntry]) -> Result<(), AuditViolation> {
    let last = history.last().ok_or(AuditViolation::Empty)?;

    let mut previous: Option<&HistoryEntry> = None;
    for (index, entry) in history.iter().enumerate() {
        let expected = index as u64 + 1;
        if entry.version != expected {
            return Err(AuditViolation::VersionGap {
                index,
                expected,
                found: entry.version,
            });
        }
        if let Some(prev) = previous
            && entry.from_state != Some(prev.to_state)
        {
            return Err(AuditViolation::BrokenChain {
                version: entry.version,
                expected: prev.to_state,
                found: entry.from_state,
            });
        }
        previous = Some(entry);
    }

    if last.to_state != app.current_state {
        return Err(AuditViolation::StateMismatch {
            last: last.to_state,
            current: app.current_state,
        });
    }
    if last.version != app.version {
        return Err(AuditViolation::VersionMismatch {
            last: last.version,
            current: app.version,
        });
    }
    Ok(())
}

/// Summary of an application's trail, produced for compliance reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub application_id: ApplicationId,
    pub application_number: String,
    pub current_state: State,
    pub version: u64,
    pub state_transitions: Vec<State>,
    pub actors: BTreeSet<String>,
    pub rejection_count: u32,
    pub payment_cycles: u32,
    pub started_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl AuditRecord {
    pub fn from_history(app: &Application, history: &[HistoryEntry]) -> Self {
        let state_transitions = history.iter().map(|e| e.to_state).collect();
        let actors = history.iter().map(|e| e.actor.id.clone()).collect();
        let last_transition_at = history.last().map_or(app.updated_at, |e| e.at);

        Self {
            application_id: app.id,
            application_number: app.application_number.clone(),
            current_state: app.current_state,
            version: app.version,
            state_transitions,
            actors,
            rejection_count: app.document_review.rejection_count,
            payment_cycles: app.payment_cycle,
            started_at: app.created_at,
            last_transition_at,
            duration_ms: (last_transition_at - app.created_at).num_milliseconds(),
        }
    }
}
