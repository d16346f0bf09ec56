//! Durable side-effect commands.
//!
//! Entries are written by the repository in the same atomic commit as the
//! state change that produced them, then dispatched at-least-once by the
//! orchestrator's drainer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::{Application, ApplicationId, Phase, Role, State};

/// Who a notification goes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Applicant(String),
    /// Everyone holding a role (the reviewer pool, the inspectors, ...).
    Role(Role),
    Operators,
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Applicant(id) => write!(f, "applicant {id}"),
            Recipient::Role(role) => write!(f, "all {role}s"),
            Recipient::Operators => write!(f, "operators"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    PaymentRequested,
    DocumentsReady,
    RevisionRequested,
    DocumentsRejected,
    InspectionReady,
    OnSiteRequired,
    ApprovalPending,
    Approved,
    Rejected,
    CertificateIssued,
    Cancelled,
    Expired,
    OnHold,
}

/// A side effect to perform after a commit. Commands marked "advance" in the
/// reaction table feed a follow-up transition back into the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Compute the phase fee, then advance into the payment-pending state.
    RequestPayment { phase: Phase },
    /// Compute a fresh phase-1 fee and restart the payment cycle.
    RestartPaymentCycle,
    CreatePaymentRequest { phase: Phase, amount: u64 },
    /// Confirm with the gateway, then advance out of payment processing.
    ConfirmPayment { phase: Phase, transaction_id: String },
    RequestApproval,
    /// Render the certificate artifact, then advance to issued.
    RenderCertificate { number: String },
    Notify {
        recipient: Recipient,
        event: NotificationEvent,
    },
    RecordCompliance { state: State },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::RequestPayment { .. } => "request_payment",
            Command::RestartPaymentCycle => "restart_payment_cycle",
            Command::CreatePaymentRequest { .. } => "create_payment_request",
            Command::ConfirmPayment { .. } => "confirm_payment",
            Command::RequestApproval => "request_approval",
            Command::RenderCertificate { .. } => "render_certificate",
            Command::Notify { .. } => "notify",
            Command::RecordCompliance { .. } => "record_compliance",
        }
    }
}

/// Identifies one delivery target for collaborators to deduplicate on:
/// the application, the state whose entry produced the command, the version
/// at which that state was entered, and the command's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub application_id: ApplicationId,
    pub state: State,
    pub entered_version: u64,
    pub ordinal: u16,
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/v{}/{}",
            self.application_id, self.state, self.entered_version, self.ordinal
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    /// Suspended while the application is ON_HOLD.
    Parked,
    Delivered,
    /// Retry budget exhausted or failure not retryable; escalated.
    DeadLettered,
}

/// One queued command and its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub key: IdempotencyKey,
    pub command: Command,
    pub status: OutboxStatus,
    /// Delivery attempts under the current retry budget.
    pub attempts: u32,
    /// Earliest time the next attempt may run.
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Outbox entries for the commands produced by entering the aggregate's
    /// current state.
    pub fn for_commands(app: &Application, commands: &[Command]) -> Vec<OutboxEntry> {
        commands
            .iter()
            .enumerate()
            .map(|(i, command)| OutboxEntry {
                id: Uuid::new_v4(),
                key: IdempotencyKey {
                    application_id: app.id,
                    state: app.current_state,
                    entered_version: app.state_entered_version,
                    ordinal: i as u16,
                },
                command: command.clone(),
                status: OutboxStatus::Pending,
                attempts: 0,
                next_attempt_at: app.updated_at,
                last_error: None,
                created_at: app.updated_at,
                completed_at: None,
            })
            .collect()
    }

    pub fn application_id(&self) -> ApplicationId {
        self.key.application_id
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_attempt_at <= now
    }

    pub fn mark_delivered(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Delivered;
        self.completed_at = Some(now);
        self.last_error = None;
    }

    pub fn mark_retry(&mut self, error: String, next_attempt_at: DateTime<Utc>) {
        self.last_error = Some(error);
        self.next_attempt_at = next_attempt_at;
    }

    pub fn mark_dead(&mut self, error: String, now: DateTime<Utc>) {
        self.status = OutboxStatus::DeadLettered;
        self.last_error = Some(error);
        self.completed_at = Some(now);
    }

    pub fn park(&mut self) {
        if self.status == OutboxStatus::Pending {
            self.status = OutboxStatus::Parked;
        }
    }

    /// Make a parked entry deliverable again, keeping its key and attempts.
    pub fn release(&mut self, now: DateTime<Utc>) {
        if self.status == OutboxStatus::Parked {
            self.status = OutboxStatus::Pending;
            self.next_attempt_at = self.next_attempt_at.min(now);
        }
    }

    /// Give a dead-lettered entry a fresh retry budget under the same key.
    pub fn revive(&mut self, now: DateTime<Utc>) {
        if self.status == OutboxStatus::DeadLettered {
            self.status = OutboxStatus::Pending;
            self.attempts = 0;
            self.next_attempt_at = now;
            self.completed_at = None;
        }
    }
}

/// Bookkeeping a transition applies to the entries already queued for its
/// application, in the same commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxChange {
    /// Entering ON_HOLD: park everything still pending.
    Park,
    /// Leaving ON_HOLD: release parked entries. When resuming, `revive`
    /// names the held state entry whose dead letters get another budget.
    Release { revive: Option<(State, u64)> },
}

impl OutboxChange {
    pub fn apply(self, entries: &mut [OutboxEntry], now: DateTime<Utc>) {
        for entry in entries {
            match self {
                OutboxChange::Park => entry.park(),
                OutboxChange::Release { revive } => {
                    entry.release(now);
                    if revive == Some((entry.key.state, entry.key.entered_version)) {
                        entry.revive(now);
                    }
                }
            }
        }
    }
}

/// The entries of one application that may be attempted at `now`, in
/// enqueue order. Stops at the first pending entry still waiting on its
/// backoff so later entries never overtake it.
pub fn deliverable(
    entries: &[OutboxEntry],
    now: DateTime<Utc>,
) -> impl Iterator<Item = &OutboxEntry> {
    entries
        .iter()
        .filter(|e| e.status == OutboxStatus::Pending)
        .take_while(move |e| e.is_due(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn entries_are_keyed_by_entered_state() {
        let mut app = Application::draft("farmer", 2, Utc::now());
        app.current_state = State::PaymentPending1;
        app.version = 3;
        app.state_entered_version = 3;
        let commands = vec![
            Command::CreatePaymentRequest {
                phase: Phase::One,
                amount: 5000,
            },
            Command::Notify {
                recipient: Recipient::Applicant("farmer".into()),
                event: NotificationEvent::PaymentRequested,
            },
        ];
        let entries = OutboxEntry::for_commands(&app, &commands);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key.state, State::PaymentPending1);
        assert_eq!(entries[0].key.entered_version, 3);
        assert_eq!(entries[1].key.ordinal, 1);
        assert!(entries.iter().all(|e| e.status == OutboxStatus::Pending));
        assert_eq!(
            entries[0].key.to_string(),
            format!("{}/PAYMENT_PENDING_1/v3/0", app.id)
        );
    }

    #[test]
    fn due_only_when_pending_and_time_reached() {
        let app = Application::draft("farmer", 2, Utc::now());
        let mut entry = OutboxEntry::for_commands(&app, &[Command::RequestApproval]).remove(0);
        let now = entry.next_attempt_at;
        assert!(entry.is_due(now));

        entry.mark_retry("timeout".into(), now + Duration::seconds(5));
        assert!(!entry.is_due(now));
        assert!(entry.is_due(now + Duration::seconds(5)));

        entry.mark_delivered(now);
        assert!(!entry.is_due(now + Duration::seconds(10)));
        assert!(entry.last_error.is_none());
    }

    #[test]
    fn backoff_blocks_later_entries() {
        let app = Application::draft("farmer", 2, Utc::now());
        let commands = [
            Command::RequestApproval,
            Command::RecordCompliance { state: State::Draft },
            Command::RequestApproval,
        ];
        let mut entries = OutboxEntry::for_commands(&app, &commands);
        let now = entries[0].next_attempt_at;
        entries[0].mark_delivered(now);
        entries[1].mark_retry("gateway down".into(), now + Duration::seconds(30));

        assert_eq!(deliverable(&entries, now).count(), 0);
        let later: Vec<u16> = deliverable(&entries, now + Duration::seconds(30))
            .map(|e| e.key.ordinal)
            .collect();
        assert_eq!(later, vec![1, 2]);
    }

    #[test]
    fn parked_entries_wait_for_release() {
        let app = Application::draft("farmer", 2, Utc::now());
        let mut entries =
            OutboxEntry::for_commands(&app, &[Command::RequestApproval, Command::RequestApproval]);
        let now = entries[0].next_attempt_at;
        entries[0].mark_dead("declined".into(), now);
        entries.iter_mut().for_each(OutboxEntry::park);
        assert_eq!(entries[0].status, OutboxStatus::DeadLettered);
        assert_eq!(entries[1].status, OutboxStatus::Parked);
        assert_eq!(deliverable(&entries, now).count(), 0);

        entries.iter_mut().for_each(|e| e.release(now));
        entries[0].revive(now);
        assert_eq!(deliverable(&entries, now).count(), 2);
        assert_eq!(entries[0].attempts, 0);
        assert_eq!(entries[0].last_error.as_deref(), Some("declined"));
    }

    #[test]
    fn recipient_serializes_tagged() {
        let json = serde_json::to_value(Recipient::Role(Role::Reviewer)).unwrap();
        assert_eq!(json["kind"], "role");
        assert_eq!(json["id"], "reviewer");
    }
}
