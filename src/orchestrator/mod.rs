//! Outbox drainer.
//!
//! Pulls due outbox entries and dispatches them to collaborators. Delivery is
//! at-least-once: an entry is marked delivered only after its effect
//! succeeded. Entries of one application run in order and under a claim, so
//! overlapping drain passes never work on the same application; different
//! applications run concurrently. Commands that advance the lifecycle are fed
//! back into the state machine as the system actor. Failures retry with
//! exponential backoff; when the budget runs out the entry is dead-lettered,
//! the application is put ON_HOLD and an alert is raised.

pub mod reactions;

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::audit::AuditRecord;
use crate::collaborators::{
    Alert, Collaborators, ComplianceEvent, FeeQuery, Notification, PaymentConfirmation,
    PaymentRequest, RenderRequest,
};
use crate::config::OutboxConfig;
use crate::error::{CollaboratorError, FailureKind, WorkflowError};
use crate::outbox::{self, Command, IdempotencyKey, OutboxEntry};
use crate::repository::ApplicationRepository;
use crate::state_machine::{
    Action, Actor, Application, ApplicationId, Phase, State, WorkflowStateMachine,
};

pub use reactions::{is_advance, reactions};

/// Attempts at a follow-up transition that keeps losing the version race.
const CONFLICT_RETRIES: u32 = 3;

/// Upper bound on a single backoff delay (one day).
const MAX_BACKOFF_MS: u64 = 86_400_000;

const CERTIFICATE_TEMPLATE: &str = "gacp-certificate";

/// Delivery policy for outbox entries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before an entry is dead-lettered.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    pub call_timeout_ms: u64,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&OutboxConfig::default())
    }
}

impl From<&OutboxConfig> for RetryPolicy {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay_ms,
            call_timeout_ms: config.call_timeout_ms,
            batch_size: config.batch_size,
            poll_interval_ms: config.poll_interval_ms,
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay for a given attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Counts from one or more drain passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Entries completed, including skipped advances.
    pub delivered: usize,
    /// Failures rescheduled with backoff.
    pub retried: usize,
    pub dead_lettered: usize,
    /// Advance commands whose trigger state had already been left.
    pub skipped: usize,
}

impl DrainReport {
    pub fn processed(&self) -> usize {
        self.delivered + self.retried + self.dead_lettered
    }

    fn merge(&mut self, other: DrainReport) {
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.skipped += other.skipped;
    }
}

enum Delivery {
    Done,
    Skipped,
    /// Belongs to the state entry the application is held in.
    Held,
}

type InFlight = Arc<Mutex<HashSet<ApplicationId>>>;

/// Exclusive right to deliver one application's outbox. Released on drop.
struct Claim {
    id: ApplicationId,
    in_flight: InFlight,
}

impl Claim {
    fn acquire(in_flight: &InFlight, id: ApplicationId) -> Option<Self> {
        lock(in_flight).insert(id).then(|| Self {
            id,
            in_flight: Arc::clone(in_flight),
        })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.id);
    }
}

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashSet<ApplicationId>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives outbox entries to completion. Clones share their claims.
#[derive(Clone)]
pub struct Orchestrator {
    machine: Arc<WorkflowStateMachine>,
    repository: Arc<dyn ApplicationRepository>,
    collaborators: Collaborators,
    policy: RetryPolicy,
    in_flight: InFlight,
}

impl Orchestrator {
    pub fn new(
        machine: Arc<WorkflowStateMachine>,
        collaborators: Collaborators,
        policy: RetryPolicy,
    ) -> Self {
        let repository = Arc::clone(machine.repository());
        Self {
            machine,
            repository,
            collaborators,
            policy,
            in_flight: InFlight::default(),
        }
    }

    /// One pass over the applications with entries due now. Applications
    /// another pass is already delivering for are left to it.
    ///
    /// Fails when outbox bookkeeping could not be stored; the other
    /// applications of the pass still finish first.
    pub async fn drain_once(&self) -> Result<DrainReport, WorkflowError> {
        let due = self
            .repository
            .due_outbox(Utc::now(), self.policy.batch_size)
            .await?;
        let applications: BTreeSet<ApplicationId> =
            due.iter().map(OutboxEntry::application_id).collect();
        if applications.is_empty() {
            return Ok(DrainReport::default());
        }
        debug!(applications = applications.len(), "draining outbox");

        let mut tasks = JoinSet::new();
        for id in applications {
            let Some(claim) = Claim::acquire(&self.in_flight, id) else {
                debug!(application_id = %id, "outbox already being drained elsewhere");
                continue;
            };
            let this = self.clone();
            tasks.spawn(async move {
                let _claim = claim;
                this.deliver_in_order(id).await
            });
        }

        let mut report = DrainReport::default();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(partial)) => report.merge(partial),
                Ok(Err(e)) => {
                    error!(error = %e, "outbox delivery aborted");
                    failure.get_or_insert(e);
                }
                Err(e) => error!(error = %e, "outbox delivery task failed"),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Drain until nothing is due. Entries waiting on a backoff delay that
    /// has not elapsed stay pending.
    pub async fn drain_until_idle(&self) -> Result<DrainReport, WorkflowError> {
        let mut total = DrainReport::default();
        loop {
            let pass = self.drain_once().await?;
            if pass.processed() == 0 && pass.skipped == 0 {
                return Ok(total);
            }
            total.merge(pass);
        }
    }

    /// Poll the outbox until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkflowError> {
        let interval = Duration::from_millis(self.policy.poll_interval_ms);
        info!(poll_interval_ms = self.policy.poll_interval_ms, "outbox drainer started");
        while !*shutdown.borrow() {
            if let Err(e) = self.drain_once().await {
                warn!(error = %e, "drain pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("outbox drainer stopped");
        Ok(())
    }

    /// Deliver one application's due entries in order, read fresh under its
    /// claim. Stops at the first entry that does not complete so later
    /// entries never overtake it.
    async fn deliver_in_order(&self, id: ApplicationId) -> Result<DrainReport, WorkflowError> {
        let entries = self.repository.outbox(id).await?;
        let due: Vec<OutboxEntry> = outbox::deliverable(&entries, Utc::now()).cloned().collect();
        let mut report = DrainReport::default();
        for entry in due {
            if !self.deliver(entry, &mut report).await? {
                break;
            }
        }
        Ok(report)
    }

    /// Attempt one entry and store the outcome. Returns whether it completed.
    async fn deliver(
        &self,
        mut entry: OutboxEntry,
        report: &mut DrainReport,
    ) -> Result<bool, WorkflowError> {
        entry.attempts += 1;
        let result = self.execute(&entry).await;
        let now = Utc::now();

        let completed = match result {
            Ok(Delivery::Held) => {
                entry.attempts = entry.attempts.saturating_sub(1);
                entry.park();
                debug!(key = %entry.key, "application on hold, entry parked");
                false
            }
            Ok(delivery) => {
                entry.mark_delivered(now);
                report.delivered += 1;
                if matches!(delivery, Delivery::Skipped) {
                    report.skipped += 1;
                }
                debug!(key = %entry.key, command = entry.command.name(), "outbox entry delivered");
                true
            }
            Err(err) if failure_kind(&err) == FailureKind::System
                && entry.attempts < self.policy.max_attempts =>
            {
                let delay_ms = self.policy.delay_for_attempt(entry.attempts);
                warn!(
                    key = %entry.key,
                    command = entry.command.name(),
                    attempt = entry.attempts,
                    max_attempts = self.policy.max_attempts,
                    delay_ms,
                    error = %err,
                    "outbox delivery failed, will retry"
                );
                let capped = delay_ms.min(MAX_BACKOFF_MS) as i64;
                entry.mark_retry(err.to_string(), now + chrono::Duration::milliseconds(capped));
                report.retried += 1;
                false
            }
            Err(err) => {
                entry.mark_dead(err.to_string(), now);
                report.dead_lettered += 1;
                self.repository.update_outbox(&entry).await?;
                self.escalate(&entry, &err).await;
                return Ok(false);
            }
        };

        self.repository.update_outbox(&entry).await?;
        Ok(completed)
    }

    async fn execute(&self, entry: &OutboxEntry) -> Result<Delivery, WorkflowError> {
        let key = &entry.key;
        let app = self.repository.load(key.application_id).await?;
        if held_in(&app, key) {
            return Ok(Delivery::Held);
        }
        if is_advance(&entry.command) && !entered_by(&app, key) {
            debug!(
                %key,
                state = %app.current_state,
                "trigger state already left, skipping advance"
            );
            return Ok(Delivery::Skipped);
        }

        let c = &self.collaborators;
        match &entry.command {
            Command::RequestPayment { phase } => {
                let amount = self.fee(&app, *phase).await?;
                self.advance(key, Action::RequestPayment {
                    phase: *phase,
                    amount,
                })
                .await
            }
            Command::RestartPaymentCycle => {
                let amount = self.fee(&app, Phase::One).await?;
                self.advance(key, Action::RestartPaymentCycle { amount }).await
            }
            Command::CreatePaymentRequest { phase, amount } => {
                let request = PaymentRequest {
                    key: *key,
                    applicant_id: app.applicant_id.clone(),
                    application_number: app.application_number.clone(),
                    phase: *phase,
                    amount: *amount,
                };
                self.call(c.payments.create_payment_request(&request)).await?;
                Ok(Delivery::Done)
            }
            Command::ConfirmPayment {
                phase,
                transaction_id,
            } => {
                match self.call(c.payments.confirm_payment(key, transaction_id)).await? {
                    PaymentConfirmation::Confirmed => {}
                    PaymentConfirmation::Pending => {
                        return Err(CollaboratorError::Unavailable(format!(
                            "transaction {transaction_id} not settled yet"
                        ))
                        .into());
                    }
                    PaymentConfirmation::Declined(reason) => {
                        return Err(CollaboratorError::Rejected(reason).into());
                    }
                }
                self.advance(key, Action::ConfirmPayment { phase: *phase }).await
            }
            Command::RequestApproval => self.advance(key, Action::RequestApproval).await,
            Command::RenderCertificate { number } => {
                let request = RenderRequest {
                    key: *key,
                    template: CERTIFICATE_TEMPLATE.to_string(),
                    data: serde_json::json!({
                        "certificate_number": number,
                        "application_number": app.application_number,
                        "applicant_id": app.applicant_id,
                        "compliance_score": app.inspection.compliance_score,
                    }),
                };
                let artifact_ref = self.call(c.rendering.render(&request)).await?;
                self.advance(key, Action::CompleteCertificate { artifact_ref }).await
            }
            Command::Notify { recipient, event } => {
                let notification = Notification {
                    key: *key,
                    recipient: recipient.clone(),
                    event: *event,
                    application_number: app.application_number.clone(),
                };
                self.call(c.notifications.send(&notification)).await?;
                Ok(Delivery::Done)
            }
            Command::RecordCompliance { state } => {
                let history = self.repository.history(app.id).await?;
                let event = ComplianceEvent {
                    key: *key,
                    state: *state,
                    record: AuditRecord::from_history(&app, &history),
                };
                self.call(c.compliance.record(&event)).await?;
                Ok(Delivery::Done)
            }
        }
    }

    async fn fee(&self, app: &Application, phase: Phase) -> Result<u64, WorkflowError> {
        let query = FeeQuery {
            application_id: app.id,
            phase,
            payment_cycle: app.payment_cycle,
        };
        Ok(self.call(self.collaborators.payments.compute_fee(&query)).await?)
    }

    /// Apply the follow-up transition for `key`, reloading on version races.
    /// Succeeds without a transition when the trigger state was left meanwhile.
    async fn advance(&self, key: &IdempotencyKey, action: Action) -> Result<Delivery, WorkflowError> {
        let system = Actor::system();
        let mut attempt = 0;
        loop {
            let app = self.repository.load(key.application_id).await?;
            if !entered_by(&app, key) {
                return Ok(Delivery::Skipped);
            }
            match self
                .machine
                .transition(app.id, action.clone(), &system, app.version)
                .await
            {
                Ok(_) => return Ok(Delivery::Done),
                Err(e) if e.is_retryable() && attempt + 1 < CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(%key, attempt, "version race on follow-up transition, reloading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Dead-letter escalation: hold the application and alert operators.
    async fn escalate(&self, entry: &OutboxEntry, err: &WorkflowError) {
        let held = match self.hold(entry, err).await {
            Ok(held) => held,
            Err(e) => {
                error!(key = %entry.key, error = %e, "failed to put application on hold");
                false
            }
        };
        error!(
            key = %entry.key,
            command = entry.command.name(),
            attempts = entry.attempts,
            held,
            error = %err,
            "outbox entry escalated"
        );
        let alert = Alert {
            key: entry.key,
            command: entry.command.name().to_string(),
            attempts: entry.attempts,
            error: err.to_string(),
            held,
        };
        self.collaborators.alerts.raise(&alert).await;
    }

    async fn hold(&self, entry: &OutboxEntry, err: &WorkflowError) -> Result<bool, WorkflowError> {
        let reason = format!("{} failed: {err}", entry.command.name());
        for _ in 0..CONFLICT_RETRIES {
            let app = self.repository.load(entry.application_id()).await?;
            if app.is_terminal() || app.current_state == State::OnHold {
                return Ok(false);
            }
            let action = Action::Hold {
                reason: reason.clone(),
            };
            match self
                .machine
                .transition(app.id, action, &Actor::system(), app.version)
                .await
            {
                Ok(_) => return Ok(true),
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, CollaboratorError>>,
    ) -> Result<T, CollaboratorError> {
        let timeout_ms = self.policy.call_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout { timeout_ms }),
        }
    }
}

/// Whether the aggregate is still in the state entry that produced `key`.
fn entered_by(app: &Application, key: &IdempotencyKey) -> bool {
    app.current_state == key.state && app.state_entered_version == key.entered_version
}

/// Whether the aggregate is ON_HOLD from the state entry that produced `key`.
fn held_in(app: &Application, key: &IdempotencyKey) -> bool {
    app.current_state == State::OnHold
        && app.held_from == Some(key.state)
        && app.held_entered_version == Some(key.entered_version)
}

fn failure_kind(err: &WorkflowError) -> FailureKind {
    match err {
        WorkflowError::Collaborator(e) => e.kind(),
        WorkflowError::VersionConflict { .. } | WorkflowError::Persistence(_) => FailureKind::System,
        _ => FailureKind::Business,
    }
}
