use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::application::{
    Application, ApplicationId, ApprovalDecision, InspectionFinding, InspectionKind,
    PaymentRecord, PaymentStatus, ReviewEntry,
};
use super::state::{Action, Actor, Phase, State};
use crate::audit::HistoryEntry;
use crate::error::WorkflowError;
use crate::orchestrator::reactions;
use crate::outbox::{Command, OutboxChange, OutboxEntry};
use crate::repository::{ApplicationRepository, Commit};
use crate::validator::{self, RejectionOutcome, RuleCode, RuleViolation, Validator};

/// What a committed transition produced.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub application: Application,
    pub entry: HistoryEntry,
    pub commands: Vec<Command>,
}

impl TransitionOutcome {
    pub fn state(&self) -> State {
        self.application.current_state
    }

    pub fn version(&self) -> u64 {
        self.application.version
    }
}

/// Owns the transition table and drives the aggregate through it.
///
/// [`transition`](Self::transition) loads, checks the caller's version,
/// evaluates the guard, computes the next aggregate and hands aggregate,
/// history entry and outbox entries to the repository as one commit. Every
/// failure returns before the commit, so stored state is never touched.
pub struct WorkflowStateMachine {
    repository: Arc<dyn ApplicationRepository>,
    validator: Validator,
    max_rejections: u32,
}

impl WorkflowStateMachine {
    pub fn new(
        repository: Arc<dyn ApplicationRepository>,
        validator: Validator,
        max_rejections: u32,
    ) -> Self {
        Self {
            repository,
            validator,
            max_rejections,
        }
    }

    pub fn repository(&self) -> &Arc<dyn ApplicationRepository> {
        &self.repository
    }

    /// Create a DRAFT application at version 1.
    pub async fn create(
        &self,
        applicant_id: &str,
        actor: &Actor,
    ) -> Result<Application, WorkflowError> {
        if applicant_id.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "applicant id must not be empty".into(),
            ));
        }
        let app = Application::draft(applicant_id, self.max_rejections, Utc::now());
        let entry = HistoryEntry::created(&app, actor);
        self.repository.create(&app, &entry).await?;
        info!(
            application_id = %app.id,
            application_number = %app.application_number,
            "application created"
        );
        Ok(app)
    }

    pub async fn transition(
        &self,
        id: ApplicationId,
        action: Action,
        actor: &Actor,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        validator::validate_input(&action, actor).map_err(WorkflowError::Validation)?;

        let current = self.repository.load(id).await?;
        if current.version != expected_version {
            return Err(WorkflowError::VersionConflict {
                expected: expected_version,
                actual: current.version,
            });
        }
        if !action.permits(actor.role) {
            return Err(WorkflowError::Forbidden {
                role: actor.role,
                action: action.name(),
            });
        }

        let mut next = current.clone();
        let now = Utc::now();
        let note = self.apply(&mut next, &action, actor, now).inspect_err(|e| {
            debug!(application_id = %id, action = action.name(), error = %e, "transition refused");
        })?;

        let from = current.current_state;
        // Resume puts back the held state entry instead of entering anew.
        let restored = next.state_entered_version != current.state_entered_version;
        let entered = next.current_state != from && !restored;
        next.version = current.version + 1;
        next.updated_at = now;
        if entered {
            next.state_entered_version = next.version;
        }

        let commands = if entered { reactions(&next) } else { Vec::new() };
        let entry = HistoryEntry::transition(&next, from, action.name(), actor, note);
        let outbox = OutboxEntry::for_commands(&next, &commands);
        let outbox_change = match (from, next.current_state) {
            (State::OnHold, State::OnHold) => None,
            (_, State::OnHold) => Some(OutboxChange::Park),
            (State::OnHold, to) => Some(OutboxChange::Release {
                revive: restored.then_some((to, next.state_entered_version)),
            }),
            _ => None,
        };

        self.repository
            .commit(Commit {
                application: next.clone(),
                expected_version,
                entry: entry.clone(),
                outbox,
                outbox_change,
            })
            .await?;

        info!(
            application_id = %id,
            from = %from,
            to = %next.current_state,
            version = next.version,
            action = action.name(),
            actor = %actor.id,
            commands = commands.len(),
            "transition committed"
        );

        Ok(TransitionOutcome {
            application: next,
            entry,
            commands,
        })
    }

    /// Compute the next aggregate in place and return the history note.
    /// Pure: no I/O, and on error the caller discards `app`.
    pub fn apply(
        &self,
        app: &mut Application,
        action: &Action,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<String, WorkflowError> {
        let from = app.current_state;
        let invalid = || WorkflowError::InvalidTransition {
            state: from,
            action: action.name(),
        };

        if let Action::Override { target, reason } = action {
            self.validator
                .check(app, action)
                .map_err(WorkflowError::GuardFailed)?;
            match (from, *target) {
                (State::OnHold, State::OnHold) => {}
                (_, State::OnHold) => hold_from(app, from),
                _ => release_hold(app),
            }
            app.current_state = *target;
            if let Some(step) = target.step() {
                app.current_step = step;
            }
            return Ok(format!("administrative override {from} -> {target}: {reason}"));
        }
        if from.is_terminal() || !is_defined(from, action) {
            return Err(invalid());
        }
        self.validator
            .check(app, action)
            .map_err(WorkflowError::GuardFailed)?;

        let note = match action {
            Action::Submit { documents } => {
                app.documents = documents.clone();
                app.submitted_at = Some(now);
                app.current_state = State::Submitted;
                format!("submitted with {} document categories", documents.len())
            }
            Action::RequestPayment { phase, amount } => {
                let record = app.payment_mut(*phase);
                record.amount = *amount;
                record.requested_at = Some(now);
                app.current_state = match phase {
                    Phase::One => State::PaymentPending1,
                    Phase::Two => State::PaymentPending2,
                };
                format!("{phase} fee of {amount} requested")
            }
            Action::RecordPayment { phase, evidence } => {
                let record = app.payment_mut(*phase);
                advance_payment(record, PaymentStatus::Processing, now)?;
                record.transaction_id = Some(evidence.transaction_id.clone());
                app.current_state = match phase {
                    Phase::One => State::PaymentProcessing1,
                    Phase::Two => State::PaymentProcessing2,
                };
                format!(
                    "{phase} payment of {} received, transaction {}",
                    evidence.amount, evidence.transaction_id
                )
            }
            Action::ConfirmPayment { phase } => {
                advance_payment(app.payment_mut(*phase), PaymentStatus::Completed, now)?;
                app.current_state = match phase {
                    Phase::One => State::DocumentReview,
                    Phase::Two => State::InspectionScheduled,
                };
                format!("{phase} payment confirmed")
            }
            Action::ReviewDocuments { decision } => {
                app.document_review.reviews.push(ReviewEntry {
                    reviewer_id: actor.id.clone(),
                    reviewed_at: now,
                    approved: decision.approved,
                    findings: decision.findings.clone(),
                    corrections: decision.corrections.clone(),
                    cycle: app.payment_cycle,
                });
                if decision.approved {
                    app.current_state = State::DocumentApproved;
                    "documents approved".to_string()
                } else {
                    let review = &mut app.document_review;
                    review.rejection_count += 1;
                    let (count, max) = (review.rejection_count, review.max_rejections);
                    match validator::rejection_outcome(count, max) {
                        RejectionOutcome::Revise => {
                            app.current_state = State::DocumentRevision;
                            format!("documents need revision ({count}/{max})")
                        }
                        RejectionOutcome::Reject => {
                            advance_payment(&mut app.payment1, PaymentStatus::Expired, now)?;
                            app.current_state = State::DocumentRejected;
                            format!("documents rejected {count}/{max} times, phase 1 payment expired")
                        }
                    }
                }
            }
            Action::ResubmitDocuments { documents } => {
                app.documents = documents.clone();
                app.current_state = State::DocumentReview;
                "corrected documents resubmitted".to_string()
            }
            Action::RestartPaymentCycle { amount } => {
                let mut fresh = PaymentRecord::new(Phase::One);
                fresh.amount = *amount;
                fresh.requested_at = Some(now);
                let expired = std::mem::replace(&mut app.payment1, fresh);
                app.expired_payments.push(expired);
                app.payment_cycle += 1;
                app.document_review.rejection_count = 0;
                app.current_state = State::PaymentPending1;
                format!(
                    "payment cycle {} started, phase 1 fee of {amount} requested",
                    app.payment_cycle
                )
            }
            Action::ScheduleInspection { remote_at } => {
                app.inspection.inspector_id = Some(actor.id.clone());
                app.inspection.remote_scheduled_at = Some(*remote_at);
                app.current_state = State::InspectionRemote;
                format!("remote assessment scheduled for {remote_at}")
            }
            Action::RecordRemoteAssessment {
                findings,
                on_site_required,
            } => {
                let inspection = &mut app.inspection;
                inspection.remote_completed_at = Some(now);
                inspection.on_site_required = *on_site_required;
                inspection.findings.push(InspectionFinding {
                    kind: InspectionKind::Remote,
                    inspector_id: actor.id.clone(),
                    recorded_at: now,
                    notes: findings.clone(),
                });
                if *on_site_required {
                    app.current_state = State::InspectionOnSite;
                    "remote assessment done, on-site visit required".to_string()
                } else {
                    app.current_state = State::InspectionCompleted;
                    "inspection completed remotely".to_string()
                }
            }
            Action::ScheduleOnSite { on_site_at } => {
                app.inspection.on_site_scheduled_at = Some(*on_site_at);
                format!("on-site visit scheduled for {on_site_at}")
            }
            Action::RecordOnSiteResult {
                compliance_score,
                findings,
                passed,
            } => {
                let inspection = &mut app.inspection;
                inspection.on_site_completed_at = Some(now);
                inspection.compliance_score = *compliance_score;
                inspection.passed = Some(*passed);
                inspection.findings.push(InspectionFinding {
                    kind: InspectionKind::OnSite,
                    inspector_id: actor.id.clone(),
                    recorded_at: now,
                    notes: findings.clone(),
                });
                app.current_state = State::InspectionCompleted;
                format!(
                    "on-site inspection completed, score {}",
                    compliance_score.unwrap_or_default()
                )
            }
            Action::RequestApproval => {
                app.current_state = State::PendingApproval;
                "sent for final approval".to_string()
            }
            Action::DecideApproval { approved, reason } => {
                let approval = &mut app.approval;
                approval.decided_by = Some(actor.id.clone());
                approval.decided_at = Some(now);
                approval.reason = reason.clone();
                if *approved {
                    approval.decision = Some(ApprovalDecision::Approved);
                    app.current_state = State::Approved;
                    "application approved".to_string()
                } else {
                    approval.decision = Some(ApprovalDecision::Rejected);
                    app.current_state = State::Rejected;
                    format!("application rejected: {}", reason.as_deref().unwrap_or_default())
                }
            }
            Action::StartCertificate { number } => {
                app.certificate.number = Some(number.clone());
                app.current_state = State::CertificateGenerating;
                format!("generating certificate {number}")
            }
            Action::CompleteCertificate { artifact_ref } => {
                app.certificate.issued_at = Some(now);
                app.certificate.artifact_ref = Some(artifact_ref.clone());
                app.current_state = State::CertificateIssued;
                format!(
                    "certificate {} issued",
                    app.certificate.number.as_deref().unwrap_or_default()
                )
            }
            Action::Cancel { reason } => {
                release_hold(app);
                app.current_state = State::Cancelled;
                format!("cancelled: {reason}")
            }
            Action::Hold { reason } => {
                hold_from(app, from);
                app.current_state = State::OnHold;
                format!("put on hold from {from}: {reason}")
            }
            Action::Resume => {
                let target = app.held_from.take().ok_or_else(|| {
                    WorkflowError::GuardFailed(RuleViolation::new(
                        RuleCode::NotHeld,
                        "no held state recorded to resume into",
                    ))
                })?;
                if let Some(entered) = app.held_entered_version.take() {
                    app.state_entered_version = entered;
                }
                app.current_state = target;
                format!("resumed into {target}")
            }
            Action::Expire => {
                release_hold(app);
                app.current_state = State::Expired;
                format!("expired after inactivity in {from}")
            }
            Action::Override { .. } => return Err(invalid()),
        };

        let to = app.current_state;
        if !from.allows(to) {
            return Err(invalid());
        }
        if let Some(step) = to.step() {
            app.current_step = step;
        }
        Ok(note)
    }
}

/// Whether `action` is defined for `state`. Administrative actions are defined
/// for every non-terminal state except where noted.
fn is_defined(state: State, action: &Action) -> bool {
    match action {
        Action::Submit { .. } => state == State::Draft,
        Action::RequestPayment { phase: Phase::One, .. } => state == State::Submitted,
        Action::RequestPayment { phase: Phase::Two, .. } => state == State::DocumentApproved,
        Action::RecordPayment { phase: Phase::One, .. } => state == State::PaymentPending1,
        Action::RecordPayment { phase: Phase::Two, .. } => state == State::PaymentPending2,
        Action::ConfirmPayment { phase: Phase::One } => state == State::PaymentProcessing1,
        Action::ConfirmPayment { phase: Phase::Two } => state == State::PaymentProcessing2,
        Action::ReviewDocuments { .. } => state == State::DocumentReview,
        Action::ResubmitDocuments { .. } => state == State::DocumentRevision,
        Action::RestartPaymentCycle { .. } => state == State::DocumentRejected,
        Action::ScheduleInspection { .. } => state == State::InspectionScheduled,
        Action::RecordRemoteAssessment { .. } => state == State::InspectionRemote,
        Action::ScheduleOnSite { .. } | Action::RecordOnSiteResult { .. } => {
            state == State::InspectionOnSite
        }
        Action::RequestApproval => state == State::InspectionCompleted,
        Action::DecideApproval { .. } => state == State::PendingApproval,
        Action::StartCertificate { .. } => state == State::Approved,
        Action::CompleteCertificate { .. } => state == State::CertificateGenerating,
        Action::Cancel { .. } | Action::Expire => !state.is_terminal(),
        Action::Hold { .. } => !state.is_terminal() && state != State::OnHold,
        Action::Resume => state == State::OnHold,
        Action::Override { .. } => true,
    }
}

fn hold_from(app: &mut Application, from: State) {
    app.held_from = Some(from);
    app.held_entered_version = Some(app.state_entered_version);
}

fn release_hold(app: &mut Application) {
    app.held_from = None;
    app.held_entered_version = None;
}

fn advance_payment(
    record: &mut PaymentRecord,
    next: PaymentStatus,
    now: DateTime<Utc>,
) -> Result<(), WorkflowError> {
    if record.advance(next, now) {
        return Ok(());
    }
    Err(WorkflowError::GuardFailed(RuleViolation::new(
        RuleCode::PaymentStatusRegression,
        format!(
            "{} payment cannot move from {:?} to {next:?}",
            record.phase, record.status
        ),
    )))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::audit;
    use crate::repository::InMemoryRepository;
    use crate::state_machine::{PaymentEvidence, ReviewDecision, Role};

    const DOCS: [&str; 2] = ["id_card", "land_deed"];

    fn machine() -> WorkflowStateMachine {
        let repo: Arc<dyn ApplicationRepository> = Arc::new(InMemoryRepository::new());
        let required = DOCS.iter().map(|s| s.to_string()).collect();
        WorkflowStateMachine::new(repo, Validator::new(required), 2)
    }

    fn documents() -> BTreeSet<String> {
        DOCS.iter().map(|s| s.to_string()).collect()
    }

    fn applicant() -> Actor {
        Actor::new("farmer-1", Role::Applicant)
    }

    fn reviewer() -> Actor {
        Actor::new("reviewer-1", Role::Reviewer)
    }

    fn inspector() -> Actor {
        Actor::new("inspector-1", Role::Inspector)
    }

    async fn step(
        m: &WorkflowStateMachine,
        app: &Application,
        action: Action,
        actor: &Actor,
    ) -> Application {
        m.transition(app.id, action, actor, app.version)
            .await
            .unwrap()
            .application
    }

    /// Drive a fresh application to DOCUMENT_REVIEW.
    async fn in_review(m: &WorkflowStateMachine) -> Application {
        let app = m.create("farmer-1", &applicant()).await.unwrap();
        let app = step(m, &app, Action::Submit { documents: documents() }, &applicant()).await;
        let app = step(
            m,
            &app,
            Action::RequestPayment {
                phase: Phase::One,
                amount: 5000,
            },
            &Actor::system(),
        )
        .await;
        let app = step(
            m,
            &app,
            Action::RecordPayment {
                phase: Phase::One,
                evidence: PaymentEvidence {
                    transaction_id: "tx-1".into(),
                    amount: 5000,
                },
            },
            &applicant(),
        )
        .await;
        step(m, &app, Action::ConfirmPayment { phase: Phase::One }, &Actor::system()).await
    }

    /// Drive a fresh application to INSPECTION_REMOTE.
    async fn in_remote_inspection(m: &WorkflowStateMachine) -> Application {
        let app = in_review(m).await;
        let app = step(
            m,
            &app,
            Action::ReviewDocuments {
                decision: ReviewDecision::approve(),
            },
            &reviewer(),
        )
        .await;
        let app = step(
            m,
            &app,
            Action::RequestPayment {
                phase: Phase::Two,
                amount: 25_000,
            },
            &Actor::system(),
        )
        .await;
        let app = step(
            m,
            &app,
            Action::RecordPayment {
                phase: Phase::Two,
                evidence: PaymentEvidence {
                    transaction_id: "tx-2".into(),
                    amount: 25_000,
                },
            },
            &applicant(),
        )
        .await;
        let app = step(m, &app, Action::ConfirmPayment { phase: Phase::Two }, &Actor::system()).await;
        assert_eq!(app.current_state, State::InspectionScheduled);
        step(
            m,
            &app,
            Action::ScheduleInspection {
                remote_at: Utc::now(),
            },
            &inspector(),
        )
        .await
    }

    fn reject() -> Action {
        Action::ReviewDocuments {
            decision: ReviewDecision::reject(vec!["blurry deed".into()], vec!["rescan".into()]),
        }
    }

    #[tokio::test]
    async fn submit_requires_documents() {
        let m = machine();
        let app = m.create("farmer-1", &applicant()).await.unwrap();
        let err = m
            .transition(
                app.id,
                Action::Submit {
                    documents: BTreeSet::from(["id_card".to_string()]),
                },
                &applicant(),
                app.version,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::GuardFailed(ref v) if v.code == RuleCode::MissingDocuments));
        assert_eq!(m.repository().load(app.id).await.unwrap(), app);
    }

    #[tokio::test]
    async fn submit_issues_payment_request_command() {
        let m = machine();
        let app = m.create("farmer-1", &applicant()).await.unwrap();
        let outcome = m
            .transition(app.id, Action::Submit { documents: documents() }, &applicant(), 1)
            .await
            .unwrap();
        assert_eq!(outcome.state(), State::Submitted);
        assert_eq!(outcome.version(), 2);
        assert_eq!(outcome.commands, vec![Command::RequestPayment { phase: Phase::One }]);
        assert_eq!(outcome.entry.from_state, Some(State::Draft));

        let outbox = m.repository().outbox(app.id).await.unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].key.entered_version, 2);
    }

    #[tokio::test]
    async fn stale_version_never_mutates() {
        let m = machine();
        let app = m.create("farmer-1", &applicant()).await.unwrap();
        step(&m, &app, Action::Submit { documents: documents() }, &applicant()).await;
        let before = m.repository().load(app.id).await.unwrap();

        let err = m
            .transition(
                app.id,
                Action::Cancel {
                    reason: "duplicate".into(),
                },
                &Actor::new("admin", Role::Admin),
                app.version,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::VersionConflict { expected: 1, actual: 2 }));
        assert_eq!(m.repository().load(app.id).await.unwrap(), before);
        assert_eq!(m.repository().history(app.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn undefined_action_is_invalid_transition() {
        let m = machine();
        let app = m.create("farmer-1", &applicant()).await.unwrap();
        let err = m
            .transition(app.id, Action::ConfirmPayment { phase: Phase::One }, &Actor::system(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::InvalidTransition { state: State::Draft, action: "CONFIRM_PAYMENT_1" }
        ));
    }

    #[tokio::test]
    async fn wrong_role_is_forbidden() {
        let m = machine();
        let app = m.create("farmer-1", &applicant()).await.unwrap();
        let err = m
            .transition(app.id, Action::Submit { documents: documents() }, &reviewer(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden { role: Role::Reviewer, .. }));
    }

    #[tokio::test]
    async fn payment_amount_mismatch_is_guarded() {
        let m = machine();
        let app = m.create("farmer-1", &applicant()).await.unwrap();
        let app = step(&m, &app, Action::Submit { documents: documents() }, &applicant()).await;
        let app = step(
            &m,
            &app,
            Action::RequestPayment {
                phase: Phase::One,
                amount: 5000,
            },
            &Actor::system(),
        )
        .await;
        let err = m
            .transition(
                app.id,
                Action::RecordPayment {
                    phase: Phase::One,
                    evidence: PaymentEvidence {
                        transaction_id: "tx".into(),
                        amount: 500,
                    },
                },
                &applicant(),
                app.version,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::GuardFailed(ref v) if v.code == RuleCode::PaymentAmountMismatch));
    }

    #[tokio::test]
    async fn second_rejection_expires_payment_one() {
        let m = machine();
        let app = in_review(&m).await;
        assert_eq!(app.current_state, State::DocumentReview);
        assert_eq!(app.payment1.status, PaymentStatus::Completed);

        let app = step(&m, &app, reject(), &reviewer()).await;
        assert_eq!(app.current_state, State::DocumentRevision);
        assert_eq!(app.document_review.rejection_count, 1);

        let app = step(
            &m,
            &app,
            Action::ResubmitDocuments {
                documents: documents(),
            },
            &applicant(),
        )
        .await;
        assert_eq!(app.current_state, State::DocumentReview);

        let app = step(&m, &app, reject(), &reviewer()).await;
        assert_eq!(app.current_state, State::DocumentRejected);
        assert_eq!(app.document_review.rejection_count, 2);
        assert_eq!(app.payment1.status, PaymentStatus::Expired);
        assert_eq!(app.current_step, 2);
    }

    #[tokio::test]
    async fn restart_cycle_archives_expired_payment() {
        let m = machine();
        let app = in_review(&m).await;
        let app = step(&m, &app, reject(), &reviewer()).await;
        let app = step(&m, &app, Action::ResubmitDocuments { documents: documents() }, &applicant()).await;
        let app = step(&m, &app, reject(), &reviewer()).await;

        let outcome = m
            .transition(
                app.id,
                Action::RestartPaymentCycle { amount: 5000 },
                &Actor::system(),
                app.version,
            )
            .await
            .unwrap();
        let app = outcome.application;
        assert_eq!(app.current_state, State::PaymentPending1);
        assert_eq!(app.payment_cycle, 2);
        assert_eq!(app.document_review.rejection_count, 0);
        assert_eq!(app.payment1.status, PaymentStatus::Pending);
        assert_eq!(app.expired_payments.len(), 1);
        assert_eq!(app.expired_payments[0].status, PaymentStatus::Expired);
        assert_eq!(app.document_review.reviews.len(), 2);
    }

    #[tokio::test]
    async fn remote_only_inspection_completes_directly() {
        let m = machine();
        let app = in_remote_inspection(&m).await;
        let app = step(
            &m,
            &app,
            Action::RecordRemoteAssessment {
                findings: vec!["records complete".into()],
                on_site_required: false,
            },
            &inspector(),
        )
        .await;
        assert_eq!(app.current_state, State::InspectionCompleted);
        assert!(app.inspection.on_site_completed_at.is_none());
    }

    #[tokio::test]
    async fn on_site_branch_requires_result() {
        let m = machine();
        let app = in_remote_inspection(&m).await;
        let app = step(
            &m,
            &app,
            Action::RecordRemoteAssessment {
                findings: vec!["storage unclear".into()],
                on_site_required: true,
            },
            &inspector(),
        )
        .await;
        assert_eq!(app.current_state, State::InspectionOnSite);

        let err = m
            .transition(app.id, Action::RequestApproval, &Actor::system(), app.version)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));

        let app = step(
            &m,
            &app,
            Action::ScheduleOnSite {
                on_site_at: Utc::now(),
            },
            &inspector(),
        )
        .await;
        assert_eq!(app.current_state, State::InspectionOnSite);
        assert_eq!(app.state_entered_version, app.version - 1);

        let err = m
            .transition(
                app.id,
                Action::RecordOnSiteResult {
                    compliance_score: None,
                    findings: vec!["ok".into()],
                    passed: true,
                },
                &inspector(),
                app.version,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::GuardFailed(ref v) if v.code == RuleCode::ComplianceScoreRequired));

        let app = step(
            &m,
            &app,
            Action::RecordOnSiteResult {
                compliance_score: Some(88),
                findings: vec!["storage dry and clean".into()],
                passed: true,
            },
            &inspector(),
        )
        .await;
        assert_eq!(app.current_state, State::InspectionCompleted);
        assert_eq!(app.inspection.compliance_score, Some(88));
    }

    #[tokio::test]
    async fn hold_and_resume_restore_state() {
        let m = machine();
        let app = in_review(&m).await;
        let admin = Actor::new("admin-1", Role::Admin);
        let outcome = m
            .transition(
                app.id,
                Action::Hold {
                    reason: "fraud check".into(),
                },
                &admin,
                app.version,
            )
            .await
            .unwrap();
        assert_eq!(outcome.state(), State::OnHold);
        assert_eq!(outcome.application.held_from, Some(State::DocumentReview));

        let outcome = m
            .transition(app.id, Action::Resume, &admin, outcome.version())
            .await
            .unwrap();
        assert_eq!(outcome.state(), State::DocumentReview);
        assert!(outcome.application.held_from.is_none());
        assert_eq!(outcome.application.current_step, 3);
        assert_eq!(outcome.application.state_entered_version, app.state_entered_version);
        assert!(outcome.commands.is_empty());
    }

    #[tokio::test]
    async fn override_into_certificate_states_needs_number() {
        let m = machine();
        let app = in_review(&m).await;
        let admin = Actor::new("admin-1", Role::Admin);
        for target in [State::CertificateGenerating, State::CertificateIssued] {
            let err = m
                .transition(
                    app.id,
                    Action::Override {
                        target,
                        reason: "skip ahead".into(),
                    },
                    &admin,
                    app.version,
                )
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                WorkflowError::GuardFailed(ref v) if v.code == RuleCode::CertificateNumberRequired
            ));
        }
        let stored = m.repository().load(app.id).await.unwrap();
        assert_eq!(stored, app);
    }

    #[tokio::test]
    async fn override_into_hold_can_be_resumed() {
        let m = machine();
        let app = in_review(&m).await;
        let admin = Actor::new("admin-1", Role::Admin);
        let held = step(
            &m,
            &app,
            Action::Override {
                target: State::OnHold,
                reason: "regulator query".into(),
            },
            &admin,
        )
        .await;
        assert_eq!(held.current_state, State::OnHold);
        assert_eq!(held.held_from, Some(State::DocumentReview));
        assert_eq!(held.held_entered_version, Some(app.state_entered_version));

        let resumed = step(&m, &held, Action::Resume, &admin).await;
        assert_eq!(resumed.current_state, State::DocumentReview);
        assert_eq!(resumed.state_entered_version, app.state_entered_version);
        assert!(resumed.held_entered_version.is_none());
    }

    #[tokio::test]
    async fn terminal_state_only_yields_to_override() {
        let m = machine();
        let app = m.create("farmer-1", &applicant()).await.unwrap();
        let admin = Actor::new("admin-1", Role::Admin);
        let app = step(
            &m,
            &app,
            Action::Cancel {
                reason: "withdrawn".into(),
            },
            &admin,
        )
        .await;
        assert_eq!(app.current_state, State::Cancelled);

        let err = m
            .transition(
                app.id,
                Action::Hold {
                    reason: "look again".into(),
                },
                &admin,
                app.version,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { state: State::Cancelled, .. }));

        let app = step(
            &m,
            &app,
            Action::Override {
                target: State::Draft,
                reason: "withdrawal entered by mistake".into(),
            },
            &admin,
        )
        .await;
        assert_eq!(app.current_state, State::Draft);
        let history = m.repository().history(app.id).await.unwrap();
        assert_eq!(history.last().unwrap().action, "OVERRIDE");
        assert_eq!(audit::verify(&app, &history), Ok(()));
    }

    #[tokio::test]
    async fn rejection_decision_needs_reason() {
        let m = machine();
        let mut app = m.create("farmer-1", &applicant()).await.unwrap();
        app.current_state = State::PendingApproval;
        let approver = Actor::new("approver-1", Role::Approver);
        let err = m
            .apply(
                &mut app.clone(),
                &Action::DecideApproval {
                    approved: false,
                    reason: None,
                },
                &approver,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, WorkflowError::GuardFailed(ref v) if v.code == RuleCode::ReasonRequired));

        let note = m
            .apply(
                &mut app,
                &Action::DecideApproval {
                    approved: false,
                    reason: Some("residue above limit".into()),
                },
                &approver,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(app.current_state, State::Rejected);
        assert_eq!(app.approval.decision, Some(ApprovalDecision::Rejected));
        assert!(note.contains("residue above limit"));
    }
}
