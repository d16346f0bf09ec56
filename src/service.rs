//! Application-facing operations.
//!
//! [`CertificationService`] wraps the state machine with one method per
//! lifecycle operation, the read model and the maintenance jobs (expiry
//! sweep, outbox drain). Every mutating call takes the version the caller
//! last saw.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{AuditRecord, HistoryEntry};
use crate::collaborators::Collaborators;
use crate::config::CertflowConfig;
use crate::error::WorkflowError;
use crate::orchestrator::{DrainReport, Orchestrator, RetryPolicy};
use crate::repository::ApplicationRepository;
use crate::state_machine::{
    Action, Actor, Application, ApplicationId, PaymentEvidence, Phase, ReviewDecision, Role,
    State, TransitionOutcome, WorkflowStateMachine, certificate_number,
};
use crate::validator::Validator;

/// Result of an inspection visit.
#[derive(Debug, Clone, PartialEq)]
pub enum InspectionResult {
    Remote {
        findings: Vec<String>,
        on_site_required: bool,
    },
    OnSite {
        compliance_score: u8,
        findings: Vec<String>,
        passed: bool,
    },
}

/// Read model: the aggregate and its full history.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationView {
    pub application: Application,
    pub history: Vec<HistoryEntry>,
}

impl ApplicationView {
    pub fn state(&self) -> State {
        self.application.current_state
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Statistics {
    pub total: usize,
    pub by_state: BTreeMap<State, usize>,
    pub active: usize,
    pub certificates_issued: usize,
    pub rejected: usize,
    pub on_hold: usize,
    /// Mean time from creation to certificate, over issued applications.
    pub average_completion_ms: Option<i64>,
}

pub struct CertificationService {
    machine: Arc<WorkflowStateMachine>,
    repository: Arc<dyn ApplicationRepository>,
    orchestrator: Orchestrator,
    idle_timeouts: BTreeMap<State, Duration>,
}

impl CertificationService {
    pub fn new(
        machine: Arc<WorkflowStateMachine>,
        orchestrator: Orchestrator,
        idle_timeouts: BTreeMap<State, Duration>,
    ) -> Self {
        let repository = Arc::clone(machine.repository());
        Self {
            machine,
            repository,
            orchestrator,
            idle_timeouts,
        }
    }

    /// Wire the service from configuration.
    pub fn from_config(
        config: &CertflowConfig,
        repository: Arc<dyn ApplicationRepository>,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        let validator = Validator::new(config.documents.required.clone());
        let machine = Arc::new(WorkflowStateMachine::new(
            repository,
            validator,
            config.review.max_rejections,
        ));
        let orchestrator = Orchestrator::new(
            Arc::clone(&machine),
            collaborators,
            RetryPolicy::from(&config.outbox),
        );
        Ok(Self::new(machine, orchestrator, config.expiry.timeouts()?))
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub async fn create_draft(&self, applicant_id: &str) -> Result<Application, WorkflowError> {
        let actor = Actor::new(applicant_id, Role::Applicant);
        self.machine.create(applicant_id, &actor).await
    }

    pub async fn submit(
        &self,
        id: ApplicationId,
        actor: &Actor,
        documents: BTreeSet<String>,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.transition(id, Action::Submit { documents }, actor, expected_version)
            .await
    }

    pub async fn record_payment(
        &self,
        id: ApplicationId,
        actor: &Actor,
        phase: Phase,
        evidence: PaymentEvidence,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.transition(
            id,
            Action::RecordPayment { phase, evidence },
            actor,
            expected_version,
        )
        .await
    }

    pub async fn review_documents(
        &self,
        id: ApplicationId,
        reviewer: &Actor,
        decision: ReviewDecision,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.transition(
            id,
            Action::ReviewDocuments { decision },
            reviewer,
            expected_version,
        )
        .await
    }

    pub async fn resubmit_documents(
        &self,
        id: ApplicationId,
        actor: &Actor,
        documents: BTreeSet<String>,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.transition(
            id,
            Action::ResubmitDocuments { documents },
            actor,
            expected_version,
        )
        .await
    }

    pub async fn schedule_inspection(
        &self,
        id: ApplicationId,
        inspector: &Actor,
        remote_at: DateTime<Utc>,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.transition(
            id,
            Action::ScheduleInspection { remote_at },
            inspector,
            expected_version,
        )
        .await
    }

    pub async fn record_inspection_result(
        &self,
        id: ApplicationId,
        inspector: &Actor,
        result: InspectionResult,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let action = match result {
            InspectionResult::Remote {
                findings,
                on_site_required,
            } => Action::RecordRemoteAssessment {
                findings,
                on_site_required,
            },
            InspectionResult::OnSite {
                compliance_score,
                findings,
                passed,
            } => Action::RecordOnSiteResult {
                compliance_score: Some(compliance_score),
                findings,
                passed,
            },
        };
        self.transition(id, action, inspector, expected_version).await
    }

    pub async fn schedule_on_site_inspection(
        &self,
        id: ApplicationId,
        inspector: &Actor,
        on_site_at: DateTime<Utc>,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.transition(
            id,
            Action::ScheduleOnSite { on_site_at },
            inspector,
            expected_version,
        )
        .await
    }

    pub async fn decide_approval(
        &self,
        id: ApplicationId,
        decider: &Actor,
        approved: bool,
        reason: Option<String>,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.transition(
            id,
            Action::DecideApproval { approved, reason },
            decider,
            expected_version,
        )
        .await
    }

    /// Assign a certificate number and start generation. Rendering finishes
    /// asynchronously through the outbox.
    pub async fn issue_certificate(
        &self,
        id: ApplicationId,
        actor: &Actor,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let number = certificate_number(id, Utc::now());
        self.transition(
            id,
            Action::StartCertificate { number },
            actor,
            expected_version,
        )
        .await
    }

    pub async fn cancel(
        &self,
        id: ApplicationId,
        admin: &Actor,
        reason: &str,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let action = Action::Cancel {
            reason: reason.to_string(),
        };
        self.transition(id, action, admin, expected_version).await
    }

    pub async fn hold(
        &self,
        id: ApplicationId,
        admin: &Actor,
        reason: &str,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let action = Action::Hold {
            reason: reason.to_string(),
        };
        self.transition(id, action, admin, expected_version).await
    }

    /// Return a held application to the state entry it was held in. Work
    /// queued for that entry continues under its original idempotency keys.
    pub async fn resume(
        &self,
        id: ApplicationId,
        admin: &Actor,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.transition(id, Action::Resume, admin, expected_version)
            .await
    }

    pub async fn override_state(
        &self,
        id: ApplicationId,
        admin: &Actor,
        target: State,
        reason: &str,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let action = Action::Override {
            target,
            reason: reason.to_string(),
        };
        self.transition(id, action, admin, expected_version).await
    }

    pub async fn get_state(&self, id: ApplicationId) -> Result<ApplicationView, WorkflowError> {
        let application = self.repository.load(id).await?;
        let history = self.repository.history(id).await?;
        Ok(ApplicationView {
            application,
            history,
        })
    }

    pub async fn audit_record(&self, id: ApplicationId) -> Result<AuditRecord, WorkflowError> {
        let view = self.get_state(id).await?;
        Ok(AuditRecord::from_history(&view.application, &view.history))
    }

    /// Applications in creation order, optionally filtered by state.
    pub async fn list_by_state(
        &self,
        state: Option<State>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Application>, WorkflowError> {
        Ok(self
            .repository
            .list()
            .await?
            .into_iter()
            .filter(|app| state.is_none_or(|s| app.current_state == s))
            .skip(offset)
            .take(limit)
            .collect())
    }

    pub async fn statistics(&self) -> Result<Statistics, WorkflowError> {
        let apps = self.repository.list().await?;
        let mut stats = Statistics {
            total: apps.len(),
            ..Statistics::default()
        };
        let mut completion_ms = Vec::new();
        for app in &apps {
            *stats.by_state.entry(app.current_state).or_default() += 1;
            match app.current_state {
                State::CertificateIssued => {
                    stats.certificates_issued += 1;
                    if let Some(issued_at) = app.certificate.issued_at {
                        completion_ms.push((issued_at - app.created_at).num_milliseconds());
                    }
                }
                State::Rejected => stats.rejected += 1,
                State::OnHold => stats.on_hold += 1,
                _ => {}
            }
            if !app.is_terminal() {
                stats.active += 1;
            }
        }
        if !completion_ms.is_empty() {
            let sum: i64 = completion_ms.iter().sum();
            stats.average_completion_ms = Some(sum / completion_ms.len() as i64);
        }
        Ok(stats)
    }

    /// Expire applications idle in a time-bounded state for longer than its
    /// timeout. Applications that change concurrently are left for the next
    /// sweep.
    pub async fn expire_stale(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApplicationId>, WorkflowError> {
        let mut expired = Vec::new();
        let system = Actor::system();
        for app in self.repository.list().await? {
            let Some(timeout) = self.idle_timeouts.get(&app.current_state) else {
                continue;
            };
            if now - app.updated_at < *timeout {
                continue;
            }
            match self
                .machine
                .transition(app.id, Action::Expire, &system, app.version)
                .await
            {
                Ok(_) => expired.push(app.id),
                Err(e) if e.is_retryable() => {
                    warn!(application_id = %app.id, "changed during expiry sweep, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired idle applications");
        }
        Ok(expired)
    }

    /// Deliver everything currently due in the outbox.
    pub async fn drain(&self) -> Result<DrainReport, WorkflowError> {
        self.orchestrator.drain_until_idle().await
    }

    async fn transition(
        &self,
        id: ApplicationId,
        action: Action,
        actor: &Actor,
        expected_version: u64,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.machine
            .transition(id, action, actor, expected_version)
            .await
    }
}
