//! Business rules evaluated before a transition commits.
//!
//! Everything here is pure: functions take the aggregate (or the part of it
//! they need) plus the action payload and answer pass or fail with a
//! [`RuleCode`]. Nothing touches persistence, so each rule can be tested in
//! isolation.
//!
//! Two layers are kept apart. [`validate_input`] rejects malformed payloads
//! regardless of state (surfaced as `ValidationError`); [`Validator::check`]
//! evaluates business rules against the current aggregate (surfaced as
//! `GuardFailed`).

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state_machine::{
    Action, Actor, Application, Certificate, DocumentReview, Inspection, PaymentEvidence,
    PaymentRecord, State,
};

/// Structured reason codes. Presentation layers translate these; the core
/// never produces localized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleCode {
    MissingDocuments,
    RejectionThresholdReached,
    PaymentNotRequested,
    PaymentAmountMismatch,
    PaymentStatusRegression,
    RemoteNotScheduled,
    OnSiteNotRequired,
    ComplianceScoreRequired,
    FindingsRequired,
    ReasonRequired,
    NotHeld,
    CertificateNumberRequired,
}

impl RuleCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleCode::MissingDocuments => "MISSING_DOCUMENTS",
            RuleCode::RejectionThresholdReached => "REJECTION_THRESHOLD_REACHED",
            RuleCode::PaymentNotRequested => "PAYMENT_NOT_REQUESTED",
            RuleCode::PaymentAmountMismatch => "PAYMENT_AMOUNT_MISMATCH",
            RuleCode::PaymentStatusRegression => "PAYMENT_STATUS_REGRESSION",
            RuleCode::RemoteNotScheduled => "REMOTE_NOT_SCHEDULED",
            RuleCode::OnSiteNotRequired => "ON_SITE_NOT_REQUIRED",
            RuleCode::ComplianceScoreRequired => "COMPLIANCE_SCORE_REQUIRED",
            RuleCode::FindingsRequired => "FINDINGS_REQUIRED",
            RuleCode::ReasonRequired => "REASON_REQUIRED",
            RuleCode::NotHeld => "NOT_HELD",
            RuleCode::CertificateNumberRequired => "CERTIFICATE_NUMBER_REQUIRED",
        }
    }
}

impl fmt::Display for RuleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named business rule that was not met.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub code: RuleCode,
    pub detail: String,
}

impl RuleViolation {
    pub fn new(code: RuleCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}

pub type RuleResult = Result<(), RuleViolation>;

/// Where a failing document review leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionOutcome {
    /// Under the threshold: the applicant may correct and resubmit.
    Revise,
    /// Threshold reached: payment 1 expires and the cycle restarts.
    Reject,
}

/// Stateless rule set. Holds only configuration.
#[derive(Debug, Clone)]
pub struct Validator {
    required_documents: Vec<String>,
}

impl Validator {
    pub fn new(required_documents: Vec<String>) -> Self {
        Self { required_documents }
    }

    /// Evaluate the guard for `action` against the aggregate as it is now.
    /// Actions without a business rule pass.
    pub fn check(&self, app: &Application, action: &Action) -> RuleResult {
        match action {
            Action::Submit { documents } | Action::ResubmitDocuments { documents } => {
                document_completeness(documents, &self.required_documents)
            }
            Action::RecordPayment { phase, evidence } => {
                payment_amount_matches(app.payment(*phase), evidence)
            }
            Action::ReviewDocuments { .. } => review_allowed(&app.document_review),
            Action::RecordRemoteAssessment { .. } => remote_assessment_eligible(&app.inspection),
            Action::ScheduleOnSite { .. } => on_site_eligible(&app.inspection),
            Action::RecordOnSiteResult {
                compliance_score,
                findings,
                ..
            } => {
                on_site_eligible(&app.inspection)?;
                on_site_result(*compliance_score, findings)
            }
            Action::DecideApproval { approved, reason } => {
                approval_reason(*approved, reason.as_deref())
            }
            Action::Resume => match app.held_from {
                Some(_) => Ok(()),
                None => Err(RuleViolation::new(
                    RuleCode::NotHeld,
                    "no held state recorded to resume into",
                )),
            },
            Action::Override { target, .. } => override_target(&app.certificate, *target),
            _ => Ok(()),
        }
    }
}

/// All required document categories must be present.
pub fn document_completeness(documents: &BTreeSet<String>, required: &[String]) -> RuleResult {
    let missing: Vec<&str> = required
        .iter()
        .filter(|category| !documents.contains(category.as_str()))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RuleViolation::new(
            RuleCode::MissingDocuments,
            format!("missing document categories: {}", missing.join(", ")),
        ))
    }
}

/// A review may only happen while the rejection count is under the limit.
pub fn review_allowed(review: &DocumentReview) -> RuleResult {
    if review.rejection_count >= review.max_rejections {
        return Err(RuleViolation::new(
            RuleCode::RejectionThresholdReached,
            format!(
                "rejection limit of {} already reached",
                review.max_rejections
            ),
        ));
    }
    Ok(())
}

/// An override cannot land where the certificate is rendered or shown unless
/// a number was assigned.
pub fn override_target(certificate: &Certificate, target: State) -> RuleResult {
    let needs_number = matches!(
        target,
        State::CertificateGenerating | State::CertificateIssued
    );
    if needs_number && certificate.number.is_none() {
        return Err(RuleViolation::new(
            RuleCode::CertificateNumberRequired,
            format!("no certificate number assigned, cannot override into {target}"),
        ));
    }
    Ok(())
}

/// Outcome of a failing review, given the count after incrementing it.
pub fn rejection_outcome(rejection_count: u32, max_rejections: u32) -> RejectionOutcome {
    if rejection_count >= max_rejections {
        RejectionOutcome::Reject
    } else {
        RejectionOutcome::Revise
    }
}

/// The paid amount must equal the requested fee.
pub fn payment_amount_matches(record: &PaymentRecord, evidence: &PaymentEvidence) -> RuleResult {
    if record.requested_at.is_none() {
        return Err(RuleViolation::new(
            RuleCode::PaymentNotRequested,
            format!("no fee has been requested for {}", record.phase),
        ));
    }
    if evidence.amount != record.amount {
        return Err(RuleViolation::new(
            RuleCode::PaymentAmountMismatch,
            format!(
                "paid {} but {} requires {}",
                evidence.amount, record.phase, record.amount
            ),
        ));
    }
    Ok(())
}

pub fn remote_assessment_eligible(inspection: &Inspection) -> RuleResult {
    if inspection.remote_scheduled_at.is_none() {
        return Err(RuleViolation::new(
            RuleCode::RemoteNotScheduled,
            "remote assessment has not been scheduled",
        ));
    }
    Ok(())
}

/// The on-site branch is only open when the remote assessment asked for it.
pub fn on_site_eligible(inspection: &Inspection) -> RuleResult {
    if !inspection.on_site_required {
        return Err(RuleViolation::new(
            RuleCode::OnSiteNotRequired,
            "remote assessment did not require an on-site visit",
        ));
    }
    Ok(())
}

pub fn on_site_result(compliance_score: Option<u8>, findings: &[String]) -> RuleResult {
    if compliance_score.is_none() {
        return Err(RuleViolation::new(
            RuleCode::ComplianceScoreRequired,
            "on-site result needs a compliance score",
        ));
    }
    if findings.iter().all(|f| f.trim().is_empty()) {
        return Err(RuleViolation::new(
            RuleCode::FindingsRequired,
            "on-site result needs at least one finding",
        ));
    }
    Ok(())
}

pub fn approval_reason(approved: bool, reason: Option<&str>) -> RuleResult {
    if approved {
        return Ok(());
    }
    match reason {
        Some(r) if !r.trim().is_empty() => Ok(()),
        _ => Err(RuleViolation::new(
            RuleCode::ReasonRequired,
            "a rejection needs a reason",
        )),
    }
}

/// Shape checks on the payload and actor, independent of state.
pub fn validate_input(action: &Action, actor: &Actor) -> Result<(), String> {
    if actor.id.trim().is_empty() {
        return Err("actor id must not be empty".into());
    }
    match action {
        Action::RecordPayment { evidence, .. } => {
            if evidence.transaction_id.trim().is_empty() {
                return Err("transaction id must not be empty".into());
            }
        }
        Action::RequestPayment { amount, .. } | Action::RestartPaymentCycle { amount } => {
            if *amount == 0 {
                return Err("fee amount must be positive".into());
            }
        }
        Action::RecordOnSiteResult {
            compliance_score: Some(score),
            ..
        } if *score > 100 => {
            return Err(format!("compliance score {score} is outside 0..=100"));
        }
        Action::StartCertificate { number } if number.trim().is_empty() => {
            return Err("certificate number must not be empty".into());
        }
        Action::CompleteCertificate { artifact_ref } if artifact_ref.trim().is_empty() => {
            return Err("artifact reference must not be empty".into());
        }
        Action::Cancel { reason } | Action::Hold { reason } | Action::Override { reason, .. }
            if reason.trim().is_empty() =>
        {
            return Err(format!("{} requires a reason", action.name()));
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{Phase, ReviewDecision, Role};
    use chrono::Utc;

    fn required() -> Vec<String> {
        ["id_card", "land_deed", "farm_map"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn docs(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn override_into_certificate_states_needs_number() {
        let mut certificate = Certificate::default();
        for target in [State::CertificateGenerating, State::CertificateIssued] {
            let err = override_target(&certificate, target).unwrap_err();
            assert_eq!(err.code, RuleCode::CertificateNumberRequired);
        }
        assert!(override_target(&certificate, State::PendingApproval).is_ok());

        certificate.number = Some("CERT-20261015-ABC123".into());
        assert!(override_target(&certificate, State::CertificateIssued).is_ok());
    }

    #[test]
    fn complete_documents_pass() {
        let result = document_completeness(&docs(&["id_card", "land_deed", "farm_map"]), &required());
        assert!(result.is_ok());
    }

    #[test]
    fn missing_documents_are_named() {
        let err = document_completeness(&docs(&["id_card"]), &required()).unwrap_err();
        assert_eq!(err.code, RuleCode::MissingDocuments);
        assert_eq!(err.detail, "missing document categories: land_deed, farm_map");
    }

    #[test]
    fn rejection_outcome_at_threshold() {
        assert_eq!(rejection_outcome(1, 2), RejectionOutcome::Revise);
        assert_eq!(rejection_outcome(2, 2), RejectionOutcome::Reject);
        assert_eq!(rejection_outcome(1, 1), RejectionOutcome::Reject);
    }

    #[test]
    fn review_blocked_once_limit_reached() {
        let mut review = DocumentReview::new(2);
        assert!(review_allowed(&review).is_ok());
        review.rejection_count = 2;
        let err = review_allowed(&review).unwrap_err();
        assert_eq!(err.code, RuleCode::RejectionThresholdReached);
    }

    #[test]
    fn payment_amount_must_match_requested_fee() {
        let mut record = PaymentRecord::new(Phase::One);
        let evidence = PaymentEvidence {
            transaction_id: "tx-1".into(),
            amount: 5000,
        };
        let err = payment_amount_matches(&record, &evidence).unwrap_err();
        assert_eq!(err.code, RuleCode::PaymentNotRequested);

        record.requested_at = Some(Utc::now());
        record.amount = 5000;
        assert!(payment_amount_matches(&record, &evidence).is_ok());

        let short = PaymentEvidence {
            transaction_id: "tx-1".into(),
            amount: 4999,
        };
        let err = payment_amount_matches(&record, &short).unwrap_err();
        assert_eq!(err.code, RuleCode::PaymentAmountMismatch);
    }

    #[test]
    fn on_site_branch_requires_flag() {
        let mut inspection = Inspection::default();
        assert_eq!(
            on_site_eligible(&inspection).unwrap_err().code,
            RuleCode::OnSiteNotRequired
        );
        inspection.on_site_required = true;
        assert!(on_site_eligible(&inspection).is_ok());
    }

    #[test]
    fn remote_assessment_requires_schedule() {
        let mut inspection = Inspection::default();
        assert_eq!(
            remote_assessment_eligible(&inspection).unwrap_err().code,
            RuleCode::RemoteNotScheduled
        );
        inspection.remote_scheduled_at = Some(Utc::now());
        assert!(remote_assessment_eligible(&inspection).is_ok());
    }

    #[test]
    fn on_site_result_needs_score_and_findings() {
        let findings = vec!["storage is dry".to_string()];
        assert_eq!(
            on_site_result(None, &findings).unwrap_err().code,
            RuleCode::ComplianceScoreRequired
        );
        assert_eq!(
            on_site_result(Some(85), &["  ".to_string()]).unwrap_err().code,
            RuleCode::FindingsRequired
        );
        assert!(on_site_result(Some(85), &findings).is_ok());
    }

    #[test]
    fn rejection_requires_reason() {
        assert!(approval_reason(true, None).is_ok());
        assert_eq!(
            approval_reason(false, None).unwrap_err().code,
            RuleCode::ReasonRequired
        );
        assert_eq!(
            approval_reason(false, Some(" ")).unwrap_err().code,
            RuleCode::ReasonRequired
        );
        assert!(approval_reason(false, Some("pesticide residue")).is_ok());
    }

    #[test]
    fn check_dispatches_by_action() {
        let validator = Validator::new(required());
        let app = Application::draft("farmer", 2, Utc::now());
        let review = Action::ReviewDocuments {
            decision: ReviewDecision::approve(),
        };
        assert!(validator.check(&app, &review).is_ok());
        assert_eq!(
            validator.check(&app, &Action::Resume).unwrap_err().code,
            RuleCode::NotHeld
        );
        let submit = Action::Submit {
            documents: docs(&["id_card"]),
        };
        assert_eq!(
            validator.check(&app, &submit).unwrap_err().code,
            RuleCode::MissingDocuments
        );
    }

    #[test]
    fn malformed_input_is_rejected() {
        let applicant = Actor::new("farmer", Role::Applicant);
        let blank_tx = Action::RecordPayment {
            phase: Phase::One,
            evidence: PaymentEvidence {
                transaction_id: " ".into(),
                amount: 5000,
            },
        };
        assert!(validate_input(&blank_tx, &applicant).is_err());

        let score = Action::RecordOnSiteResult {
            compliance_score: Some(101),
            findings: vec!["x".into()],
            passed: true,
        };
        assert!(validate_input(&score, &Actor::new("insp", Role::Inspector)).is_err());

        let cancel = Action::Cancel { reason: "".into() };
        assert_eq!(
            validate_input(&cancel, &Actor::new("admin", Role::Admin)).unwrap_err(),
            "CANCEL requires a reason"
        );

        assert!(validate_input(&Action::Resume, &Actor::new("", Role::Admin)).is_err());
        assert!(validate_input(&Action::Resume, &Actor::new("admin", Role::Admin)).is_ok());
    }
}
