use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{Phase, State};

pub type ApplicationId = Uuid;

/// Payment status. Moves forward only, or to `Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Expired,
}

impl PaymentStatus {
    pub fn can_advance_to(self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Pending, PaymentStatus::Processing)
                | (PaymentStatus::Processing, PaymentStatus::Completed)
                | (
                    PaymentStatus::Pending | PaymentStatus::Processing | PaymentStatus::Completed,
                    PaymentStatus::Expired
                )
        )
    }
}

/// One phase fee and how far it got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub phase: Phase,
    /// Fee in the smallest currency unit; 0 until requested.
    pub amount: u64,
    pub status: PaymentStatus,
    /// Gateway transaction reported by the applicant.
    pub transaction_id: Option<String>,
    pub requested_at: Option<DateTime<Utc>>,
    /// When the applicant reported paying.
    pub paid_at: Option<DateTime<Utc>>,
    /// When the gateway confirmed settlement.
    pub confirmed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl PaymentRecord {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            amount: 0,
            status: PaymentStatus::Pending,
            transaction_id: None,
            requested_at: None,
            paid_at: None,
            confirmed_at: None,
            expired_at: None,
        }
    }

    /// Move the status forward, stamping the matching timestamp. Returns
    /// `false` and leaves the record untouched when the move would regress.
    pub fn advance(&mut self, next: PaymentStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        match next {
            PaymentStatus::Processing => self.paid_at = Some(at),
            PaymentStatus::Completed => self.confirmed_at = Some(at),
            PaymentStatus::Expired => self.expired_at = Some(at),
            PaymentStatus::Pending => {}
        }
        true
    }
}

/// A single document review decision. Reviews are never removed, so the
/// aggregate keeps every rejection across payment cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub reviewer_id: String,
    pub reviewed_at: DateTime<Utc>,
    pub approved: bool,
    /// What the reviewer found wrong. Empty on approval.
    pub findings: Vec<String>,
    /// What the applicant must change before resubmitting.
    pub corrections: Vec<String>,
    /// Payment cycle the review happened in.
    pub cycle: u32,
}

/// Document review progress for the current payment cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentReview {
    /// Rejections in this payment cycle; reset when a new cycle starts.
    pub rejection_count: u32,
    /// Rejection that ends the cycle and expires the phase 1 payment.
    pub max_rejections: u32,
    pub reviews: Vec<ReviewEntry>,
}

impl DocumentReview {
    pub fn new(max_rejections: u32) -> Self {
        Self {
            rejection_count: 0,
            max_rejections,
            reviews: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InspectionKind {
    Remote,
    OnSite,
}

/// Notes recorded by an inspector for one assessment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionFinding {
    pub kind: InspectionKind,
    pub inspector_id: String,
    pub recorded_at: DateTime<Utc>,
    pub notes: Vec<String>,
}

/// Remote assessment and, when requested, the on-site visit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inspection {
    /// Inspector who scheduled the remote assessment.
    pub inspector_id: Option<String>,
    pub remote_scheduled_at: Option<DateTime<Utc>>,
    pub remote_completed_at: Option<DateTime<Utc>>,
    /// Set by the remote assessment; gates the on-site branch.
    pub on_site_required: bool,
    pub on_site_scheduled_at: Option<DateTime<Utc>>,
    pub on_site_completed_at: Option<DateTime<Utc>>,
    /// 0..=100, only recorded by an on-site visit.
    pub compliance_score: Option<u8>,
    /// On-site verdict.
    pub passed: Option<bool>,
    pub findings: Vec<InspectionFinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

/// The approver's final decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub decision: Option<ApprovalDecision>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    /// Required when rejecting.
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Assigned when generation starts.
    pub number: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    /// Where the rendering collaborator stored the artifact.
    pub artifact_ref: Option<String>,
}

/// The certification application aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    pub application_number: String,
    pub applicant_id: String,
    pub documents: BTreeSet<String>,
    pub current_state: State,
    pub current_step: u8,
    /// Incremented by exactly one on every committed transition.
    pub version: u64,
    /// Version at which `current_state` was last entered. Self-edges keep it.
    pub state_entered_version: u64,
    pub payment1: PaymentRecord,
    pub payment2: PaymentRecord,
    pub payment_cycle: u32,
    pub expired_payments: Vec<PaymentRecord>,
    pub document_review: DocumentReview,
    pub inspection: Inspection,
    pub approval: Approval,
    pub certificate: Certificate,
    /// State the application was in when put ON_HOLD.
    pub held_from: Option<State>,
    /// `state_entered_version` of the held state; resume re-enters it as is.
    #[serde(default)]
    pub held_entered_version: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl Application {
    /// A fresh DRAFT at version 1; creation is the first history entry.
    pub fn draft(applicant_id: impl Into<String>, max_rejections: u32, now: DateTime<Utc>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            application_number: application_number(id, now),
            applicant_id: applicant_id.into(),
            documents: BTreeSet::new(),
            current_state: State::Draft,
            current_step: 1,
            version: 1,
            state_entered_version: 1,
            payment1: PaymentRecord::new(Phase::One),
            payment2: PaymentRecord::new(Phase::Two),
            payment_cycle: 1,
            expired_payments: Vec::new(),
            document_review: DocumentReview::new(max_rejections),
            inspection: Inspection::default(),
            approval: Approval::default(),
            certificate: Certificate::default(),
            held_from: None,
            held_entered_version: None,
            created_at: now,
            updated_at: now,
            submitted_at: None,
        }
    }

    pub fn payment(&self, phase: Phase) -> &PaymentRecord {
        match phase {
            Phase::One => &self.payment1,
            Phase::Two => &self.payment2,
        }
    }

    pub fn payment_mut(&mut self, phase: Phase) -> &mut PaymentRecord {
        match phase {
            Phase::One => &mut self.payment1,
            Phase::Two => &mut self.payment2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }
}

// Human-facing reference: CF + year + month + 4 digits taken from the id.
fn application_number(id: ApplicationId, now: DateTime<Utc>) -> String {
    let suffix = id.as_u128() % 10_000;
    format!("CF{}{:02}{suffix:04}", now.year(), now.month())
}

/// Certificate numbers follow `CERT-YYYYMMDD-XXXXXX`.
pub fn certificate_number(id: ApplicationId, now: DateTime<Utc>) -> String {
    let simple = id.simple().to_string();
    format!(
        "CERT-{}-{}",
        now.format("%Y%m%d"),
        simple[..6].to_ascii_uppercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn draft_defaults() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap();
        let app = Application::draft("farmer-1", 2, now);
        assert_eq!(app.current_state, State::Draft);
        assert_eq!(app.current_step, 1);
        assert_eq!(app.version, 1);
        assert_eq!(app.payment_cycle, 1);
        assert_eq!(app.document_review.max_rejections, 2);
        assert_eq!(app.payment1.status, PaymentStatus::Pending);
        assert!(app.certificate.number.is_none());
        assert!(app.application_number.starts_with("CF202603"));
        assert_eq!(app.application_number.len(), 12);
    }

    #[test]
    fn payment_status_moves_forward_only() {
        use PaymentStatus::*;
        assert!(Pending.can_advance_to(Processing));
        assert!(Processing.can_advance_to(Completed));
        assert!(Completed.can_advance_to(Expired));
        assert!(!Processing.can_advance_to(Pending));
        assert!(!Completed.can_advance_to(Processing));
        assert!(!Expired.can_advance_to(Pending));
        assert!(!Pending.can_advance_to(Completed));
    }

    #[test]
    fn payment_advance_stamps_timestamps() {
        let now = Utc::now();
        let mut record = PaymentRecord::new(Phase::One);
        assert!(record.advance(PaymentStatus::Processing, now));
        assert_eq!(record.paid_at, Some(now));
        assert!(record.advance(PaymentStatus::Completed, now));
        assert_eq!(record.confirmed_at, Some(now));
        assert!(!record.advance(PaymentStatus::Processing, now));
        assert_eq!(record.status, PaymentStatus::Completed);
    }

    #[test]
    fn certificate_number_format() {
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 0, 0, 0).unwrap();
        let number = certificate_number(Uuid::new_v4(), now);
        assert!(number.starts_with("CERT-20261015-"));
        assert_eq!(number.len(), "CERT-20261015-".len() + 6);
    }

    #[test]
    fn application_serialization_roundtrip() {
        let app = Application::draft("farmer-9", 2, Utc::now());
        let json = serde_json::to_string(&app).unwrap();
        let back: Application = serde_json::from_str(&json).unwrap();
        assert_eq!(back, app);
    }
}
