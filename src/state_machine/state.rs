use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle states of a certification application.
///
/// Flow: DRAFT → SUBMITTED → payment 1 → document review → payment 2 →
/// inspection → approval → certificate. CANCELLED, EXPIRED and ON_HOLD are
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum State {
    #[serde(rename = "DRAFT")]
    Draft,
    #[serde(rename = "SUBMITTED")]
    Submitted,
    #[serde(rename = "PAYMENT_PENDING_1")]
    PaymentPending1,
    #[serde(rename = "PAYMENT_PROCESSING_1")]
    PaymentProcessing1,
    #[serde(rename = "DOCUMENT_REVIEW")]
    DocumentReview,
    #[serde(rename = "DOCUMENT_REVISION")]
    DocumentRevision,
    #[serde(rename = "DOCUMENT_REJECTED")]
    DocumentRejected,
    #[serde(rename = "DOCUMENT_APPROVED")]
    DocumentApproved,
    #[serde(rename = "PAYMENT_PENDING_2")]
    PaymentPending2,
    #[serde(rename = "PAYMENT_PROCESSING_2")]
    PaymentProcessing2,
    #[serde(rename = "INSPECTION_SCHEDULED")]
    InspectionScheduled,
    #[serde(rename = "INSPECTION_REMOTE")]
    InspectionRemote,
    #[serde(rename = "INSPECTION_ON_SITE")]
    InspectionOnSite,
    #[serde(rename = "INSPECTION_COMPLETED")]
    InspectionCompleted,
    #[serde(rename = "PENDING_APPROVAL")]
    PendingApproval,
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "CERTIFICATE_GENERATING")]
    CertificateGenerating,
    #[serde(rename = "CERTIFICATE_ISSUED")]
    CertificateIssued,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "EXPIRED")]
    Expired,
    #[serde(rename = "ON_HOLD")]
    OnHold,
}

impl State {
    pub const ALL: [State; 22] = [
        State::Draft,
        State::Submitted,
        State::PaymentPending1,
        State::PaymentProcessing1,
        State::DocumentReview,
        State::DocumentRevision,
        State::DocumentRejected,
        State::DocumentApproved,
        State::PaymentPending2,
        State::PaymentProcessing2,
        State::InspectionScheduled,
        State::InspectionRemote,
        State::InspectionOnSite,
        State::InspectionCompleted,
        State::PendingApproval,
        State::Approved,
        State::Rejected,
        State::CertificateGenerating,
        State::CertificateIssued,
        State::Cancelled,
        State::Expired,
        State::OnHold,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            State::Draft => "DRAFT",
            State::Submitted => "SUBMITTED",
            State::PaymentPending1 => "PAYMENT_PENDING_1",
            State::PaymentProcessing1 => "PAYMENT_PROCESSING_1",
            State::DocumentReview => "DOCUMENT_REVIEW",
            State::DocumentRevision => "DOCUMENT_REVISION",
            State::DocumentRejected => "DOCUMENT_REJECTED",
            State::DocumentApproved => "DOCUMENT_APPROVED",
            State::PaymentPending2 => "PAYMENT_PENDING_2",
            State::PaymentProcessing2 => "PAYMENT_PROCESSING_2",
            State::InspectionScheduled => "INSPECTION_SCHEDULED",
            State::InspectionRemote => "INSPECTION_REMOTE",
            State::InspectionOnSite => "INSPECTION_ON_SITE",
            State::InspectionCompleted => "INSPECTION_COMPLETED",
            State::PendingApproval => "PENDING_APPROVAL",
            State::Approved => "APPROVED",
            State::Rejected => "REJECTED",
            State::CertificateGenerating => "CERTIFICATE_GENERATING",
            State::CertificateIssued => "CERTIFICATE_ISSUED",
            State::Cancelled => "CANCELLED",
            State::Expired => "EXPIRED",
            State::OnHold => "ON_HOLD",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::CertificateIssued | State::Rejected | State::Cancelled | State::Expired
        )
    }

    /// Step of the eight-step certification process this state belongs to.
    /// Administrative states keep whatever step the application was at.
    pub fn step(self) -> Option<u8> {
        match self {
            State::Draft | State::Submitted => Some(1),
            State::PaymentPending1 | State::PaymentProcessing1 | State::DocumentRejected => {
                Some(2)
            }
            State::DocumentReview | State::DocumentRevision => Some(3),
            State::DocumentApproved => Some(4),
            State::PaymentPending2 | State::PaymentProcessing2 => Some(5),
            State::InspectionScheduled
            | State::InspectionRemote
            | State::InspectionOnSite
            | State::InspectionCompleted => Some(6),
            State::PendingApproval | State::Rejected => Some(7),
            State::Approved | State::CertificateGenerating | State::CertificateIssued => Some(8),
            State::Cancelled | State::Expired | State::OnHold => None,
        }
    }

    /// Operational edges out of this state. Administrative edges (cancel,
    /// hold, expire, resume) are covered by [`State::allows`].
    pub fn successors(self) -> &'static [State] {
        match self {
            State::Draft => &[State::Submitted],
            State::Submitted => &[State::PaymentPending1],
            State::PaymentPending1 => &[State::PaymentProcessing1],
            State::PaymentProcessing1 => &[State::DocumentReview],
            State::DocumentReview => &[
                State::DocumentApproved,
                State::DocumentRevision,
                State::DocumentRejected,
            ],
            State::DocumentRevision => &[State::DocumentReview],
            State::DocumentRejected => &[State::PaymentPending1],
            State::DocumentApproved => &[State::PaymentPending2],
            State::PaymentPending2 => &[State::PaymentProcessing2],
            State::PaymentProcessing2 => &[State::InspectionScheduled],
            State::InspectionScheduled => &[State::InspectionRemote],
            State::InspectionRemote => &[State::InspectionOnSite, State::InspectionCompleted],
            State::InspectionOnSite => &[State::InspectionOnSite, State::InspectionCompleted],
            State::InspectionCompleted => &[State::PendingApproval],
            State::PendingApproval => &[State::Approved, State::Rejected],
            State::Approved => &[State::CertificateGenerating],
            State::CertificateGenerating => &[State::CertificateIssued],
            State::OnHold => &[],
            State::CertificateIssued | State::Rejected | State::Cancelled | State::Expired => &[],
        }
    }

    /// Whether `to` is a declared edge from this state, without administrative
    /// override. Resuming from ON_HOLD may target any non-terminal state.
    pub fn allows(self, to: State) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self.successors().contains(&to) {
            return true;
        }
        match to {
            State::Cancelled | State::Expired => true,
            State::OnHold => self != State::OnHold,
            _ => self == State::OnHold && !to.is_terminal(),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        State::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| format!("unknown state: {s}"))
    }
}

/// The two fee-gated payment phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    One,
    Two,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::One => write!(f, "phase 1"),
            Phase::Two => write!(f, "phase 2"),
        }
    }
}

/// Who performs an action. Identity is verified elsewhere; the core only
/// checks that the role may take the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Applicant,
    Reviewer,
    Inspector,
    Approver,
    Admin,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Applicant => "applicant",
            Role::Reviewer => "reviewer",
            Role::Inspector => "inspector",
            Role::Approver => "approver",
            Role::Admin => "admin",
            Role::System => "system",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub const SYSTEM_ID: &'static str = "SYSTEM";

    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn system() -> Self {
        Self::new(Self::SYSTEM_ID, Role::System)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.role)
    }
}

/// Evidence submitted with a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvidence {
    pub transaction_id: String,
    pub amount: u64,
}

/// A reviewer's verdict on the submitted documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub approved: bool,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub corrections: Vec<String>,
}

impl ReviewDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            ..Default::default()
        }
    }

    pub fn reject(findings: Vec<String>, corrections: Vec<String>) -> Self {
        Self {
            approved: false,
            findings,
            corrections,
        }
    }
}

/// Every operation the state machine understands, with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Submit {
        documents: BTreeSet<String>,
    },
    RequestPayment {
        phase: Phase,
        amount: u64,
    },
    RecordPayment {
        phase: Phase,
        evidence: PaymentEvidence,
    },
    ConfirmPayment {
        phase: Phase,
    },
    ReviewDocuments {
        decision: ReviewDecision,
    },
    ResubmitDocuments {
        documents: BTreeSet<String>,
    },
    RestartPaymentCycle {
        amount: u64,
    },
    ScheduleInspection {
        remote_at: DateTime<Utc>,
    },
    RecordRemoteAssessment {
        findings: Vec<String>,
        on_site_required: bool,
    },
    ScheduleOnSite {
        on_site_at: DateTime<Utc>,
    },
    RecordOnSiteResult {
        compliance_score: Option<u8>,
        findings: Vec<String>,
        passed: bool,
    },
    RequestApproval,
    DecideApproval {
        approved: bool,
        reason: Option<String>,
    },
    StartCertificate {
        number: String,
    },
    CompleteCertificate {
        artifact_ref: String,
    },
    Cancel {
        reason: String,
    },
    Hold {
        reason: String,
    },
    Resume,
    Expire,
    Override {
        target: State,
        reason: String,
    },
}

impl Action {
    /// Stable action code recorded in history entries.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Submit { .. } => "SUBMIT",
            Action::RequestPayment { phase: Phase::One, .. } => "REQUEST_PAYMENT_1",
            Action::RequestPayment { phase: Phase::Two, .. } => "REQUEST_PAYMENT_2",
            Action::RecordPayment { phase: Phase::One, .. } => "RECORD_PAYMENT_1",
            Action::RecordPayment { phase: Phase::Two, .. } => "RECORD_PAYMENT_2",
            Action::ConfirmPayment { phase: Phase::One } => "CONFIRM_PAYMENT_1",
            Action::ConfirmPayment { phase: Phase::Two } => "CONFIRM_PAYMENT_2",
            Action::ReviewDocuments { .. } => "REVIEW_DOCUMENTS",
            Action::ResubmitDocuments { .. } => "RESUBMIT_DOCUMENTS",
            Action::RestartPaymentCycle { .. } => "RESTART_PAYMENT_CYCLE",
            Action::ScheduleInspection { .. } => "SCHEDULE_INSPECTION",
            Action::RecordRemoteAssessment { .. } => "RECORD_REMOTE_ASSESSMENT",
            Action::ScheduleOnSite { .. } => "SCHEDULE_ON_SITE",
            Action::RecordOnSiteResult { .. } => "RECORD_ON_SITE_RESULT",
            Action::RequestApproval => "REQUEST_APPROVAL",
            Action::DecideApproval { .. } => "DECIDE_APPROVAL",
            Action::StartCertificate { .. } => "START_CERTIFICATE",
            Action::CompleteCertificate { .. } => "COMPLETE_CERTIFICATE",
            Action::Cancel { .. } => "CANCEL",
            Action::Hold { .. } => "HOLD",
            Action::Resume => "RESUME",
            Action::Expire => "EXPIRE",
            Action::Override { .. } => "OVERRIDE",
        }
    }

    /// Role permissions per action. Admin may act for any role.
    pub fn permits(&self, role: Role) -> bool {
        if role == Role::Admin {
            return true;
        }
        match self {
            Action::Submit { .. } | Action::ResubmitDocuments { .. } => role == Role::Applicant,
            Action::RecordPayment { .. } => matches!(role, Role::Applicant | Role::System),
            Action::ReviewDocuments { .. } => role == Role::Reviewer,
            Action::ScheduleInspection { .. }
            | Action::RecordRemoteAssessment { .. }
            | Action::ScheduleOnSite { .. }
            | Action::RecordOnSiteResult { .. } => role == Role::Inspector,
            Action::DecideApproval { .. } | Action::StartCertificate { .. } => {
                matches!(role, Role::Approver | Role::System)
            }
            Action::RequestPayment { .. }
            | Action::ConfirmPayment { .. }
            | Action::RestartPaymentCycle { .. }
            | Action::RequestApproval
            | Action::CompleteCertificate { .. }
            | Action::Expire
            | Action::Hold { .. } => role == Role::System,
            Action::Cancel { .. } | Action::Resume | Action::Override { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display_matches_wire_name() {
        for state in State::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
        assert_eq!(State::PaymentPending1.to_string(), "PAYMENT_PENDING_1");
    }

    #[test]
    fn state_parses_loosely() {
        assert_eq!("payment-pending-1".parse::<State>(), Ok(State::PaymentPending1));
        assert_eq!("ON_HOLD".parse::<State>(), Ok(State::OnHold));
        assert!("SHIPPED".parse::<State>().is_err());
    }

    #[test]
    fn terminal_states_have_no_edges() {
        for state in State::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(state.successors().is_empty());
            for to in State::ALL {
                assert!(!state.allows(to), "{state} must not reach {to}");
            }
        }
    }

    #[test]
    fn administrative_edges_from_non_terminal_states() {
        for state in State::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(state.allows(State::Cancelled));
            assert!(state.allows(State::Expired));
        }
        assert!(State::DocumentReview.allows(State::OnHold));
        assert!(!State::OnHold.allows(State::OnHold));
        assert!(State::OnHold.allows(State::PaymentProcessing1));
        assert!(!State::OnHold.allows(State::CertificateIssued));
    }

    #[test]
    fn undeclared_edges_are_refused() {
        assert!(!State::Draft.allows(State::DocumentReview));
        assert!(!State::InspectionScheduled.allows(State::InspectionCompleted));
        assert!(!State::Approved.allows(State::CertificateIssued));
    }

    #[test]
    fn steps_follow_the_eight_step_process() {
        assert_eq!(State::Draft.step(), Some(1));
        assert_eq!(State::DocumentRejected.step(), Some(2));
        assert_eq!(State::InspectionOnSite.step(), Some(6));
        assert_eq!(State::CertificateIssued.step(), Some(8));
        assert_eq!(State::OnHold.step(), None);
    }

    #[test]
    fn permissions_by_role() {
        let submit = Action::Submit {
            documents: BTreeSet::new(),
        };
        assert!(submit.permits(Role::Applicant));
        assert!(!submit.permits(Role::Reviewer));
        assert!(submit.permits(Role::Admin));

        assert!(Action::Expire.permits(Role::System));
        assert!(!Action::Expire.permits(Role::Applicant));

        assert!(!Action::Resume.permits(Role::System));
        assert!(Action::Resume.permits(Role::Admin));

        let hold = Action::Hold {
            reason: "x".into(),
        };
        assert!(hold.permits(Role::System));
        assert!(!hold.permits(Role::Inspector));
    }

    #[test]
    fn action_serializes_with_tag() {
        let action = Action::ConfirmPayment { phase: Phase::Two };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "confirm_payment");
        assert_eq!(json["phase"], "two");
        assert_eq!(action.name(), "CONFIRM_PAYMENT_2");
    }
}
