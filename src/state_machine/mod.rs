mod application;
mod machine;
mod state;

pub use application::{
    Application, ApplicationId, Approval, ApprovalDecision, Certificate, DocumentReview,
    Inspection, InspectionFinding, InspectionKind, PaymentRecord, PaymentStatus, ReviewEntry,
    certificate_number,
};
pub use machine::{TransitionOutcome, WorkflowStateMachine};
pub use state::{Action, Actor, PaymentEvidence, Phase, ReviewDecision, Role, State};
