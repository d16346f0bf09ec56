use crate::outbox::{Command, NotificationEvent, Recipient};
use crate::state_machine::{Application, Phase, Role, State};

/// The fixed set of commands issued when an application enters its current
/// state. Self-edges do not re-enter a state and issue nothing.
pub fn reactions(app: &Application) -> Vec<Command> {
    let applicant = || Recipient::Applicant(app.applicant_id.clone());
    let notify = |recipient: Recipient, event: NotificationEvent| Command::Notify { recipient, event };

    match app.current_state {
        State::Draft => Vec::new(),
        State::Submitted => vec![Command::RequestPayment { phase: Phase::One }],
        State::PaymentPending1 | State::PaymentPending2 => {
            let phase = if app.current_state == State::PaymentPending1 {
                Phase::One
            } else {
                Phase::Two
            };
            vec![
                Command::CreatePaymentRequest {
                    phase,
                    amount: app.payment(phase).amount,
                },
                notify(applicant(), NotificationEvent::PaymentRequested),
            ]
        }
        State::PaymentProcessing1 | State::PaymentProcessing2 => {
            let phase = if app.current_state == State::PaymentProcessing1 {
                Phase::One
            } else {
                Phase::Two
            };
            vec![Command::ConfirmPayment {
                phase,
                transaction_id: app.payment(phase).transaction_id.clone().unwrap_or_default(),
            }]
        }
        State::DocumentReview => vec![notify(
            Recipient::Role(Role::Reviewer),
            NotificationEvent::DocumentsReady,
        )],
        State::DocumentRevision => vec![notify(applicant(), NotificationEvent::RevisionRequested)],
        State::DocumentRejected => vec![
            Command::RestartPaymentCycle,
            notify(applicant(), NotificationEvent::DocumentsRejected),
        ],
        State::DocumentApproved => vec![Command::RequestPayment { phase: Phase::Two }],
        State::InspectionScheduled => vec![notify(
            Recipient::Role(Role::Inspector),
            NotificationEvent::InspectionReady,
        )],
        State::InspectionRemote => Vec::new(),
        State::InspectionOnSite => vec![notify(applicant(), NotificationEvent::OnSiteRequired)],
        State::InspectionCompleted => vec![Command::RequestApproval],
        State::PendingApproval => vec![notify(
            Recipient::Role(Role::Approver),
            NotificationEvent::ApprovalPending,
        )],
        State::Approved => vec![
            notify(applicant(), NotificationEvent::Approved),
            Command::RecordCompliance {
                state: State::Approved,
            },
        ],
        State::Rejected => vec![
            notify(applicant(), NotificationEvent::Rejected),
            Command::RecordCompliance {
                state: State::Rejected,
            },
        ],
        State::CertificateGenerating => vec![Command::RenderCertificate {
            number: app.certificate.number.clone().unwrap_or_default(),
        }],
        State::CertificateIssued => vec![
            notify(applicant(), NotificationEvent::CertificateIssued),
            Command::RecordCompliance {
                state: State::CertificateIssued,
            },
        ],
        State::Cancelled => vec![notify(applicant(), NotificationEvent::Cancelled)],
        State::Expired => vec![notify(applicant(), NotificationEvent::Expired)],
        State::OnHold => vec![notify(Recipient::Operators, NotificationEvent::OnHold)],
    }
}

/// Commands that feed a follow-up transition back into the state machine.
pub fn is_advance(command: &Command) -> bool {
    matches!(
        command,
        Command::RequestPayment { .. }
            | Command::RestartPaymentCycle
            | Command::ConfirmPayment { .. }
            | Command::RequestApproval
            | Command::RenderCertificate { .. }
    )
}
