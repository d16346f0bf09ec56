//! Seams to the systems the workflow talks to: payments, notifications,
//! certificate rendering, compliance reporting and operator alerts.
//!
//! Every call carries the outbox [`IdempotencyKey`] so a collaborator can
//! drop the duplicates at-least-once delivery produces. The `Simulated*`
//! implementations back the CLI and the tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::audit::AuditRecord;
use crate::config::FeeConfig;
use crate::error::CollaboratorError;
use crate::outbox::{IdempotencyKey, NotificationEvent, Recipient};
use crate::state_machine::{ApplicationId, Phase, State};

/// Input to the fee calculation for one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeQuery {
    pub application_id: ApplicationId,
    pub phase: Phase,
    /// Starts at 1; a restarted phase 1 is charged again.
    pub payment_cycle: u32,
}

/// Ask the gateway to bill the applicant. The gateway deduplicates on `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub key: IdempotencyKey,
    pub applicant_id: String,
    pub application_number: String,
    pub phase: Phase,
    /// Smallest currency unit.
    pub amount: u64,
}

/// Gateway verdict on a recorded payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentConfirmation {
    Confirmed,
    /// Not settled yet; ask again later.
    Pending,
    Declined(String),
}

#[async_trait]
pub trait PaymentCollaborator: Send + Sync {
    /// Fee for a phase in the smallest currency unit.
    async fn compute_fee(&self, query: &FeeQuery) -> Result<u64, CollaboratorError>;

    async fn create_payment_request(
        &self,
        request: &PaymentRequest,
    ) -> Result<(), CollaboratorError>;

    async fn confirm_payment(
        &self,
        key: &IdempotencyKey,
        transaction_id: &str,
    ) -> Result<PaymentConfirmation, CollaboratorError>;
}

/// A message for a person or a role pool about a lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub key: IdempotencyKey,
    pub recipient: Recipient,
    pub event: NotificationEvent,
    pub application_number: String,
}

#[async_trait]
pub trait NotificationCollaborator: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), CollaboratorError>;
}

/// A document to render from a named template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub key: IdempotencyKey,
    pub template: String,
    /// Template fields.
    pub data: serde_json::Value,
}

#[async_trait]
pub trait RenderingCollaborator: Send + Sync {
    /// Render the document and return a reference to the stored artifact.
    async fn render(&self, request: &RenderRequest) -> Result<String, CollaboratorError>;
}

/// A reportable outcome together with the audit summary at that point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceEvent {
    pub key: IdempotencyKey,
    /// The outcome being reported (approved, rejected or issued).
    pub state: State,
    pub record: AuditRecord,
}

#[async_trait]
pub trait ComplianceReporter: Send + Sync {
    async fn record(&self, event: &ComplianceEvent) -> Result<(), CollaboratorError>;
}

/// Raised when an outbox entry is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub key: IdempotencyKey,
    /// Name of the failed command.
    pub command: String,
    pub attempts: u32,
    /// Last failure seen.
    pub error: String,
    /// Whether the application was moved to ON_HOLD.
    pub held: bool,
}

/// Where operator alerts go. Raising cannot fail the drainer.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: &Alert);
}

/// The full set of collaborators the drainer dispatches to.
#[derive(Clone)]
pub struct Collaborators {
    pub payments: Arc<dyn PaymentCollaborator>,
    pub notifications: Arc<dyn NotificationCollaborator>,
    pub rendering: Arc<dyn RenderingCollaborator>,
    pub compliance: Arc<dyn ComplianceReporter>,
    pub alerts: Arc<dyn AlertSink>,
}

impl Collaborators {
    /// In-process stand-ins that always succeed and log what they would do.
    pub fn simulated(fees: &FeeConfig) -> Self {
        Self {
            payments: Arc::new(SimulatedPayments::new(fees)),
            notifications: Arc::new(LogNotifier),
            rendering: Arc::new(ArtifactRenderer),
            compliance: Arc::new(LogComplianceReporter),
            alerts: Arc::new(LogAlertSink),
        }
    }
}

/// Flat tariff per phase; every payment confirms immediately.
#[derive(Debug, Clone)]
pub struct SimulatedPayments {
    phase_one: u64,
    phase_two: u64,
}

impl SimulatedPayments {
    pub fn new(fees: &FeeConfig) -> Self {
        Self {
            phase_one: fees.phase_one,
            phase_two: fees.phase_two,
        }
    }
}

#[async_trait]
impl PaymentCollaborator for SimulatedPayments {
    async fn compute_fee(&self, query: &FeeQuery) -> Result<u64, CollaboratorError> {
        Ok(match query.phase {
            Phase::One => self.phase_one,
            Phase::Two => self.phase_two,
        })
    }

    async fn create_payment_request(
        &self,
        request: &PaymentRequest,
    ) -> Result<(), CollaboratorError> {
        info!(
            key = %request.key,
            application_number = %request.application_number,
            amount = request.amount,
            "payment request created"
        );
        Ok(())
    }

    async fn confirm_payment(
        &self,
        key: &IdempotencyKey,
        transaction_id: &str,
    ) -> Result<PaymentConfirmation, CollaboratorError> {
        info!(%key, transaction_id, "payment confirmed");
        Ok(PaymentConfirmation::Confirmed)
    }
}

pub struct LogNotifier;

#[async_trait]
impl NotificationCollaborator for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), CollaboratorError> {
        info!(
            key = %notification.key,
            recipient = %notification.recipient,
            event = ?notification.event,
            "notification sent"
        );
        Ok(())
    }
}

/// Pretends to render and returns a stable artifact reference.
pub struct ArtifactRenderer;

#[async_trait]
impl RenderingCollaborator for ArtifactRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<String, CollaboratorError> {
        let number = request
            .data
            .get("certificate_number")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CollaboratorError::Rejected("certificate_number missing".into()))?;
        Ok(format!("artifact://certificates/{number}.pdf"))
    }
}

pub struct LogComplianceReporter;

#[async_trait]
impl ComplianceReporter for LogComplianceReporter {
    async fn record(&self, event: &ComplianceEvent) -> Result<(), CollaboratorError> {
        info!(
            key = %event.key,
            state = %event.state,
            transitions = event.record.state_transitions.len(),
            "compliance event recorded"
        );
        Ok(())
    }
}

pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise(&self, alert: &Alert) {
        error!(
            key = %alert.key,
            command = %alert.command,
            attempts = alert.attempts,
            held = alert.held,
            error = %alert.error,
            "outbox entry dead-lettered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn key() -> IdempotencyKey {
        IdempotencyKey {
            application_id: Uuid::new_v4(),
            state: State::CertificateGenerating,
            entered_version: 17,
            ordinal: 0,
        }
    }

    #[tokio::test]
    async fn simulated_fees_follow_tariff() {
        let payments = SimulatedPayments::new(&FeeConfig::default());
        let mut query = FeeQuery {
            application_id: Uuid::new_v4(),
            phase: Phase::One,
            payment_cycle: 1,
        };
        assert_eq!(payments.compute_fee(&query).await, Ok(5000));
        query.phase = Phase::Two;
        assert_eq!(payments.compute_fee(&query).await, Ok(25_000));
    }

    #[tokio::test]
    async fn renderer_returns_artifact_reference() {
        let request = RenderRequest {
            key: key(),
            template: "certificate".into(),
            data: serde_json::json!({ "certificate_number": "CERT-20260101-ABC123" }),
        };
        assert_eq!(
            ArtifactRenderer.render(&request).await.unwrap(),
            "artifact://certificates/CERT-20260101-ABC123.pdf"
        );
    }

    #[tokio::test]
    async fn renderer_rejects_missing_number() {
        let request = RenderRequest {
            key: key(),
            template: "certificate".into(),
            data: serde_json::json!({}),
        };
        let err = ArtifactRenderer.render(&request).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Rejected(_)));
    }
}
