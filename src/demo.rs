//! Scripted walk through the lifecycle for the `demo` subcommand.

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{Duration, Utc};

use certflow::service::{CertificationService, InspectionResult};
use certflow::state_machine::{
    Actor, Application, ApplicationId, PaymentEvidence, Phase, ReviewDecision, Role,
};

use crate::ui;

pub struct DemoOptions {
    pub revision: bool,
    pub on_site: bool,
}

/// Drain the outbox and return the application as it then stands.
async fn settle(service: &CertificationService, id: ApplicationId) -> Result<Application> {
    service.drain().await?;
    let app = service.get_state(id).await?.application;
    ui::print_step(&app);
    Ok(app)
}

fn shown(app: Application) -> Application {
    ui::print_step(&app);
    app
}

pub async fn run(
    service: &CertificationService,
    documents: &[String],
    options: DemoOptions,
) -> Result<ApplicationId> {
    let farmer = Actor::new("farmer-demo", Role::Applicant);
    let reviewer = Actor::new("reviewer-demo", Role::Reviewer);
    let inspector = Actor::new("inspector-demo", Role::Inspector);
    let approver = Actor::new("approver-demo", Role::Approver);
    let documents: BTreeSet<String> = documents.iter().cloned().collect();

    let app = shown(service.create_draft(&farmer.id).await?);
    let id = app.id;
    let app = shown(
        service
            .submit(id, &farmer, documents.clone(), app.version)
            .await?
            .application,
    );
    let app = settle(service, app.id).await?;

    let payment = PaymentEvidence {
        transaction_id: format!("demo-{}-1", app.application_number),
        amount: app.payment1.amount,
    };
    shown(
        service
            .record_payment(id, &farmer, Phase::One, payment, app.version)
            .await?
            .application,
    );
    let mut app = settle(service, id).await?;

    if options.revision {
        let decision = ReviewDecision::reject(
            vec!["farm map does not show water source".into()],
            vec!["mark the well on the farm map".into()],
        );
        app = shown(
            service
                .review_documents(id, &reviewer, decision, app.version)
                .await?
                .application,
        );
        app = shown(
            service
                .resubmit_documents(id, &farmer, documents, app.version)
                .await?
                .application,
        );
    }

    shown(
        service
            .review_documents(id, &reviewer, ReviewDecision::approve(), app.version)
            .await?
            .application,
    );
    let app = settle(service, id).await?;

    let payment = PaymentEvidence {
        transaction_id: format!("demo-{}-2", app.application_number),
        amount: app.payment2.amount,
    };
    shown(
        service
            .record_payment(id, &farmer, Phase::Two, payment, app.version)
            .await?
            .application,
    );
    let app = settle(service, id).await?;

    let app = shown(
        service
            .schedule_inspection(id, &inspector, Utc::now() + Duration::days(3), app.version)
            .await?
            .application,
    );
    let remote = InspectionResult::Remote {
        findings: vec!["cultivation records reviewed by video call".into()],
        on_site_required: options.on_site,
    };
    let mut app = shown(
        service
            .record_inspection_result(id, &inspector, remote, app.version)
            .await?
            .application,
    );

    if options.on_site {
        app = shown(
            service
                .schedule_on_site_inspection(
                    id,
                    &inspector,
                    Utc::now() + Duration::days(10),
                    app.version,
                )
                .await?
                .application,
        );
        let visit = InspectionResult::OnSite {
            compliance_score: 87,
            findings: vec!["drying room meets hygiene requirements".into()],
            passed: true,
        };
        shown(
            service
                .record_inspection_result(id, &inspector, visit, app.version)
                .await?
                .application,
        );
    }
    let app = settle(service, id).await?;

    let app = shown(
        service
            .decide_approval(id, &approver, true, None, app.version)
            .await?
            .application,
    );
    shown(
        service
            .issue_certificate(id, &approver, app.version)
            .await?
            .application,
    );
    settle(service, id).await?;

    Ok(id)
}
