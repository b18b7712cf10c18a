//! Payment stage lifecycle decisions: proof intake, approval, rejection.
//!
//! Transitions are the source of truth; everything downstream of a
//! persisted transition (notifications, electronic submission) is
//! best-effort and never rolls it back.

use crate::models::{Invoice, PaymentStage, Project, StageStatus};
use crate::services::invoicing::InvoiceIssuer;
use crate::services::metrics::STAGE_TRANSITIONS_TOTAL;
use crate::services::notify::Severity;
use crate::services::ports::{
    Directory, NotificationGateway, ProjectRepository, ProofStore, RateSource, StageRepository,
};
use chrono::Utc;
use portal_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// An uploaded proof-of-payment file.
#[derive(Debug, Clone)]
pub struct ProofUpload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct StageLifecycle {
    projects: Arc<dyn ProjectRepository>,
    stages: Arc<dyn StageRepository>,
    rates: Arc<dyn RateSource>,
    directory: Arc<dyn Directory>,
    notifier: Arc<dyn NotificationGateway>,
    proofs: Arc<dyn ProofStore>,
    issuer: InvoiceIssuer,
}

impl StageLifecycle {
    pub fn new(
        projects: Arc<dyn ProjectRepository>,
        stages: Arc<dyn StageRepository>,
        rates: Arc<dyn RateSource>,
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn NotificationGateway>,
        proofs: Arc<dyn ProofStore>,
        issuer: InvoiceIssuer,
    ) -> Self {
        Self {
            projects,
            stages,
            rates,
            directory,
            notifier,
            proofs,
            issuer,
        }
    }

    /// Client submits a payment method and optional proof for an available
    /// stage. Attempting this on any other status is an error, never a
    /// silent success.
    #[instrument(skip(self, proof), fields(stage_id = %stage_id, client_id = %client_id))]
    pub async fn submit_payment(
        &self,
        client_id: Uuid,
        stage_id: Uuid,
        payment_method: &str,
        proof: Option<ProofUpload>,
    ) -> Result<PaymentStage, AppError> {
        if payment_method.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "payment method is required"
            )));
        }

        let stage = self.require_stage(stage_id).await?;
        let project = self.require_project(stage.project_id).await?;

        if project.client_id != client_id {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "stage belongs to another client"
            )));
        }

        stage.check_transition(StageStatus::PendingVerification)?;

        let proof_reference = match proof {
            Some(upload) => Some(
                self.proofs
                    .store(stage_id, &upload.filename, &upload.bytes)
                    .await?,
            ),
            None => None,
        };

        let updated = self
            .stages
            .begin_verification(stage_id, payment_method, proof_reference.as_deref())
            .await?
            .ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!(
                    "stage {} is no longer available for payment",
                    stage_id
                ))
            })?;

        STAGE_TRANSITIONS_TOTAL
            .with_label_values(&["pending_verification"])
            .inc();
        tracing::info!(stage_id = %stage_id, method = %payment_method, "Payment submitted for verification");

        self.alert_admins(&project, &updated).await;
        self.email_client(
            &project,
            &format!("Payment received: {}", updated.name),
            &format!(
                "<p>We received your payment submission for stage <strong>{}</strong> of \
                 project <strong>{}</strong>. You will be notified once it is verified.</p>",
                updated.name, project.name
            ),
        )
        .await;

        Ok(updated)
    }

    /// Admin approves a pending-verification stage. Ordered side effects:
    /// freeze the active exchange rate, stamp paid/approver, ensure the
    /// invoice, dispatch electronic submission out-of-band, notify the
    /// client.
    #[instrument(skip(self), fields(stage_id = %stage_id, admin_id = %admin_id))]
    pub async fn approve(
        &self,
        admin_id: Uuid,
        stage_id: Uuid,
    ) -> Result<(PaymentStage, Invoice), AppError> {
        let stage = self.require_stage(stage_id).await?;
        stage.check_transition(StageStatus::Paid)?;

        // The rate is frozen strictly before the invoice exists, so the
        // invoice can never carry a retroactively wrong rate.
        let frozen_rate = self.rates.current_rate().await;
        let paid_utc = Utc::now();

        let updated = self
            .stages
            .approve_stage(stage_id, frozen_rate, admin_id, paid_utc)
            .await?
            .ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!(
                    "stage {} is not awaiting verification",
                    stage_id
                ))
            })?;

        STAGE_TRANSITIONS_TOTAL.with_label_values(&["paid"]).inc();

        let project = self.require_project(updated.project_id).await?;
        let invoice = self.issuer.ensure_invoice(&updated, &project).await?;

        // Must not block the admin's HTTP response.
        self.issuer
            .spawn_submission(invoice.clone(), updated.clone(), project.clone());

        self.notifier
            .notify(
                project.client_id,
                "Payment approved",
                &format!(
                    "Your payment for stage '{}' of project '{}' was approved.",
                    updated.name, project.name
                ),
                Severity::Success,
            )
            .await;
        self.email_client(
            &project,
            &format!("Payment approved: {}", updated.name),
            &format!(
                "<p>Your payment for stage <strong>{}</strong> of project \
                 <strong>{}</strong> was approved. Invoice Nº {} is available in your \
                 portal.</p>",
                updated.name, project.name, invoice.invoice_number
            ),
        )
        .await;

        Ok((updated, invoice))
    }

    /// Admin rejects a pending-verification stage with a mandatory reason.
    /// The stage reopens as available with the payment details cleared.
    #[instrument(skip(self, reason), fields(stage_id = %stage_id, admin_id = %admin_id))]
    pub async fn reject(
        &self,
        admin_id: Uuid,
        stage_id: Uuid,
        reason: &str,
    ) -> Result<PaymentStage, AppError> {
        if reason.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "a rejection reason is required"
            )));
        }

        let stage = self.require_stage(stage_id).await?;
        stage.check_transition(StageStatus::Available)?;

        let updated = self
            .stages
            .reopen_stage(stage_id, reason)
            .await?
            .ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!(
                    "stage {} is not awaiting verification",
                    stage_id
                ))
            })?;

        STAGE_TRANSITIONS_TOTAL
            .with_label_values(&["available"])
            .inc();
        tracing::info!(stage_id = %stage_id, reason = %reason, "Payment rejected, stage reopened");

        let project = self.require_project(updated.project_id).await?;

        self.notifier
            .notify(
                project.client_id,
                "Payment rejected",
                &format!(
                    "Your payment for stage '{}' was rejected: {}. Please resubmit.",
                    updated.name, reason
                ),
                Severity::Warning,
            )
            .await;
        self.email_client(
            &project,
            &format!("Payment rejected: {}", updated.name),
            &format!(
                "<p>Your payment for stage <strong>{}</strong> of project \
                 <strong>{}</strong> was rejected.</p><p>Reason: {}</p>\
                 <p>Please submit the payment again from your portal.</p>",
                updated.name, project.name, reason
            ),
        )
        .await;

        Ok(updated)
    }

    async fn require_stage(&self, stage_id: Uuid) -> Result<PaymentStage, AppError> {
        self.stages
            .get_stage(stage_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("stage {} not found", stage_id)))
    }

    async fn require_project(&self, project_id: Uuid) -> Result<Project, AppError> {
        self.projects
            .get_project(project_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("project {} not found", project_id))
            })
    }

    async fn alert_admins(&self, project: &Project, stage: &PaymentStage) {
        let admins = match self.directory.admin_contacts().await {
            Ok(admins) => admins,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list admin contacts");
                return;
            }
        };

        let proof_note = stage
            .proof_reference
            .as_deref()
            .map(|r| format!("<p>Attached proof: {}</p>", r))
            .unwrap_or_default();

        for admin in admins {
            self.notifier
                .notify(
                    admin.user_id,
                    "Payment submitted",
                    &format!(
                        "Stage '{}' of project '{}' awaits verification.",
                        stage.name, project.name
                    ),
                    Severity::Warning,
                )
                .await;
            self.notifier
                .send_email(
                    &admin.email,
                    &format!("Payment to verify: {}", stage.name),
                    &format!(
                        "<p>Client submitted a payment for stage <strong>{}</strong> of \
                         project <strong>{}</strong> (USD {}, method: {}).</p>{}",
                        stage.name,
                        project.name,
                        stage.amount,
                        stage.payment_method.as_deref().unwrap_or("unspecified"),
                        proof_note
                    ),
                )
                .await;
        }
    }

    async fn email_client(&self, project: &Project, subject: &str, body: &str) {
        match self.directory.contact(project.client_id).await {
            Ok(Some(contact)) => {
                self.notifier.send_email(&contact.email, subject, body).await;
            }
            Ok(None) => {
                tracing::warn!(client_id = %project.client_id, "No contact for client, skipping email");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to look up client contact");
            }
        }
    }
}
