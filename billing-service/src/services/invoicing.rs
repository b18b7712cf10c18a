//! Invoice snapshot creation and electronic submission.
//!
//! `ensure_invoice` and `ensure_snapshot` are the only paths that write
//! frozen invoice facts, and `ensure_submitted` is the only path that
//! talks to the authority, so write-once and submit-once semantics are
//! enforced in one place.

use crate::models::{
    ClientSnapshot, CreateInvoice, Invoice, PaymentStage, Project, format_issue_timestamp,
};
use crate::services::metrics::SUBMISSIONS_TOTAL;
use crate::services::ports::{
    AuthorityClient, Directory, InvoiceRepository, ProjectRepository, StageRepository,
};
use crate::services::sifen::{build_document, format_document_number};
use chrono::Utc;
use portal_core::error::AppError;
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Data for rendering a downloadable invoice document. Reads only frozen
/// facts, never the live billing profile.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDocumentView {
    pub invoice: Invoice,
    pub project_name: String,
    pub stage_name: String,
    pub document_number: String,
    /// Scannable verification code, present once the authority accepted
    /// the invoice. A document without it is still a valid receipt.
    pub verification_code: Option<String>,
}

#[derive(Clone)]
pub struct InvoiceIssuer {
    projects: Arc<dyn ProjectRepository>,
    stages: Arc<dyn StageRepository>,
    invoices: Arc<dyn InvoiceRepository>,
    directory: Arc<dyn Directory>,
    authority: Arc<dyn AuthorityClient>,
}

impl InvoiceIssuer {
    pub fn new(
        projects: Arc<dyn ProjectRepository>,
        stages: Arc<dyn StageRepository>,
        invoices: Arc<dyn InvoiceRepository>,
        directory: Arc<dyn Directory>,
        authority: Arc<dyn AuthorityClient>,
    ) -> Self {
        Self {
            projects,
            stages,
            invoices,
            directory,
            authority,
        }
    }

    /// Return the invoice linked to a stage, creating it on first access.
    /// Concurrent calls converge on the same invoice number: the lookup is
    /// the fast path, the unique constraint on the stage reference is the
    /// backstop.
    #[instrument(skip(self, stage, project), fields(stage_id = %stage.stage_id))]
    pub async fn ensure_invoice(
        &self,
        stage: &PaymentStage,
        project: &Project,
    ) -> Result<Invoice, AppError> {
        if let Some(existing) = self.invoices.find_invoice_by_stage(stage.stage_id).await? {
            return self.ensure_snapshot(existing, stage).await;
        }

        let snapshot = self.client_snapshot(project.client_id).await?;
        let exchange_rate = stage.frozen_exchange_rate.ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "stage {} has no frozen exchange rate",
                stage.stage_id
            ))
        })?;
        let paid_utc = stage.paid_utc.unwrap_or_else(Utc::now);

        let input = CreateInvoice {
            project_id: project.project_id,
            client_id: project.client_id,
            stage_id: stage.stage_id,
            amount: stage.amount,
            currency: "USD".to_string(),
            paid_date: Some(paid_utc.date_naive()),
            snapshot,
            issue_timestamp: format_issue_timestamp(paid_utc),
            exchange_rate,
        };

        self.invoices.create_invoice(&input).await
    }

    /// Guarantee a populated snapshot, backfilling a legacy record exactly
    /// once. A populated snapshot is never overwritten, no matter how the
    /// live profile changed since issuance.
    #[instrument(skip(self, invoice, stage), fields(invoice_id = %invoice.invoice_id))]
    pub async fn ensure_snapshot(
        &self,
        invoice: Invoice,
        stage: &PaymentStage,
    ) -> Result<Invoice, AppError> {
        if invoice.has_snapshot() {
            return Ok(invoice);
        }

        let snapshot = self.client_snapshot(invoice.client_id).await?;
        let exchange_rate = stage
            .frozen_exchange_rate
            .or(invoice.exchange_rate)
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "invoice {} has no frozen exchange rate to backfill",
                    invoice.invoice_id
                ))
            })?;
        let issue_timestamp = invoice
            .issue_timestamp
            .clone()
            .unwrap_or_else(|| format_issue_timestamp(stage.paid_utc.unwrap_or_else(Utc::now)));

        let stored = self
            .invoices
            .backfill_snapshot(invoice.invoice_id, &snapshot, &issue_timestamp, exchange_rate)
            .await?;

        Ok(stored.unwrap_or(invoice))
    }

    /// Dispatch an electronic submission decoupled from the caller's
    /// request cycle. The outcome is persisted by the spawned task.
    pub fn spawn_submission(&self, invoice: Invoice, stage: PaymentStage, project: Project) {
        let issuer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = issuer.ensure_submitted(invoice, &stage, &project).await {
                tracing::warn!(error = %e, "Deferred electronic invoice submission failed");
            }
        });
    }

    /// Submit the invoice to the authority if, and only if, it has no
    /// transaction reference yet. Once a CDC is present the invoice is
    /// authoritatively issued and no outbound call is made.
    #[instrument(skip(self, invoice, stage, project), fields(invoice_id = %invoice.invoice_id))]
    pub async fn ensure_submitted(
        &self,
        invoice: Invoice,
        stage: &PaymentStage,
        project: &Project,
    ) -> Result<Invoice, AppError> {
        if invoice.is_authorized() {
            SUBMISSIONS_TOTAL.with_label_values(&["skipped"]).inc();
            return Ok(invoice);
        }

        let invoice = self.ensure_snapshot(invoice, stage).await?;
        let document = build_document(&invoice, stage, project)?;

        match self.authority.submit(&document).await {
            Ok(receipt) if receipt.cdc.is_some() => {
                SUBMISSIONS_TOTAL.with_label_values(&["accepted"]).inc();
                let stored = self
                    .invoices
                    .record_authority_result(invoice.invoice_id, &receipt)
                    .await?;
                Ok(stored.unwrap_or(invoice))
            }
            Ok(receipt) => {
                SUBMISSIONS_TOTAL.with_label_values(&["rejected"]).inc();
                let message = receipt
                    .error_message
                    .clone()
                    .unwrap_or_else(|| receipt.status.clone());
                tracing::warn!(
                    invoice_id = %invoice.invoice_id,
                    message = %message,
                    "Authority rejected the invoice"
                );
                let stored = self
                    .invoices
                    .record_authority_error(invoice.invoice_id, &message)
                    .await?;
                Ok(stored.unwrap_or(invoice))
            }
            Err(e) => {
                SUBMISSIONS_TOTAL.with_label_values(&["error"]).inc();
                tracing::warn!(
                    invoice_id = %invoice.invoice_id,
                    error = %e,
                    "Electronic invoice submission failed"
                );
                let stored = self
                    .invoices
                    .record_authority_error(invoice.invoice_id, &e.to_string())
                    .await?;
                Ok(stored.unwrap_or(invoice))
            }
        }
    }

    /// Assemble the document view for download. A missing authority result
    /// is retried lazily here; when the retry cannot succeed the document
    /// still renders as a receipt without a verification code.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn document(&self, invoice_id: Uuid) -> Result<InvoiceDocumentView, AppError> {
        let invoice = self.invoices.get_invoice(invoice_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("invoice {} not found", invoice_id))
        })?;
        let stage = self
            .stages
            .get_stage(invoice.stage_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("stage {} not found", invoice.stage_id))
            })?;
        let project = self
            .projects
            .get_project(invoice.project_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("project {} not found", invoice.project_id))
            })?;

        let invoice = match self
            .ensure_submitted(invoice.clone(), &stage, &project)
            .await
        {
            Ok(refreshed) => refreshed,
            Err(e) => {
                tracing::warn!(
                    invoice_id = %invoice_id,
                    error = %e,
                    "Lazy resubmission failed; rendering receipt without authority result"
                );
                invoice
            }
        };

        let document_number = format_document_number(invoice.invoice_number);
        let verification_code = invoice.verification_code.clone();

        Ok(InvoiceDocumentView {
            project_name: project.name,
            stage_name: stage.name,
            document_number,
            verification_code,
            invoice,
        })
    }

    async fn client_snapshot(&self, client_id: Uuid) -> Result<ClientSnapshot, AppError> {
        let profile = self
            .directory
            .billing_profile(client_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "billing profile for client {} not found",
                    client_id
                ))
            })?;

        Ok(ClientSnapshot::from(&profile))
    }
}
