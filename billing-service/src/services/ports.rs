//! Port interfaces between the billing engines and infrastructure.
//!
//! These traits define the boundaries the lifecycle engines operate
//! against; [`crate::services::Database`] and the provider clients
//! implement them for production, tests supply in-memory implementations.

use crate::models::{
    BillingProfile, ClientSnapshot, Contact, CreateInvoice, Invoice, PaymentStage, Project,
};
use crate::services::notify::Severity;
use crate::services::sifen::{AuthorityReceipt, EInvoiceDocument};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portal_core::error::AppError;
use rust_decimal::Decimal;
use uuid::Uuid;

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, AppError>;

    async fn set_progress(
        &self,
        project_id: Uuid,
        progress: i32,
    ) -> Result<Option<Project>, AppError>;
}

#[async_trait]
pub trait StageRepository: Send + Sync {
    async fn get_stage(&self, stage_id: Uuid) -> Result<Option<PaymentStage>, AppError>;

    /// Stages of a project, ordered by required progress.
    async fn list_stages(&self, project_id: Uuid) -> Result<Vec<PaymentStage>, AppError>;

    /// `pending -> available`, guarded on the current status. `None` when
    /// the guard did not match.
    async fn mark_available(&self, stage_id: Uuid) -> Result<Option<PaymentStage>, AppError>;

    /// `available -> pending_verification` with the submitted payment
    /// details.
    async fn begin_verification(
        &self,
        stage_id: Uuid,
        payment_method: &str,
        proof_reference: Option<&str>,
    ) -> Result<Option<PaymentStage>, AppError>;

    /// `pending_verification -> paid`, freezing the exchange rate and
    /// stamping approver and paid timestamp. The only legitimate write of
    /// the frozen rate.
    async fn approve_stage(
        &self,
        stage_id: Uuid,
        frozen_rate: Decimal,
        approved_by: Uuid,
        paid_utc: DateTime<Utc>,
    ) -> Result<Option<PaymentStage>, AppError>;

    /// `pending_verification -> available`, clearing payment details and
    /// recording the rejection reason.
    async fn reopen_stage(
        &self,
        stage_id: Uuid,
        reason: &str,
    ) -> Result<Option<PaymentStage>, AppError>;
}

#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;

    async fn find_invoice_by_stage(&self, stage_id: Uuid) -> Result<Option<Invoice>, AppError>;

    /// Create an invoice with a freshly assigned sequential number. On a
    /// stage-id uniqueness race the existing invoice wins and is returned.
    async fn create_invoice(&self, input: &CreateInvoice) -> Result<Invoice, AppError>;

    /// One-time snapshot backfill for legacy rows; a populated snapshot is
    /// never overwritten.
    async fn backfill_snapshot(
        &self,
        invoice_id: Uuid,
        snapshot: &ClientSnapshot,
        issue_timestamp: &str,
        exchange_rate: Decimal,
    ) -> Result<Option<Invoice>, AppError>;

    /// Persist an authority acceptance. Guarded on `cdc IS NULL`.
    async fn record_authority_result(
        &self,
        invoice_id: Uuid,
        receipt: &AuthorityReceipt,
    ) -> Result<Option<Invoice>, AppError>;

    /// Persist a submission failure, leaving `cdc` empty so a later read
    /// retries.
    async fn record_authority_error(
        &self,
        invoice_id: Uuid,
        message: &str,
    ) -> Result<Option<Invoice>, AppError>;
}

#[async_trait]
pub trait RateSource: Send + Sync {
    /// Current USD -> PYG rate: active configuration, else remote quote,
    /// else the hardcoded fallback. Never fails.
    async fn current_rate(&self) -> Decimal;
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn billing_profile(&self, user_id: Uuid) -> Result<Option<BillingProfile>, AppError>;

    async fn contact(&self, user_id: Uuid) -> Result<Option<Contact>, AppError>;

    async fn admin_contacts(&self) -> Result<Vec<Contact>, AppError>;
}

#[async_trait]
pub trait AuthorityClient: Send + Sync {
    /// Submit a document to the e-invoicing authority. Transport failures
    /// surface as errors; business rejections come back in the receipt.
    async fn submit(&self, document: &EInvoiceDocument) -> Result<AuthorityReceipt, AppError>;
}

#[async_trait]
pub trait ProofStore: Send + Sync {
    async fn store(
        &self,
        stage_id: Uuid,
        filename: &str,
        bytes: &[u8],
    ) -> Result<String, AppError>;

    async fn load(&self, reference: &str) -> Result<Vec<u8>, AppError>;
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// Real-time notification. Fire-and-forget; failures are logged, never
    /// propagated.
    async fn notify(&self, user_id: Uuid, title: &str, message: &str, severity: Severity);

    /// Email delivery. Fire-and-forget; failures are logged, never
    /// propagated.
    async fn send_email(&self, to: &str, subject: &str, html_body: &str);
}
