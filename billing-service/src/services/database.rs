//! Database service for billing-service.

use crate::models::{
    BillingProfile, ClientSnapshot, Contact, CreateInvoice, CreateProject, ExchangeRate, Invoice,
    ListInvoicesFilter, PaymentStage, Project, StagePlanItem, stage_amount,
};
use crate::services::metrics::{DB_QUERY_DURATION, INVOICES_TOTAL};
use crate::services::ports::{InvoiceRepository, ProjectRepository, StageRepository};
use crate::services::sifen::AuthorityReceipt;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portal_core::error::AppError;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const STAGE_COLUMNS: &str = "stage_id, project_id, name, percentage, amount, required_progress, \
    status, payment_method, proof_reference, rejection_reason, frozen_exchange_rate, paid_utc, \
    approved_by, created_utc, updated_utc";

const INVOICE_COLUMNS: &str = "invoice_id, project_id, client_id, stage_id, invoice_number, \
    amount, currency, status, due_date, paid_date, legal_name, document_type, document_number, \
    address, city, department, country, email, phone, issue_timestamp, exchange_rate, cdc, \
    authorization_protocol, authority_status, authority_document, verification_code, \
    authority_error, created_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Project Operations
    // -------------------------------------------------------------------------

    /// Create a new project.
    #[instrument(skip(self, input), fields(client_id = %input.client_id))]
    pub async fn create_project(&self, input: &CreateProject) -> Result<Project, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_project"])
            .start_timer();

        let project_id = Uuid::new_v4();
        let project = sqlx::query_as::<_, Project>(
            r#"
            INSERT INTO projects (project_id, client_id, name, total_price, progress, status)
            VALUES ($1, $2, $3, $4, 0, 'active')
            RETURNING project_id, client_id, name, total_price, progress, status, created_utc, updated_utc
            "#,
        )
        .bind(project_id)
        .bind(input.client_id)
        .bind(&input.name)
        .bind(input.total_price)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create project: {}", e)))?;

        timer.observe_duration();

        info!(project_id = %project.project_id, "Project created");

        Ok(project)
    }

    /// Get a project by ID.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_project"])
            .start_timer();

        let project = sqlx::query_as::<_, Project>(
            r#"
            SELECT project_id, client_id, name, total_price, progress, status, created_utc, updated_utc
            FROM projects
            WHERE project_id = $1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get project: {}", e)))?;

        timer.observe_duration();

        Ok(project)
    }

    /// Update project progress. The caller runs stage activation afterward.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn set_progress(
        &self,
        project_id: Uuid,
        progress: i32,
    ) -> Result<Option<Project>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_progress"])
            .start_timer();

        let project = sqlx::query_as::<_, Project>(
            r#"
            UPDATE projects
            SET progress = $2,
                updated_utc = NOW()
            WHERE project_id = $1
            RETURNING project_id, client_id, name, total_price, progress, status, created_utc, updated_utc
            "#,
        )
        .bind(project_id)
        .bind(progress)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to set progress: {}", e)))?;

        timer.observe_duration();

        Ok(project)
    }

    // -------------------------------------------------------------------------
    // Payment Stage Operations
    // -------------------------------------------------------------------------

    /// Create the full stage plan for a project in one transaction. A stage
    /// with a zero threshold starts out `available`, the rest `pending`.
    #[instrument(skip(self, project, items), fields(project_id = %project.project_id))]
    pub async fn create_stage_plan(
        &self,
        project: &Project,
        items: &[StagePlanItem],
    ) -> Result<Vec<PaymentStage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_stage_plan"])
            .start_timer();

        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM payment_stages WHERE project_id = $1")
                .bind(project.project_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to count stages: {}", e))
                })?;
        if existing > 0 {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "project {} already has a stage plan",
                project.project_id
            )));
        }

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let mut stages = Vec::with_capacity(items.len());
        for item in items {
            let status = if item.required_progress == 0 {
                "available"
            } else {
                "pending"
            };
            let stage = sqlx::query_as::<_, PaymentStage>(&format!(
                r#"
                INSERT INTO payment_stages (stage_id, project_id, name, percentage, amount, required_progress, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING {}
                "#,
                STAGE_COLUMNS
            ))
            .bind(Uuid::new_v4())
            .bind(project.project_id)
            .bind(&item.name)
            .bind(item.percentage)
            .bind(stage_amount(project.total_price, item.percentage))
            .bind(item.required_progress)
            .bind(status)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create stage: {}", e))
            })?;
            stages.push(stage);
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit stage plan: {}", e))
        })?;

        timer.observe_duration();

        info!(
            project_id = %project.project_id,
            stages = stages.len(),
            "Stage plan created"
        );

        Ok(stages)
    }

    /// Get a stage by ID.
    #[instrument(skip(self), fields(stage_id = %stage_id))]
    pub async fn get_stage(&self, stage_id: Uuid) -> Result<Option<PaymentStage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_stage"])
            .start_timer();

        let stage = sqlx::query_as::<_, PaymentStage>(&format!(
            "SELECT {} FROM payment_stages WHERE stage_id = $1",
            STAGE_COLUMNS
        ))
        .bind(stage_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get stage: {}", e)))?;

        timer.observe_duration();

        Ok(stage)
    }

    /// List stages of a project in threshold order.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn list_stages(&self, project_id: Uuid) -> Result<Vec<PaymentStage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_stages"])
            .start_timer();

        let stages = sqlx::query_as::<_, PaymentStage>(&format!(
            r#"
            SELECT {}
            FROM payment_stages
            WHERE project_id = $1
            ORDER BY required_progress, created_utc
            "#,
            STAGE_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list stages: {}", e)))?;

        timer.observe_duration();

        Ok(stages)
    }

    /// Transition a pending stage to available. Guarded on the current
    /// status; `None` means the guard did not match.
    #[instrument(skip(self), fields(stage_id = %stage_id))]
    pub async fn mark_available(&self, stage_id: Uuid) -> Result<Option<PaymentStage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_available"])
            .start_timer();

        let stage = sqlx::query_as::<_, PaymentStage>(&format!(
            r#"
            UPDATE payment_stages
            SET status = 'available',
                updated_utc = NOW()
            WHERE stage_id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            STAGE_COLUMNS
        ))
        .bind(stage_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark stage available: {}", e))
        })?;

        timer.observe_duration();

        Ok(stage)
    }

    /// Transition an available stage to pending verification with the
    /// submitted payment details.
    #[instrument(skip(self), fields(stage_id = %stage_id))]
    pub async fn begin_verification(
        &self,
        stage_id: Uuid,
        payment_method: &str,
        proof_reference: Option<&str>,
    ) -> Result<Option<PaymentStage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["begin_verification"])
            .start_timer();

        let stage = sqlx::query_as::<_, PaymentStage>(&format!(
            r#"
            UPDATE payment_stages
            SET status = 'pending_verification',
                payment_method = $2,
                proof_reference = $3,
                rejection_reason = NULL,
                updated_utc = NOW()
            WHERE stage_id = $1 AND status = 'available'
            RETURNING {}
            "#,
            STAGE_COLUMNS
        ))
        .bind(stage_id)
        .bind(payment_method)
        .bind(proof_reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin verification: {}", e))
        })?;

        timer.observe_duration();

        Ok(stage)
    }

    /// Confirm a stage as paid, freezing the exchange rate and stamping the
    /// approver. Guarded on pending verification.
    #[instrument(skip(self), fields(stage_id = %stage_id, approved_by = %approved_by))]
    pub async fn approve_stage(
        &self,
        stage_id: Uuid,
        frozen_rate: Decimal,
        approved_by: Uuid,
        paid_utc: DateTime<Utc>,
    ) -> Result<Option<PaymentStage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["approve_stage"])
            .start_timer();

        let stage = sqlx::query_as::<_, PaymentStage>(&format!(
            r#"
            UPDATE payment_stages
            SET status = 'paid',
                frozen_exchange_rate = $2,
                approved_by = $3,
                paid_utc = $4,
                updated_utc = NOW()
            WHERE stage_id = $1 AND status = 'pending_verification'
            RETURNING {}
            "#,
            STAGE_COLUMNS
        ))
        .bind(stage_id)
        .bind(frozen_rate)
        .bind(approved_by)
        .bind(paid_utc)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to approve stage: {}", e)))?;

        timer.observe_duration();

        if let Some(ref s) = stage {
            info!(stage_id = %s.stage_id, rate = %frozen_rate, "Stage approved as paid");
        }

        Ok(stage)
    }

    /// Reject a stage back to available, clearing the payment details so
    /// the client resubmits from scratch.
    #[instrument(skip(self, reason), fields(stage_id = %stage_id))]
    pub async fn reopen_stage(
        &self,
        stage_id: Uuid,
        reason: &str,
    ) -> Result<Option<PaymentStage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reopen_stage"])
            .start_timer();

        let stage = sqlx::query_as::<_, PaymentStage>(&format!(
            r#"
            UPDATE payment_stages
            SET status = 'available',
                payment_method = NULL,
                proof_reference = NULL,
                rejection_reason = $2,
                updated_utc = NOW()
            WHERE stage_id = $1 AND status = 'pending_verification'
            RETURNING {}
            "#,
            STAGE_COLUMNS
        ))
        .bind(stage_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to reopen stage: {}", e)))?;

        timer.observe_duration();

        Ok(stage)
    }

    // -------------------------------------------------------------------------
    // Invoice Operations
    // -------------------------------------------------------------------------

    /// Get an invoice by ID.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE invoice_id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();

        Ok(invoice)
    }

    /// Find the invoice linked to a stage.
    #[instrument(skip(self), fields(stage_id = %stage_id))]
    pub async fn find_invoice_by_stage(
        &self,
        stage_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_invoice_by_stage"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE stage_id = $1",
            INVOICE_COLUMNS
        ))
        .bind(stage_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find invoice by stage: {}", e))
        })?;

        timer.observe_duration();

        Ok(invoice)
    }

    /// Create an invoice with the next sequential number. The unique
    /// constraint on `stage_id` is the backstop against concurrent
    /// approvals: on a violation the existing invoice wins.
    #[instrument(skip(self, input), fields(stage_id = %input.stage_id))]
    pub async fn create_invoice(&self, input: &CreateInvoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let invoice_id = Uuid::new_v4();
        let result = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (
                invoice_id, project_id, client_id, stage_id, invoice_number, amount, currency,
                status, paid_date, legal_name, document_type, document_number, address, city,
                department, country, email, phone, issue_timestamp, exchange_rate
            )
            VALUES ($1, $2, $3, $4, next_invoice_number(), $5, $6, 'paid', $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18)
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .bind(input.project_id)
        .bind(input.client_id)
        .bind(input.stage_id)
        .bind(input.amount)
        .bind(&input.currency)
        .bind(input.paid_date)
        .bind(&input.snapshot.legal_name)
        .bind(&input.snapshot.document_type)
        .bind(&input.snapshot.document_number)
        .bind(&input.snapshot.address)
        .bind(&input.snapshot.city)
        .bind(&input.snapshot.department)
        .bind(&input.snapshot.country)
        .bind(&input.snapshot.email)
        .bind(&input.snapshot.phone)
        .bind(&input.issue_timestamp)
        .bind(input.exchange_rate)
        .fetch_one(&self.pool)
        .await;

        timer.observe_duration();

        match result {
            Ok(invoice) => {
                INVOICES_TOTAL
                    .with_label_values(&[invoice.currency.as_str()])
                    .inc();
                info!(
                    invoice_id = %invoice.invoice_id,
                    invoice_number = invoice.invoice_number,
                    "Invoice created"
                );
                Ok(invoice)
            }
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                info!(
                    stage_id = %input.stage_id,
                    "Invoice already exists for stage, preferring existing record"
                );
                self.find_invoice_by_stage(input.stage_id).await?.ok_or_else(|| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "invoice for stage {} vanished after unique violation",
                        input.stage_id
                    ))
                })
            }
            Err(e) => Err(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to create invoice: {}",
                e
            ))),
        }
    }

    /// Backfill the frozen snapshot of a legacy invoice. Guarded so a
    /// populated snapshot is never overwritten; returns the stored row
    /// either way.
    #[instrument(skip(self, snapshot), fields(invoice_id = %invoice_id))]
    pub async fn backfill_snapshot(
        &self,
        invoice_id: Uuid,
        snapshot: &ClientSnapshot,
        issue_timestamp: &str,
        exchange_rate: Decimal,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["backfill_snapshot"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE invoices
            SET legal_name = $2,
                document_type = $3,
                document_number = $4,
                address = $5,
                city = $6,
                department = $7,
                country = $8,
                email = $9,
                phone = $10,
                issue_timestamp = $11,
                exchange_rate = $12
            WHERE invoice_id = $1 AND legal_name IS NULL
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .bind(&snapshot.legal_name)
        .bind(&snapshot.document_type)
        .bind(&snapshot.document_number)
        .bind(&snapshot.address)
        .bind(&snapshot.city)
        .bind(&snapshot.department)
        .bind(&snapshot.country)
        .bind(&snapshot.email)
        .bind(&snapshot.phone)
        .bind(issue_timestamp)
        .bind(exchange_rate)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to backfill snapshot: {}", e))
        })?;

        timer.observe_duration();

        match invoice {
            Some(invoice) => {
                info!(invoice_id = %invoice.invoice_id, "Invoice snapshot backfilled");
                Ok(Some(invoice))
            }
            // Already populated or missing; hand back whatever is stored.
            None => self.get_invoice(invoice_id).await,
        }
    }

    /// Persist an authority acceptance. Guarded on `cdc IS NULL`; an
    /// already-authorized invoice is left untouched.
    #[instrument(skip(self, receipt), fields(invoice_id = %invoice_id))]
    pub async fn record_authority_result(
        &self,
        invoice_id: Uuid,
        receipt: &AuthorityReceipt,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_authority_result"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE invoices
            SET cdc = $2,
                authorization_protocol = $3,
                authority_status = $4,
                authority_document = $5,
                verification_code = $6,
                authority_error = NULL
            WHERE invoice_id = $1 AND cdc IS NULL
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .bind(&receipt.cdc)
        .bind(&receipt.protocol)
        .bind(&receipt.status)
        .bind(&receipt.raw_document)
        .bind(&receipt.display_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record authority result: {}", e))
        })?;

        timer.observe_duration();

        match invoice {
            Some(invoice) => {
                info!(
                    invoice_id = %invoice.invoice_id,
                    cdc = %invoice.cdc.as_deref().unwrap_or(""),
                    "Authority result recorded"
                );
                Ok(Some(invoice))
            }
            None => self.get_invoice(invoice_id).await,
        }
    }

    /// Persist a submission failure, leaving `cdc` empty so the next read
    /// retries.
    #[instrument(skip(self, message), fields(invoice_id = %invoice_id))]
    pub async fn record_authority_error(
        &self,
        invoice_id: Uuid,
        message: &str,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_authority_error"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE invoices
            SET authority_error = $2
            WHERE invoice_id = $1 AND cdc IS NULL
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .bind(message)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record authority error: {}", e))
        })?;

        timer.observe_duration();

        match invoice {
            Some(invoice) => Ok(Some(invoice)),
            None => self.get_invoice(invoice_id).await,
        }
    }

    /// List invoices with optional filters.
    #[instrument(skip(self, filter))]
    pub async fn list_invoices(
        &self,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;

        let invoices = if let Some(cursor) = filter.page_token {
            sqlx::query_as::<_, Invoice>(&format!(
                r#"
                SELECT {}
                FROM invoices
                WHERE ($1::uuid IS NULL OR client_id = $1)
                  AND ($2::uuid IS NULL OR project_id = $2)
                  AND invoice_id > $3
                ORDER BY invoice_id
                LIMIT $4
                "#,
                INVOICE_COLUMNS
            ))
            .bind(filter.client_id)
            .bind(filter.project_id)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Invoice>(&format!(
                r#"
                SELECT {}
                FROM invoices
                WHERE ($1::uuid IS NULL OR client_id = $1)
                  AND ($2::uuid IS NULL OR project_id = $2)
                ORDER BY invoice_id
                LIMIT $3
                "#,
                INVOICE_COLUMNS
            ))
            .bind(filter.client_id)
            .bind(filter.project_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list invoices: {}", e)))?;

        timer.observe_duration();

        Ok(invoices)
    }

    // -------------------------------------------------------------------------
    // Exchange Rate Operations
    // -------------------------------------------------------------------------

    /// The active exchange rate row, if any.
    #[instrument(skip(self))]
    pub async fn active_rate(&self) -> Result<Option<ExchangeRate>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["active_rate"])
            .start_timer();

        let rate = sqlx::query_as::<_, ExchangeRate>(
            r#"
            SELECT rate_id, rate, active, updated_by, updated_utc
            FROM exchange_rates
            WHERE active = TRUE
            ORDER BY updated_utc DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get active rate: {}", e)))?;

        timer.observe_duration();

        Ok(rate)
    }

    /// Replace the active exchange rate in one transaction.
    #[instrument(skip(self), fields(updated_by = %updated_by))]
    pub async fn set_active_rate(
        &self,
        rate: Decimal,
        updated_by: Uuid,
    ) -> Result<ExchangeRate, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_active_rate"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query("UPDATE exchange_rates SET active = FALSE WHERE active = TRUE")
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to deactivate rates: {}", e))
            })?;

        let row = sqlx::query_as::<_, ExchangeRate>(
            r#"
            INSERT INTO exchange_rates (rate_id, rate, active, updated_by)
            VALUES ($1, $2, TRUE, $3)
            RETURNING rate_id, rate, active, updated_by, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(rate)
        .bind(updated_by)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert rate: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit rate change: {}", e))
        })?;

        timer.observe_duration();

        info!(rate = %row.rate, "Exchange rate updated");

        Ok(row)
    }

    // -------------------------------------------------------------------------
    // Directory Operations
    // -------------------------------------------------------------------------

    /// Get a client's live billing profile.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_billing_profile(
        &self,
        user_id: Uuid,
    ) -> Result<Option<BillingProfile>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_billing_profile"])
            .start_timer();

        let profile = sqlx::query_as::<_, BillingProfile>(
            r#"
            SELECT user_id, legal_name, document_type, document_number, address, city,
                department, country, email, phone
            FROM billing_profiles
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get billing profile: {}", e))
        })?;

        timer.observe_duration();

        Ok(profile)
    }

    /// Create or update a client's billing profile. The live profile is
    /// always editable; frozen invoice snapshots are unaffected.
    #[instrument(skip(self, profile), fields(user_id = %profile.user_id))]
    pub async fn upsert_billing_profile(
        &self,
        profile: &BillingProfile,
    ) -> Result<BillingProfile, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_billing_profile"])
            .start_timer();

        let stored = sqlx::query_as::<_, BillingProfile>(
            r#"
            INSERT INTO billing_profiles (
                user_id, legal_name, document_type, document_number, address, city,
                department, country, email, phone
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id) DO UPDATE
            SET legal_name = EXCLUDED.legal_name,
                document_type = EXCLUDED.document_type,
                document_number = EXCLUDED.document_number,
                address = EXCLUDED.address,
                city = EXCLUDED.city,
                department = EXCLUDED.department,
                country = EXCLUDED.country,
                email = EXCLUDED.email,
                phone = EXCLUDED.phone
            RETURNING user_id, legal_name, document_type, document_number, address, city,
                department, country, email, phone
            "#,
        )
        .bind(profile.user_id)
        .bind(&profile.legal_name)
        .bind(&profile.document_type)
        .bind(&profile.document_number)
        .bind(&profile.address)
        .bind(&profile.city)
        .bind(&profile.department)
        .bind(&profile.country)
        .bind(&profile.email)
        .bind(&profile.phone)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to upsert billing profile: {}", e))
        })?;

        timer.observe_duration();

        info!(user_id = %stored.user_id, "Billing profile saved");

        Ok(stored)
    }

    /// Look up a user's contact details.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_contact(&self, user_id: Uuid) -> Result<Option<Contact>, AppError> {
        let contact = sqlx::query_as::<_, Contact>(
            "SELECT user_id, full_name, email FROM portal_users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get contact: {}", e)))?;

        Ok(contact)
    }

    /// Contact details of every admin, for submission alerts.
    #[instrument(skip(self))]
    pub async fn admin_contacts(&self) -> Result<Vec<Contact>, AppError> {
        let contacts = sqlx::query_as::<_, Contact>(
            "SELECT user_id, full_name, email FROM portal_users WHERE role = 'admin'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list admin contacts: {}", e))
        })?;

        Ok(contacts)
    }
}

// Port implementations: the engines see the database through these traits.

#[async_trait]
impl ProjectRepository for Database {
    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, AppError> {
        Database::get_project(self, project_id).await
    }

    async fn set_progress(
        &self,
        project_id: Uuid,
        progress: i32,
    ) -> Result<Option<Project>, AppError> {
        Database::set_progress(self, project_id, progress).await
    }
}

#[async_trait]
impl StageRepository for Database {
    async fn get_stage(&self, stage_id: Uuid) -> Result<Option<PaymentStage>, AppError> {
        Database::get_stage(self, stage_id).await
    }

    async fn list_stages(&self, project_id: Uuid) -> Result<Vec<PaymentStage>, AppError> {
        Database::list_stages(self, project_id).await
    }

    async fn mark_available(&self, stage_id: Uuid) -> Result<Option<PaymentStage>, AppError> {
        Database::mark_available(self, stage_id).await
    }

    async fn begin_verification(
        &self,
        stage_id: Uuid,
        payment_method: &str,
        proof_reference: Option<&str>,
    ) -> Result<Option<PaymentStage>, AppError> {
        Database::begin_verification(self, stage_id, payment_method, proof_reference).await
    }

    async fn approve_stage(
        &self,
        stage_id: Uuid,
        frozen_rate: Decimal,
        approved_by: Uuid,
        paid_utc: DateTime<Utc>,
    ) -> Result<Option<PaymentStage>, AppError> {
        Database::approve_stage(self, stage_id, frozen_rate, approved_by, paid_utc).await
    }

    async fn reopen_stage(
        &self,
        stage_id: Uuid,
        reason: &str,
    ) -> Result<Option<PaymentStage>, AppError> {
        Database::reopen_stage(self, stage_id, reason).await
    }
}

#[async_trait]
impl InvoiceRepository for Database {
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        Database::get_invoice(self, invoice_id).await
    }

    async fn find_invoice_by_stage(&self, stage_id: Uuid) -> Result<Option<Invoice>, AppError> {
        Database::find_invoice_by_stage(self, stage_id).await
    }

    async fn create_invoice(&self, input: &CreateInvoice) -> Result<Invoice, AppError> {
        Database::create_invoice(self, input).await
    }

    async fn backfill_snapshot(
        &self,
        invoice_id: Uuid,
        snapshot: &ClientSnapshot,
        issue_timestamp: &str,
        exchange_rate: Decimal,
    ) -> Result<Option<Invoice>, AppError> {
        Database::backfill_snapshot(self, invoice_id, snapshot, issue_timestamp, exchange_rate)
            .await
    }

    async fn record_authority_result(
        &self,
        invoice_id: Uuid,
        receipt: &AuthorityReceipt,
    ) -> Result<Option<Invoice>, AppError> {
        Database::record_authority_result(self, invoice_id, receipt).await
    }

    async fn record_authority_error(
        &self,
        invoice_id: Uuid,
        message: &str,
    ) -> Result<Option<Invoice>, AppError> {
        Database::record_authority_error(self, invoice_id, message).await
    }
}

#[async_trait]
impl crate::services::ports::Directory for Database {
    async fn billing_profile(&self, user_id: Uuid) -> Result<Option<BillingProfile>, AppError> {
        self.get_billing_profile(user_id).await
    }

    async fn contact(&self, user_id: Uuid) -> Result<Option<Contact>, AppError> {
        self.get_contact(user_id).await
    }

    async fn admin_contacts(&self) -> Result<Vec<Contact>, AppError> {
        Database::admin_contacts(self).await
    }
}
