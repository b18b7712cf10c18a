use axum::{
    Json,
    extract::{Path, Query, State},
};
use portal_core::auth::{Principal, Role};
use portal_core::error::AppError;
use serde::Deserialize;
use uuid::Uuid;

use crate::models::{Invoice, ListInvoicesFilter};
use crate::services::InvoiceDocumentView;
use crate::startup::AppState;

#[derive(Debug, Deserialize)]
pub struct ListInvoicesQuery {
    pub project_id: Option<Uuid>,
    pub page_size: Option<i32>,
    pub page_token: Option<Uuid>,
}

/// List invoices. Admins see everything; clients only their own.
#[tracing::instrument(skip(state, query))]
pub async fn list_invoices(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<ListInvoicesQuery>,
) -> Result<Json<Vec<Invoice>>, AppError> {
    let client_id = match principal.role {
        Role::Admin => None,
        Role::Client => Some(principal.user_id),
        Role::Partner => {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "partners cannot list invoices"
            )));
        }
    };

    let filter = ListInvoicesFilter {
        client_id,
        project_id: query.project_id,
        page_size: query.page_size.unwrap_or(50),
        page_token: query.page_token,
    };

    let invoices = state.db.list_invoices(&filter).await?;

    Ok(Json(invoices))
}

/// The downloadable document view of an invoice: frozen snapshot, frozen
/// rate, and the authority result when present. A missing authority result
/// triggers a lazy resubmission; the document renders either way.
#[tracing::instrument(skip(state), fields(invoice_id = %invoice_id))]
pub async fn invoice_document(
    State(state): State<AppState>,
    principal: Principal,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceDocumentView>, AppError> {
    let invoice = state
        .db
        .get_invoice(invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("invoice {} not found", invoice_id)))?;

    match principal.role {
        Role::Admin => {}
        Role::Client if invoice.client_id == principal.user_id => {}
        Role::Client | Role::Partner => {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "invoice belongs to another client"
            )));
        }
    }

    let view = state.issuer.document(invoice_id).await?;

    Ok(Json(view))
}
