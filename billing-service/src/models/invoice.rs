//! Invoice model.
//!
//! An invoice freezes the financial facts of a confirmed payment: the
//! client's legal identity, the issue timestamp, and the exchange rate in
//! force at approval. Snapshot fields are written once and never resynced
//! from the live billing profile.

use crate::models::BillingProfile;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Issued,
    Paid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::Paid => "paid",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "issued" => InvoiceStatus::Issued,
            _ => InvoiceStatus::Paid,
        }
    }
}

/// An invoice row. One per payment stage, enforced by a unique constraint
/// on `stage_id`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub project_id: Uuid,
    pub client_id: Uuid,
    pub stage_id: Uuid,
    pub invoice_number: i64,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub due_date: Option<NaiveDate>,
    pub paid_date: Option<NaiveDate>,
    // Frozen client snapshot. Nullable only for legacy rows awaiting a
    // one-time backfill.
    pub legal_name: Option<String>,
    pub document_type: Option<String>,
    pub document_number: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub department: Option<String>,
    pub country: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Formatted once at issuance, never recalculated.
    pub issue_timestamp: Option<String>,
    pub exchange_rate: Option<Decimal>,
    // Authority result. `cdc` present means the invoice was legally issued
    // and must never be resubmitted.
    pub cdc: Option<String>,
    pub authorization_protocol: Option<String>,
    pub authority_status: Option<String>,
    pub authority_document: Option<String>,
    pub verification_code: Option<String>,
    pub authority_error: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }

    /// Whether the frozen snapshot has been populated.
    pub fn has_snapshot(&self) -> bool {
        self.legal_name.is_some() && self.issue_timestamp.is_some()
    }

    /// Whether the external authority has accepted this invoice.
    pub fn is_authorized(&self) -> bool {
        self.cdc.is_some()
    }
}

/// The client identity captured at issuance time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub legal_name: String,
    pub document_type: String,
    pub document_number: String,
    pub address: String,
    pub city: String,
    pub department: String,
    pub country: String,
    pub email: String,
    pub phone: String,
}

impl From<&BillingProfile> for ClientSnapshot {
    fn from(profile: &BillingProfile) -> Self {
        ClientSnapshot {
            legal_name: profile.legal_name.clone(),
            document_type: profile.document_type.clone(),
            document_number: profile.document_number.clone(),
            address: profile.address.clone(),
            city: profile.city.clone(),
            department: profile.department.clone(),
            country: profile.country.clone(),
            email: profile.email.clone(),
            phone: profile.phone.clone(),
        }
    }
}

/// Input for creating an invoice.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub project_id: Uuid,
    pub client_id: Uuid,
    pub stage_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub paid_date: Option<NaiveDate>,
    pub snapshot: ClientSnapshot,
    pub issue_timestamp: String,
    pub exchange_rate: Decimal,
}

/// Filter parameters for listing invoices.
#[derive(Debug, Clone, Default)]
pub struct ListInvoicesFilter {
    pub client_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

/// Format the issue timestamp written onto new invoices. The result is a
/// plain string so later reads never recalculate it.
pub fn format_issue_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn issue_timestamp_is_a_stable_string() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        assert_eq!(format_issue_timestamp(at), "2026-03-14 15:09:26");
    }

    #[test]
    fn snapshot_presence_requires_both_identity_and_timestamp() {
        let base = Invoice {
            invoice_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            stage_id: Uuid::new_v4(),
            invoice_number: 1,
            amount: Decimal::from(1000),
            currency: "USD".to_string(),
            status: "paid".to_string(),
            due_date: None,
            paid_date: None,
            legal_name: None,
            document_type: None,
            document_number: None,
            address: None,
            city: None,
            department: None,
            country: None,
            email: None,
            phone: None,
            issue_timestamp: None,
            exchange_rate: None,
            cdc: None,
            authorization_protocol: None,
            authority_status: None,
            authority_document: None,
            verification_code: None,
            authority_error: None,
            created_utc: Utc::now(),
        };
        assert!(!base.has_snapshot());

        let mut with_name = base.clone();
        with_name.legal_name = Some("ACME S.A.".to_string());
        assert!(!with_name.has_snapshot());

        with_name.issue_timestamp = Some("2026-03-14 15:09:26".to_string());
        assert!(with_name.has_snapshot());
    }
}
