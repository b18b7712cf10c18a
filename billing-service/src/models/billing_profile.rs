//! Billing profile and contact models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A client's live billing profile. Editable at any time; invoices copy it
/// into an immutable snapshot at issuance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingProfile {
    pub user_id: Uuid,
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

/// A notification recipient.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Contact {
    pub user_id: Uuid,
    pub full_name: String,
    pub email: String,
}
