//! Exchange rate configuration model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// An USD to PYG exchange rate row. Only one row is active at a time; a
/// stage freezes a copy of the active rate at approval and never re-reads
/// it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExchangeRate {
    pub rate_id: Uuid,
    pub rate: Decimal,
    pub active: bool,
    pub updated_by: Option<Uuid>,
    pub updated_utc: DateTime<Utc>,
}
