//! Payment stage model and its state machine.
//!
//! A stage is a percentage slice of a project's total price, payable once
//! the project's progress reaches the stage threshold. All status changes
//! go through [`StageStatus::can_transition`]; callers never compare status
//! strings directly.

use chrono::{DateTime, Utc};
use portal_core::error::AppError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Payment stage status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Available,
    PendingVerification,
    Paid,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Available => "available",
            StageStatus::PendingVerification => "pending_verification",
            StageStatus::Paid => "paid",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "available" => StageStatus::Available,
            "pending_verification" => StageStatus::PendingVerification,
            "paid" => StageStatus::Paid,
            _ => StageStatus::Pending,
        }
    }

    /// The single source of truth for legal transitions.
    ///
    /// Rejection is not a persisted state: a rejected stage returns to
    /// `Available` with the reason kept as metadata, so the client can
    /// resubmit through the same transition. `Paid` is terminal.
    pub fn can_transition(self, next: StageStatus) -> bool {
        matches!(
            (self, next),
            (StageStatus::Pending, StageStatus::Available)
                | (StageStatus::Available, StageStatus::PendingVerification)
                | (StageStatus::PendingVerification, StageStatus::Paid)
                | (StageStatus::PendingVerification, StageStatus::Available)
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment stage row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentStage {
    pub stage_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub percentage: Decimal,
    pub amount: Decimal,
    pub required_progress: i32,
    pub status: String,
    pub payment_method: Option<String>,
    pub proof_reference: Option<String>,
    pub rejection_reason: Option<String>,
    pub frozen_exchange_rate: Option<Decimal>,
    pub paid_utc: Option<DateTime<Utc>>,
    pub approved_by: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl PaymentStage {
    pub fn status(&self) -> StageStatus {
        StageStatus::from_string(&self.status)
    }

    /// Guard an intended transition, surfacing an invalid one as a
    /// validation error rather than a silent success.
    pub fn check_transition(&self, next: StageStatus) -> Result<(), AppError> {
        let current = self.status();
        if current.can_transition(next) {
            Ok(())
        } else {
            Err(AppError::BadRequest(anyhow::anyhow!(
                "stage {} cannot move from {} to {}",
                self.stage_id,
                current,
                next
            )))
        }
    }
}

/// One entry of a stage plan.
#[derive(Debug, Clone, Deserialize)]
pub struct StagePlanItem {
    pub name: String,
    pub percentage: Decimal,
    pub required_progress: i32,
}

/// Compute a stage amount from the project price. Fixed at creation time.
pub fn stage_amount(total_price: Decimal, percentage: Decimal) -> Decimal {
    (total_price * percentage / Decimal::from(100)).round_dp(2)
}

/// The client-facing "next payment": the lowest-threshold `available`
/// stage. Even when a progress jump leaves several stages available, only
/// this one is presented as actionable.
pub fn next_payable_stage(stages: &[PaymentStage]) -> Option<&PaymentStage> {
    stages
        .iter()
        .filter(|s| s.status() == StageStatus::Available)
        .min_by_key(|s| s.required_progress)
}

/// Validate a stage plan: thresholds monotonically non-decreasing, every
/// value in range, percentages summing to exactly 100.
pub fn validate_stage_plan(items: &[StagePlanItem]) -> Result<(), AppError> {
    if items.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "a stage plan requires at least one stage"
        )));
    }

    let hundred = Decimal::from(100);
    let mut previous_threshold = 0i32;
    let mut total_percentage = Decimal::ZERO;

    for (index, item) in items.iter().enumerate() {
        if item.percentage <= Decimal::ZERO || item.percentage > hundred {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "stage {} percentage must be within (0, 100]",
                index + 1
            )));
        }
        if !(0..=100).contains(&item.required_progress) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "stage {} required progress must be within 0..=100",
                index + 1
            )));
        }
        if item.required_progress < previous_threshold {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "stage thresholds must be non-decreasing (stage {} at {}% follows {}%)",
                index + 1,
                item.required_progress,
                previous_threshold
            )));
        }
        previous_threshold = item.required_progress;
        total_percentage += item.percentage;
    }

    if total_percentage != hundred {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "stage percentages must sum to 100, got {}",
            total_percentage
        )));
    }

    Ok(())
}
