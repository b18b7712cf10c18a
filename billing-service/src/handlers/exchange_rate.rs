use axum::{Json, extract::State};
use portal_core::auth::Principal;
use portal_core::error::AppError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::ExchangeRate;
use crate::services::ports::RateSource;
use crate::startup::AppState;

#[derive(Debug, Serialize)]
pub struct CurrentRateResponse {
    pub rate: Decimal,
    /// Whether the rate comes from an admin-set configuration row.
    pub configured: bool,
}

/// The rate currently in force, visible to any authenticated user.
#[tracing::instrument(skip(state))]
pub async fn get_rate(
    State(state): State<AppState>,
    _principal: Principal,
) -> Result<Json<CurrentRateResponse>, AppError> {
    match state.fx.active_rate().await? {
        Some(row) => Ok(Json(CurrentRateResponse {
            rate: row.rate,
            configured: true,
        })),
        None => Ok(Json(CurrentRateResponse {
            rate: state.fx.current_rate().await,
            configured: false,
        })),
    }
}

#[derive(Debug, Deserialize)]
pub struct SetRateRequest {
    pub rate: Decimal,
}

/// Admin sets the active rate. Stages approved afterward freeze this
/// value.
#[tracing::instrument(skip(state, request))]
pub async fn set_rate(
    State(state): State<AppState>,
    principal: Principal,
    Json(request): Json<SetRateRequest>,
) -> Result<Json<ExchangeRate>, AppError> {
    principal.require_admin()?;

    let row = state.fx.set_rate(request.rate, principal.user_id).await?;

    Ok(Json(row))
}
