use axum::{
    Json,
    extract::{Path, State},
};
use portal_core::auth::{Principal, Role};
use portal_core::error::AppError;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::models::BillingProfile;
use crate::startup::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct BillingProfileRequest {
    #[validate(length(min = 1, message = "Legal name cannot be empty"))]
    pub legal_name: String,
    #[validate(length(min = 1, message = "Document type cannot be empty"))]
    pub document_type: String,
    #[validate(length(min = 1, message = "Document number cannot be empty"))]
    pub document_number: String,
    pub address: String,
    pub city: String,
    pub department: String,
    pub country: String,
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    pub phone: String,
}

/// Read a billing profile: the owner or an admin.
#[tracing::instrument(skip(state), fields(user_id = %user_id))]
pub async fn get_profile(
    State(state): State<AppState>,
    principal: Principal,
    Path(user_id): Path<Uuid>,
) -> Result<Json<BillingProfile>, AppError> {
    authorize_profile_access(&principal, user_id)?;

    let profile = state.db.get_billing_profile(user_id).await?.ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!("billing profile for {} not found", user_id))
    })?;

    Ok(Json(profile))
}

/// Create or update a billing profile. Edits never touch the frozen
/// snapshots of already-issued invoices.
#[tracing::instrument(skip(state, request), fields(user_id = %user_id))]
pub async fn upsert_profile(
    State(state): State<AppState>,
    principal: Principal,
    Path(user_id): Path<Uuid>,
    Json(request): Json<BillingProfileRequest>,
) -> Result<Json<BillingProfile>, AppError> {
    authorize_profile_access(&principal, user_id)?;
    request.validate()?;

    let profile = BillingProfile {
        user_id,
        legal_name: request.legal_name,
        document_type: request.document_type,
        document_number: request.document_number,
        address: request.address,
        city: request.city,
        department: request.department,
        country: request.country,
        email: request.email,
        phone: request.phone,
    };

    let stored = state.db.upsert_billing_profile(&profile).await?;

    Ok(Json(stored))
}

fn authorize_profile_access(principal: &Principal, user_id: Uuid) -> Result<(), AppError> {
    match principal.role {
        Role::Admin => Ok(()),
        Role::Client if principal.user_id == user_id => Ok(()),
        Role::Client | Role::Partner => Err(AppError::Forbidden(anyhow::anyhow!(
            "billing profile belongs to another user"
        ))),
    }
}
