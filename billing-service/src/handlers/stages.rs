use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use portal_core::auth::{Principal, Role};
use portal_core::error::AppError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{Invoice, PaymentStage};
use crate::services::ProofUpload;
use crate::startup::AppState;

/// Client submits a payment method and optional proof file for an
/// available stage (multipart: `payment_method` text, `proof` file).
#[tracing::instrument(skip(state, multipart), fields(stage_id = %stage_id))]
pub async fn submit_payment(
    State(state): State<AppState>,
    principal: Principal,
    Path(stage_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<PaymentStage>), AppError> {
    match principal.role {
        Role::Client => {}
        Role::Admin | Role::Partner => {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "only the project client can submit a payment"
            )));
        }
    }

    let mut payment_method: Option<String> = None;
    let mut proof: Option<ProofUpload> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("invalid multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("payment_method") => {
                payment_method = Some(field.text().await.map_err(|e| {
                    AppError::BadRequest(anyhow::anyhow!("unreadable payment_method field: {}", e))
                })?);
            }
            Some("proof") => {
                let filename = field.file_name().unwrap_or("proof").to_string();
                let bytes = field.bytes().await.map_err(|e| {
                    AppError::BadRequest(anyhow::anyhow!("unreadable proof upload: {}", e))
                })?;
                proof = Some(ProofUpload {
                    filename,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {}
        }
    }

    let payment_method = payment_method.ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!("payment_method field is required"))
    })?;

    let stage = state
        .lifecycle
        .submit_payment(principal.user_id, stage_id, &payment_method, proof)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(stage)))
}

#[derive(Debug, Serialize)]
pub struct ApprovalResponse {
    pub stage: PaymentStage,
    pub invoice: Invoice,
}

/// Admin confirms a payment. The invoice is created synchronously; the
/// electronic submission runs out-of-band.
#[tracing::instrument(skip(state), fields(stage_id = %stage_id))]
pub async fn approve(
    State(state): State<AppState>,
    principal: Principal,
    Path(stage_id): Path<Uuid>,
) -> Result<Json<ApprovalResponse>, AppError> {
    principal.require_admin()?;

    let (stage, invoice) = state.lifecycle.approve(principal.user_id, stage_id).await?;

    Ok(Json(ApprovalResponse { stage, invoice }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct RejectRequest {
    #[validate(length(min = 1, message = "Rejection reason cannot be empty"))]
    pub reason: String,
}

/// Admin rejects a payment with a mandatory reason; the stage reopens.
#[tracing::instrument(skip(state, request), fields(stage_id = %stage_id))]
pub async fn reject(
    State(state): State<AppState>,
    principal: Principal,
    Path(stage_id): Path<Uuid>,
    Json(request): Json<RejectRequest>,
) -> Result<Json<PaymentStage>, AppError> {
    principal.require_admin()?;
    request.validate()?;

    let stage = state
        .lifecycle
        .reject(principal.user_id, stage_id, &request.reason)
        .await?;

    Ok(Json(stage))
}

/// Download the proof attached to a stage. Restricted to the project's
/// client and admins.
#[tracing::instrument(skip(state), fields(stage_id = %stage_id))]
pub async fn download_proof(
    State(state): State<AppState>,
    principal: Principal,
    Path(stage_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let stage = state
        .db
        .get_stage(stage_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("stage {} not found", stage_id)))?;
    let project = state
        .db
        .get_project(stage.project_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("project {} not found", stage.project_id))
        })?;

    match principal.role {
        Role::Admin => {}
        Role::Client if project.client_id == principal.user_id => {}
        Role::Client | Role::Partner => {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "proof access is restricted to the project client and admins"
            )));
        }
    }

    let reference = stage.proof_reference.as_deref().ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!("stage {} has no proof attached", stage_id))
    })?;

    let bytes = state.proofs.load(reference).await?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}
