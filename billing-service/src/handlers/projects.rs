use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use portal_core::auth::{Principal, Role};
use portal_core::error::AppError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    CreateProject, PaymentStage, Project, StagePlanItem, next_payable_stage, validate_stage_plan,
};
use crate::startup::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateProjectRequest {
    pub client_id: Uuid,
    #[validate(length(min = 1, message = "Project name cannot be empty"))]
    pub name: String,
    pub total_price: Decimal,
}

#[tracing::instrument(skip(state, request))]
pub async fn create_project(
    State(state): State<AppState>,
    principal: Principal,
    Json(request): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), AppError> {
    principal.require_admin()?;
    request.validate()?;

    if request.total_price <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "total price must be positive"
        )));
    }

    let project = state
        .db
        .create_project(&CreateProject {
            client_id: request.client_id,
            name: request.name,
            total_price: request.total_price,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(project)))
}

#[derive(Debug, Deserialize)]
pub struct StagePlanRequest {
    pub stages: Vec<StagePlanItem>,
}

#[tracing::instrument(skip(state, request), fields(project_id = %project_id))]
pub async fn create_stage_plan(
    State(state): State<AppState>,
    principal: Principal,
    Path(project_id): Path<Uuid>,
    Json(request): Json<StagePlanRequest>,
) -> Result<(StatusCode, Json<Vec<PaymentStage>>), AppError> {
    principal.require_admin()?;
    validate_stage_plan(&request.stages)?;

    let project = state.db.get_project(project_id).await?.ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!("project {} not found", project_id))
    })?;

    let stages = state.db.create_stage_plan(&project, &request.stages).await?;

    Ok((StatusCode::CREATED, Json(stages)))
}

#[tracing::instrument(skip(state), fields(project_id = %project_id))]
pub async fn list_stages(
    State(state): State<AppState>,
    principal: Principal,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Vec<PaymentStage>>, AppError> {
    let project = state.db.get_project(project_id).await?.ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!("project {} not found", project_id))
    })?;
    authorize_project_access(&principal, &project)?;

    let stages = state.db.list_stages(project_id).await?;

    Ok(Json(stages))
}

#[tracing::instrument(skip(state), fields(project_id = %project_id))]
pub async fn next_stage(
    State(state): State<AppState>,
    principal: Principal,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Option<PaymentStage>>, AppError> {
    let project = state.db.get_project(project_id).await?.ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!("project {} not found", project_id))
    })?;
    authorize_project_access(&principal, &project)?;

    let stages = state.db.list_stages(project_id).await?;

    Ok(Json(next_payable_stage(&stages).cloned()))
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateProgressRequest {
    #[validate(range(min = 0, max = 100, message = "Progress must be within 0..=100"))]
    pub progress: i32,
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub project: Project,
    pub activated: Vec<PaymentStage>,
}

#[tracing::instrument(skip(state, request), fields(project_id = %project_id))]
pub async fn update_progress(
    State(state): State<AppState>,
    principal: Principal,
    Path(project_id): Path<Uuid>,
    Json(request): Json<UpdateProgressRequest>,
) -> Result<Json<ProgressResponse>, AppError> {
    principal.require_admin()?;
    request.validate()?;

    let (project, activated) = state
        .activation
        .on_progress_changed(project_id, request.progress)
        .await?;

    Ok(Json(ProgressResponse { project, activated }))
}

fn authorize_project_access(principal: &Principal, project: &Project) -> Result<(), AppError> {
    match principal.role {
        Role::Admin => Ok(()),
        Role::Client if project.client_id == principal.user_id => Ok(()),
        Role::Client => Err(AppError::Forbidden(anyhow::anyhow!(
            "project belongs to another client"
        ))),
        Role::Partner => Err(AppError::Forbidden(anyhow::anyhow!(
            "partners cannot access project billing"
        ))),
    }
}
