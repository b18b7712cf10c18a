//! Stage activation engine.
//!
//! Reacts to project progress changes: every `pending` stage whose
//! threshold is now met becomes `available`, in threshold order. The
//! engine is idempotent; re-invocation with the same or lower progress
//! touches nothing.

use crate::models::{PaymentStage, Project, StageStatus};
use crate::services::metrics::STAGE_TRANSITIONS_TOTAL;
use crate::services::notify::Severity;
use crate::services::ports::{Directory, NotificationGateway, ProjectRepository, StageRepository};
use portal_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

#[derive(Clone)]
pub struct ActivationEngine {
    projects: Arc<dyn ProjectRepository>,
    stages: Arc<dyn StageRepository>,
    directory: Arc<dyn Directory>,
    notifier: Arc<dyn NotificationGateway>,
}

impl ActivationEngine {
    pub fn new(
        projects: Arc<dyn ProjectRepository>,
        stages: Arc<dyn StageRepository>,
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn NotificationGateway>,
    ) -> Self {
        Self {
            projects,
            stages,
            directory,
            notifier,
        }
    }

    /// Persist the new progress and activate every eligible pending stage.
    /// A jump activates all stages whose threshold it clears, none skipped.
    #[instrument(skip(self), fields(project_id = %project_id, new_progress = new_progress))]
    pub async fn on_progress_changed(
        &self,
        project_id: Uuid,
        new_progress: i32,
    ) -> Result<(Project, Vec<PaymentStage>), AppError> {
        if !(0..=100).contains(&new_progress) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "progress must be within 0..=100"
            )));
        }

        let project = self
            .projects
            .set_progress(project_id, new_progress)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("project {} not found", project_id))
            })?;

        let stages = self.stages.list_stages(project_id).await?;
        let mut activated = Vec::new();

        for stage in stages {
            if stage.status() != StageStatus::Pending || stage.required_progress > new_progress {
                continue;
            }

            // Guarded update; a concurrent activation losing the race is
            // simply skipped.
            if let Some(updated) = self.stages.mark_available(stage.stage_id).await? {
                STAGE_TRANSITIONS_TOTAL
                    .with_label_values(&["available"])
                    .inc();
                tracing::info!(
                    stage_id = %updated.stage_id,
                    threshold = updated.required_progress,
                    "Stage activated"
                );
                self.notify_client(&project, &updated).await;
                activated.push(updated);
            }
        }

        Ok((project, activated))
    }

    async fn notify_client(&self, project: &Project, stage: &PaymentStage) {
        self.notifier
            .notify(
                project.client_id,
                "Payment stage available",
                &format!(
                    "Stage '{}' of project '{}' is now available for payment.",
                    stage.name, project.name
                ),
                Severity::Info,
            )
            .await;

        match self.directory.contact(project.client_id).await {
            Ok(Some(contact)) => {
                let subject = format!("Payment available: {}", stage.name);
                let body = format!(
                    "<p>Hello {},</p>\
                     <p>Stage <strong>{}</strong> of project <strong>{}</strong> is now \
                     available for payment (USD {}).</p>",
                    contact.full_name, stage.name, project.name, stage.amount
                );
                self.notifier.send_email(&contact.email, &subject, &body).await;
            }
            Ok(None) => {
                tracing::warn!(client_id = %project.client_id, "No contact for client, skipping email");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to look up client contact");
            }
        }
    }
}
