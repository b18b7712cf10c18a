//! Real-time and email notification fan-out.
//!
//! The connection registry is an injected component with an explicit
//! lifecycle: transports register a channel per connected user and
//! deregister on disconnect. Delivery is fire-and-forget; a failed
//! notification never fails the state transition that triggered it.

use crate::config::SmtpConfig;
use crate::services::metrics::NOTIFICATIONS_TOTAL;
use crate::services::ports::NotificationGateway;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use portal_core::error::AppError;
use secrecy::ExposeSecret;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

/// Notification severity shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// An event delivered to connected clients.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeEvent {
    pub title: String,
    pub message: String,
    pub severity: String,
    pub sent_utc: DateTime<Utc>,
}

/// Registry of live client connections keyed by user id.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<Uuid, Vec<mpsc::UnboundedSender<RealtimeEvent>>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a user. The returned receiver is owned by
    /// the transport and dropped on disconnect.
    pub async fn register(&self, user_id: Uuid) -> mpsc::UnboundedReceiver<RealtimeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .write()
            .await
            .entry(user_id)
            .or_default()
            .push(tx);
        rx
    }

    /// Drop every connection of a user.
    pub async fn deregister(&self, user_id: Uuid) {
        self.connections.write().await.remove(&user_id);
    }

    /// Deliver an event to every live connection of a user, pruning closed
    /// ones. Returns the number of connections reached.
    pub async fn push(&self, user_id: Uuid, event: RealtimeEvent) -> usize {
        let mut connections = self.connections.write().await;
        let Some(senders) = connections.get_mut(&user_id) else {
            return 0;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        let delivered = senders.len();
        if senders.is_empty() {
            connections.remove(&user_id);
        }
        delivered
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.values().map(Vec::len).sum()
    }
}

/// Outbound email transport.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), AppError>;

    fn is_enabled(&self) -> bool;
}

/// SMTP transport backed by lettre.
pub struct SmtpMailer {
    config: SmtpConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Result<Self, AppError> {
        if !config.enabled {
            return Ok(Self {
                config,
                transport: None,
            });
        }

        let creds = Credentials::new(
            config.user.clone(),
            config.password.expose_secret().clone(),
        );

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| AppError::EmailError(format!("Failed to create SMTP relay: {}", e)))?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            config,
            transport: Some(transport),
        })
    }
}

#[async_trait]
impl EmailTransport for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), AppError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| AppError::EmailError("SMTP transport not initialized".to_string()))?;

        let from_mailbox: Mailbox =
            format!("{} <{}>", self.config.from_name, self.config.from_email)
                .parse()
                .map_err(|e| AppError::EmailError(format!("Invalid from address: {}", e)))?;

        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|e| AppError::EmailError(format!("Invalid recipient: {}", e)))?;

        let message = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html_body.to_string())
            .map_err(|e| AppError::EmailError(format!("Failed to build message: {}", e)))?;

        transport
            .send(message)
            .await
            .map_err(|e| AppError::EmailError(format!("Failed to send email: {}", e)))?;

        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

/// Mock email transport for tests and disabled environments.
pub struct MockMailer {
    send_count: AtomicU64,
}

impl MockMailer {
    pub fn new() -> Self {
        Self {
            send_count: AtomicU64::new(0),
        }
    }

    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }
}

impl Default for MockMailer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailTransport for MockMailer {
    async fn send(&self, to: &str, subject: &str, _html_body: &str) -> Result<(), AppError> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        tracing::info!(to = %to, subject = %subject, "[MOCK] Email would be sent");
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Notification gateway fanning out over the registry and the mailer.
#[derive(Clone)]
pub struct FanoutNotifier {
    registry: ConnectionRegistry,
    mailer: Arc<dyn EmailTransport>,
}

impl FanoutNotifier {
    pub fn new(registry: ConnectionRegistry, mailer: Arc<dyn EmailTransport>) -> Self {
        Self { registry, mailer }
    }
}

#[async_trait]
impl NotificationGateway for FanoutNotifier {
    async fn notify(&self, user_id: Uuid, title: &str, message: &str, severity: Severity) {
        let delivered = self
            .registry
            .push(
                user_id,
                RealtimeEvent {
                    title: title.to_string(),
                    message: message.to_string(),
                    severity: severity.as_str().to_string(),
                    sent_utc: Utc::now(),
                },
            )
            .await;

        NOTIFICATIONS_TOTAL
            .with_label_values(&["realtime", "sent"])
            .inc();

        tracing::debug!(
            user_id = %user_id,
            delivered = delivered,
            title = %title,
            "Realtime notification pushed"
        );
    }

    async fn send_email(&self, to: &str, subject: &str, html_body: &str) {
        match self.mailer.send(to, subject, html_body).await {
            Ok(()) => {
                NOTIFICATIONS_TOTAL
                    .with_label_values(&["email", "sent"])
                    .inc();
                tracing::info!(to = %to, subject = %subject, "Email sent");
            }
            Err(e) => {
                NOTIFICATIONS_TOTAL
                    .with_label_values(&["email", "failed"])
                    .inc();
                tracing::warn!(to = %to, subject = %subject, error = %e, "Email delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(title: &str) -> RealtimeEvent {
        RealtimeEvent {
            title: title.to_string(),
            message: "body".to_string(),
            severity: Severity::Info.as_str().to_string(),
            sent_utc: Utc::now(),
        }
    }

    #[tokio::test]
    async fn push_reaches_registered_connections() {
        let registry = ConnectionRegistry::new();
        let user_id = Uuid::new_v4();

        let mut rx = registry.register(user_id).await;
        let delivered = registry.push(user_id, event("hello")).await;

        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap().title, "hello");
    }

    #[tokio::test]
    async fn push_to_unknown_user_reaches_nobody() {
        let registry = ConnectionRegistry::new();
        let delivered = registry.push(Uuid::new_v4(), event("nobody home")).await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn closed_connections_are_pruned() {
        let registry = ConnectionRegistry::new();
        let user_id = Uuid::new_v4();

        let rx = registry.register(user_id).await;
        drop(rx);

        let delivered = registry.push(user_id, event("gone")).await;
        assert_eq!(delivered, 0);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn deregister_removes_all_user_connections() {
        let registry = ConnectionRegistry::new();
        let user_id = Uuid::new_v4();

        let _rx1 = registry.register(user_id).await;
        let _rx2 = registry.register(user_id).await;
        assert_eq!(registry.connection_count().await, 2);

        registry.deregister(user_id).await;
        assert_eq!(registry.connection_count().await, 0);
    }
}
