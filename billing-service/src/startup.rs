//! Application startup and lifecycle management.
//!
//! Wires the database, the notification fan-out, the authority and FX
//! clients, and the lifecycle engines into the HTTP router.

use crate::config::BillingConfig;
use crate::handlers;
use crate::services::{
    ActivationEngine, ConnectionRegistry, Database, ExchangeRateService, FanoutNotifier,
    InvoiceIssuer, LocalProofStore, MockAuthorityClient, MockMailer, SifenClient, SmtpMailer,
    StageLifecycle,
    notify::EmailTransport,
    ports::{
        AuthorityClient, Directory, InvoiceRepository, NotificationGateway, ProjectRepository,
        ProofStore, RateSource, StageRepository,
    },
};
use axum::{
    Router,
    routing::{get, post, put},
};
use portal_core::error::AppError;
use secrecy::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: BillingConfig,
    pub db: Database,
    pub registry: ConnectionRegistry,
    pub proofs: Arc<dyn ProofStore>,
    pub fx: ExchangeRateService,
    pub activation: ActivationEngine,
    pub lifecycle: StageLifecycle,
    pub issuer: InvoiceIssuer,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        // Connect to database and apply migrations
        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to PostgreSQL: {}", e);
            e
        })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!("Failed to run database migrations: {}", e);
            e
        })?;

        // Email transport, falling back to the mock when SMTP is off
        let mailer: Arc<dyn EmailTransport> = if config.smtp.enabled {
            match SmtpMailer::new(config.smtp.clone()) {
                Ok(mailer) => {
                    tracing::info!("SMTP mailer initialized");
                    Arc::new(mailer)
                }
                Err(e) => {
                    tracing::warn!("Failed to initialize SMTP mailer: {}. Using mock.", e);
                    Arc::new(MockMailer::new())
                }
            }
        } else {
            tracing::info!("SMTP disabled, using mock mailer");
            Arc::new(MockMailer::new())
        };

        // Authority client, mocked when SIFEN is off
        let authority: Arc<dyn AuthorityClient> = if config.sifen.enabled {
            let client = SifenClient::new(config.sifen.clone())?;
            if client.is_configured() {
                tracing::info!("SIFEN client initialized");
            } else {
                tracing::warn!(
                    "SIFEN credentials not configured - electronic invoicing will fail until set"
                );
            }
            Arc::new(client)
        } else {
            tracing::info!("SIFEN disabled, using mock authority client");
            Arc::new(MockAuthorityClient::new())
        };

        let registry = ConnectionRegistry::new();
        let notifier: Arc<dyn NotificationGateway> =
            Arc::new(FanoutNotifier::new(registry.clone(), mailer));

        let fx = ExchangeRateService::new(db.clone(), config.fx.clone())?;
        let proofs: Arc<dyn ProofStore> = Arc::new(LocalProofStore::new(&config.proof.root_dir));

        // The engines see the database through its repository ports
        let projects: Arc<dyn ProjectRepository> = Arc::new(db.clone());
        let stages: Arc<dyn StageRepository> = Arc::new(db.clone());
        let invoices: Arc<dyn InvoiceRepository> = Arc::new(db.clone());
        let directory: Arc<dyn Directory> = Arc::new(db.clone());
        let rates: Arc<dyn RateSource> = Arc::new(fx.clone());

        let issuer = InvoiceIssuer::new(
            projects.clone(),
            stages.clone(),
            invoices,
            directory.clone(),
            authority,
        );
        let activation = ActivationEngine::new(
            projects.clone(),
            stages.clone(),
            directory.clone(),
            notifier.clone(),
        );
        let lifecycle = StageLifecycle::new(
            projects,
            stages,
            rates,
            directory,
            notifier,
            proofs.clone(),
            issuer.clone(),
        );

        let state = AppState {
            config: config.clone(),
            db,
            registry,
            proofs,
            fx,
            activation,
            lifecycle,
            issuer,
        };

        // Bind listener (port 0 = random port for testing)
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Billing service listening on port {}", port);

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Get the application state.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);
        axum::serve(self.listener, router).await
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::health::metrics_endpoint))
        .route("/projects", post(handlers::projects::create_project))
        .route(
            "/projects/:project_id/stages",
            post(handlers::projects::create_stage_plan).get(handlers::projects::list_stages),
        )
        .route(
            "/projects/:project_id/stages/next",
            get(handlers::projects::next_stage),
        )
        .route(
            "/projects/:project_id/progress",
            put(handlers::projects::update_progress),
        )
        .route("/stages/:stage_id/payment", post(handlers::stages::submit_payment))
        .route("/stages/:stage_id/approve", post(handlers::stages::approve))
        .route("/stages/:stage_id/reject", post(handlers::stages::reject))
        .route("/stages/:stage_id/proof", get(handlers::stages::download_proof))
        .route("/invoices", get(handlers::invoices::list_invoices))
        .route(
            "/invoices/:invoice_id/document",
            get(handlers::invoices::invoice_document),
        )
        .route(
            "/exchange-rate",
            get(handlers::exchange_rate::get_rate).put(handlers::exchange_rate::set_rate),
        )
        .route(
            "/profiles/:user_id",
            get(handlers::profiles::get_profile).put(handlers::profiles::upsert_profile),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
