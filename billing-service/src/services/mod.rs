//! Services module for billing-service.

pub mod activation;
pub mod database;
pub mod fx;
pub mod invoicing;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod ports;
pub mod proof;
pub mod sifen;

pub use activation::ActivationEngine;
pub use database::Database;
pub use fx::ExchangeRateService;
pub use invoicing::{InvoiceDocumentView, InvoiceIssuer};
pub use lifecycle::{ProofUpload, StageLifecycle};
pub use metrics::{get_metrics, init_metrics};
pub use notify::{ConnectionRegistry, FanoutNotifier, MockMailer, SmtpMailer};
pub use proof::LocalProofStore;
pub use sifen::{MockAuthorityClient, SifenClient};
