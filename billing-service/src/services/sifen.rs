//! SIFEN electronic invoicing client.
//!
//! Builds the provider document from an invoice's frozen snapshot and
//! submits it to the tax authority's API. Whether a submission may happen
//! at all is decided upstream (an invoice with a CDC is never resubmitted);
//! this module only talks to the wire.

use crate::config::SifenConfig;
use crate::models::{Invoice, PaymentStage, Project};
use crate::services::ports::AuthorityClient;
use async_trait::async_trait;
use portal_core::error::AppError;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Maximum length of the persisted verification/display code.
pub const DISPLAY_CODE_MAX_LEN: usize = 50;

/// The document submitted to the authority. Line items carry both USD and
/// local-currency amounts converted with the frozen rate; the agency
/// operates under the tax-exempt regime.
#[derive(Debug, Clone, Serialize)]
pub struct EInvoiceDocument {
    pub document_number: String,
    pub issue_timestamp: String,
    pub tax_regime: String,
    pub currency: String,
    pub exchange_rate: String,
    pub receiver: ReceiverParty,
    pub items: Vec<DocumentItem>,
    pub total_usd: String,
    pub total_pyg: String,
}

/// Receiver identity, copied from the frozen invoice snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ReceiverParty {
    pub legal_name: String,
    pub document_type: String,
    pub document_number: String,
    pub address: String,
    pub city: String,
    pub department: String,
    pub country: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentItem {
    pub description: String,
    pub quantity: u32,
    pub unit_price_usd: String,
    pub unit_price_pyg: String,
    pub total_usd: String,
    pub total_pyg: String,
}

/// The authority's answer to a submission.
#[derive(Debug, Clone)]
pub struct AuthorityReceipt {
    pub cdc: Option<String>,
    pub protocol: Option<String>,
    pub status: String,
    pub raw_document: Option<String>,
    pub display_code: Option<String>,
    pub error_message: Option<String>,
}

/// Stamped document number derived from the sequential invoice number.
pub fn format_document_number(invoice_number: i64) -> String {
    format!("001-001-{:07}", invoice_number)
}

/// Truncate a QR/verification URL to the persisted display length.
pub fn truncate_display_code(code: &str) -> String {
    code.chars().take(DISPLAY_CODE_MAX_LEN).collect()
}

fn format_fixed(value: Decimal, dp: u32) -> String {
    let mut rounded = value.round_dp(dp);
    rounded.rescale(dp);
    rounded.to_string()
}

/// Build the provider document from the frozen invoice facts. Fails when
/// the snapshot or the frozen rate is missing; callers backfill first.
pub fn build_document(
    invoice: &Invoice,
    stage: &PaymentStage,
    project: &Project,
) -> Result<EInvoiceDocument, AppError> {
    let missing = |field: &str| {
        AppError::InternalError(anyhow::anyhow!(
            "invoice {} is missing frozen field '{}'",
            invoice.invoice_id,
            field
        ))
    };

    let rate = invoice.exchange_rate.ok_or_else(|| missing("exchange_rate"))?;
    let issue_timestamp = invoice
        .issue_timestamp
        .clone()
        .ok_or_else(|| missing("issue_timestamp"))?;

    let receiver = ReceiverParty {
        legal_name: invoice.legal_name.clone().ok_or_else(|| missing("legal_name"))?,
        document_type: invoice
            .document_type
            .clone()
            .ok_or_else(|| missing("document_type"))?,
        document_number: invoice
            .document_number
            .clone()
            .ok_or_else(|| missing("document_number"))?,
        address: invoice.address.clone().unwrap_or_default(),
        city: invoice.city.clone().unwrap_or_default(),
        department: invoice.department.clone().unwrap_or_default(),
        country: invoice.country.clone().unwrap_or_default(),
        email: invoice.email.clone().unwrap_or_default(),
    };

    let amount_usd = invoice.amount;
    let amount_pyg = (amount_usd * rate).round_dp(0);

    let item = DocumentItem {
        description: format!("{} - {}", project.name, stage.name),
        quantity: 1,
        unit_price_usd: format_fixed(amount_usd, 2),
        unit_price_pyg: format_fixed(amount_pyg, 0),
        total_usd: format_fixed(amount_usd, 2),
        total_pyg: format_fixed(amount_pyg, 0),
    };

    Ok(EInvoiceDocument {
        document_number: format_document_number(invoice.invoice_number),
        issue_timestamp,
        tax_regime: "exempt".to_string(),
        currency: invoice.currency.clone(),
        exchange_rate: format_fixed(rate, 2),
        receiver,
        total_usd: format_fixed(amount_usd, 2),
        total_pyg: format_fixed(amount_pyg, 0),
        items: vec![item],
    })
}

/// SIFEN API client.
#[derive(Clone)]
pub struct SifenClient {
    client: Client,
    config: SifenConfig,
}

#[derive(Debug, Deserialize)]
struct SifenAcceptedResponse {
    cdc: String,
    protocol: String,
    status: String,
    #[serde(default)]
    qr_url: Option<String>,
    #[serde(default)]
    xml: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SifenErrorResponse {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl SifenClient {
    pub fn new(config: SifenConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Failed to build SIFEN HTTP client: {}", e))
            })?;

        Ok(Self { client, config })
    }

    /// Check if the authority connection is configured.
    pub fn is_configured(&self) -> bool {
        self.config.enabled
            && !self.config.api_base_url.is_empty()
            && !self.config.api_key.expose_secret().is_empty()
    }
}

#[async_trait]
impl AuthorityClient for SifenClient {
    async fn submit(&self, document: &EInvoiceDocument) -> Result<AuthorityReceipt, AppError> {
        if !self.is_configured() {
            return Err(AppError::BadGateway(
                "SIFEN credentials not configured".to_string(),
            ));
        }

        let url = format!("{}/de/submit", self.config.api_base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(document)
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("SIFEN request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::BadGateway(format!("SIFEN response unreadable: {}", e)))?;

        tracing::debug!(status = %status, document_number = %document.document_number, "SIFEN submit response");

        if status.is_success() {
            let accepted: SifenAcceptedResponse = serde_json::from_str(&body).map_err(|e| {
                AppError::BadGateway(format!("Unexpected SIFEN response body: {}", e))
            })?;

            tracing::info!(
                cdc = %accepted.cdc,
                protocol = %accepted.protocol,
                document_number = %document.document_number,
                "Electronic invoice accepted"
            );

            let display_code = accepted.qr_url.as_deref().map(truncate_display_code);

            Ok(AuthorityReceipt {
                cdc: Some(accepted.cdc),
                protocol: Some(accepted.protocol),
                status: accepted.status,
                raw_document: accepted.xml.or(Some(body)),
                display_code,
                error_message: None,
            })
        } else if status.is_client_error() {
            let error: SifenErrorResponse =
                serde_json::from_str(&body).unwrap_or_else(|_| SifenErrorResponse {
                    code: "UNKNOWN".to_string(),
                    message: body.clone(),
                });

            tracing::warn!(
                code = %error.code,
                message = %error.message,
                document_number = %document.document_number,
                "Electronic invoice rejected by authority"
            );

            Ok(AuthorityReceipt {
                cdc: None,
                protocol: None,
                status: "rejected".to_string(),
                raw_document: None,
                display_code: None,
                error_message: Some(format!("{}: {}", error.code, error.message)),
            })
        } else {
            Err(AppError::BadGateway(format!(
                "SIFEN error {}: {}",
                status, body
            )))
        }
    }
}

/// Mock authority used when SIFEN is disabled and in tests. Accepts every
/// document with a deterministic CDC unless scripted otherwise.
pub struct MockAuthorityClient {
    calls: AtomicU32,
    fail_next: AtomicBool,
    reject_next: AtomicBool,
}

impl MockAuthorityClient {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_next: AtomicBool::new(false),
            reject_next: AtomicBool::new(false),
        }
    }

    /// Number of submit calls that reached this client.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make the next submission fail at the transport level.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Make the next submission come back rejected by the authority.
    pub fn reject_next(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }
}

impl Default for MockAuthorityClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthorityClient for MockAuthorityClient {
    async fn submit(&self, document: &EInvoiceDocument) -> Result<AuthorityReceipt, AppError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AppError::BadGateway(
                "simulated transport failure".to_string(),
            ));
        }

        if self.reject_next.swap(false, Ordering::SeqCst) {
            return Ok(AuthorityReceipt {
                cdc: None,
                protocol: None,
                status: "rejected".to_string(),
                raw_document: None,
                display_code: None,
                error_message: Some("1001: document rejected".to_string()),
            });
        }

        let cdc = format!("0180052{}", document.document_number.replace('-', ""));
        let qr_url = format!("https://ekuatia.set.gov.py/consultas/qr?cdc={}", cdc);

        tracing::info!(
            document_number = %document.document_number,
            "[MOCK] Electronic invoice accepted"
        );

        Ok(AuthorityReceipt {
            cdc: Some(cdc),
            protocol: Some(format!("76{:012}", call)),
            status: "approved".to_string(),
            raw_document: Some(serde_json::to_string(document).unwrap_or_default()),
            display_code: Some(truncate_display_code(&qr_url)),
            error_message: None,
        })
    }
}
