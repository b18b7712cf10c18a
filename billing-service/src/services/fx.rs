//! Exchange rate service.
//!
//! The current USD to PYG rate comes from the active configuration row,
//! set by an admin; when none is active an optional remote FX quote is
//! consulted, and as a last resort a hardcoded fallback applies. External
//! failures are logged and fall through, never surfaced to callers.

use crate::config::FxConfig;
use crate::models::ExchangeRate;
use crate::services::Database;
use crate::services::ports::RateSource;
use async_trait::async_trait;
use portal_core::error::AppError;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

/// Rate applied when no configuration row is active and no remote quote is
/// available.
pub fn fallback_rate() -> Decimal {
    Decimal::new(730000, 2) // 7300.00
}

#[derive(Debug, Deserialize)]
struct FxQuoteResponse {
    rates: HashMap<String, f64>,
}

/// USD to PYG exchange rate provider.
#[derive(Clone)]
pub struct ExchangeRateService {
    db: Database,
    client: Client,
    config: FxConfig,
}

impl ExchangeRateService {
    pub fn new(db: Database, config: FxConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Failed to build FX HTTP client: {}", e))
            })?;

        Ok(Self { db, client, config })
    }

    /// The active configuration row, if any.
    pub async fn active_rate(&self) -> Result<Option<ExchangeRate>, AppError> {
        self.db.active_rate().await
    }

    /// Admin-set rate update; the previous active row is deactivated.
    #[instrument(skip(self), fields(updated_by = %updated_by))]
    pub async fn set_rate(
        &self,
        rate: Decimal,
        updated_by: Uuid,
    ) -> Result<ExchangeRate, AppError> {
        if rate <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "exchange rate must be positive"
            )));
        }

        self.db.set_active_rate(rate.round_dp(2), updated_by).await
    }

    async fn remote_rate(&self) -> Option<Decimal> {
        if !self.config.enabled {
            return None;
        }

        let url = format!("{}/latest/USD", self.config.api_base_url);

        match self.client.get(&url).send().await {
            Ok(response) => match response.json::<FxQuoteResponse>().await {
                Ok(quote) => quote
                    .rates
                    .get("PYG")
                    .and_then(|v| Decimal::from_f64(*v))
                    .map(|d| d.round_dp(2)),
                Err(e) => {
                    tracing::warn!(error = %e, "FX quote body unreadable");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "FX quote request failed");
                None
            }
        }
    }
}

#[async_trait]
impl RateSource for ExchangeRateService {
    async fn current_rate(&self) -> Decimal {
        match self.db.active_rate().await {
            Ok(Some(row)) => return row.rate,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read active exchange rate");
            }
        }

        if let Some(rate) = self.remote_rate().await {
            return rate;
        }

        fallback_rate()
    }
}
