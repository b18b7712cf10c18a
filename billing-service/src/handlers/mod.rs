//! HTTP handlers for billing-service.

pub mod exchange_rate;
pub mod health;
pub mod invoices;
pub mod profiles;
pub mod projects;
pub mod stages;
