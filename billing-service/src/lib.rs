//! billing-service: payment stage lifecycle and electronic invoicing core
//! of the agency portal.
pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
