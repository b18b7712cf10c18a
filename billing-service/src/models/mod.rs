//! Domain models for billing-service.

mod billing_profile;
mod exchange_rate;
mod invoice;
mod project;
mod stage;

pub use billing_profile::{BillingProfile, Contact};
pub use exchange_rate::ExchangeRate;
pub use invoice::{
    ClientSnapshot, CreateInvoice, Invoice, InvoiceStatus, ListInvoicesFilter,
    format_issue_timestamp,
};
pub use project::{CreateProject, Project, ProjectStatus};
pub use stage::{
    PaymentStage, StagePlanItem, StageStatus, next_payable_stage, stage_amount,
    validate_stage_plan,
};
