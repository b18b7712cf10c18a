//! Test helper module for billing-service engine tests.
//!
//! Provides in-memory implementations of the repository and boundary ports
//! so the lifecycle engines run without external infrastructure. The
//! in-memory guards mirror the SQL guards of the production database
//! layer.

#![allow(dead_code)]

use async_trait::async_trait;
use billing_service::models::{
    BillingProfile, ClientSnapshot, Contact, CreateInvoice, Invoice, PaymentStage, Project,
};
use billing_service::services::notify::Severity;
use billing_service::services::ports::{
    Directory, InvoiceRepository, NotificationGateway, ProjectRepository, ProofStore, RateSource,
    StageRepository,
};
use billing_service::services::sifen::AuthorityReceipt;
use billing_service::services::{ActivationEngine, InvoiceIssuer, MockAuthorityClient, StageLifecycle};
use chrono::{DateTime, Utc};
use portal_core::error::AppError;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// In-memory store
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryStore {
    pub projects: RwLock<HashMap<Uuid, Project>>,
    pub stages: RwLock<HashMap<Uuid, PaymentStage>>,
    pub invoices: RwLock<HashMap<Uuid, Invoice>>,
    invoice_counter: AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_project(&self, project: Project) {
        self.projects
            .write()
            .unwrap()
            .insert(project.project_id, project);
    }

    pub fn insert_stage(&self, stage: PaymentStage) {
        self.stages.write().unwrap().insert(stage.stage_id, stage);
    }

    pub fn insert_invoice(&self, invoice: Invoice) {
        self.invoices
            .write()
            .unwrap()
            .insert(invoice.invoice_id, invoice);
    }

    pub fn invoice_count(&self) -> usize {
        self.invoices.read().unwrap().len()
    }

    pub fn stage(&self, stage_id: Uuid) -> PaymentStage {
        self.stages.read().unwrap().get(&stage_id).unwrap().clone()
    }

    /// Map of threshold -> status for a project, for compact assertions.
    pub fn stage_statuses(&self, project_id: Uuid) -> HashMap<i32, String> {
        self.stages
            .read()
            .unwrap()
            .values()
            .filter(|s| s.project_id == project_id)
            .map(|s| (s.required_progress, s.status.clone()))
            .collect()
    }

    pub fn list_stages_sorted(&self, project_id: Uuid) -> Vec<PaymentStage> {
        let mut stages: Vec<PaymentStage> = self
            .stages
            .read()
            .unwrap()
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.required_progress);
        stages
    }

    pub fn invoice_for_stage(&self, stage_id: Uuid) -> Option<Invoice> {
        self.invoices
            .read()
            .unwrap()
            .values()
            .find(|i| i.stage_id == stage_id)
            .cloned()
    }
}

#[async_trait]
impl ProjectRepository for InMemoryStore {
    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, AppError> {
        Ok(self.projects.read().unwrap().get(&project_id).cloned())
    }

    async fn set_progress(
        &self,
        project_id: Uuid,
        progress: i32,
    ) -> Result<Option<Project>, AppError> {
        let mut projects = self.projects.write().unwrap();
        Ok(projects.get_mut(&project_id).map(|p| {
            p.progress = progress;
            p.updated_utc = Utc::now();
            p.clone()
        }))
    }
}

#[async_trait]
impl StageRepository for InMemoryStore {
    async fn get_stage(&self, stage_id: Uuid) -> Result<Option<PaymentStage>, AppError> {
        Ok(self.stages.read().unwrap().get(&stage_id).cloned())
    }

    async fn list_stages(&self, project_id: Uuid) -> Result<Vec<PaymentStage>, AppError> {
        let mut stages: Vec<PaymentStage> = self
            .stages
            .read()
            .unwrap()
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| (s.required_progress, s.created_utc));
        Ok(stages)
    }

    async fn mark_available(&self, stage_id: Uuid) -> Result<Option<PaymentStage>, AppError> {
        let mut stages = self.stages.write().unwrap();
        match stages.get_mut(&stage_id) {
            Some(stage) if stage.status == "pending" => {
                stage.status = "available".to_string();
                stage.updated_utc = Utc::now();
                Ok(Some(stage.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn begin_verification(
        &self,
        stage_id: Uuid,
        payment_method: &str,
        proof_reference: Option<&str>,
    ) -> Result<Option<PaymentStage>, AppError> {
        let mut stages = self.stages.write().unwrap();
        match stages.get_mut(&stage_id) {
            Some(stage) if stage.status == "available" => {
                stage.status = "pending_verification".to_string();
                stage.payment_method = Some(payment_method.to_string());
                stage.proof_reference = proof_reference.map(str::to_string);
                stage.rejection_reason = None;
                stage.updated_utc = Utc::now();
                Ok(Some(stage.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn approve_stage(
        &self,
        stage_id: Uuid,
        frozen_rate: Decimal,
        approved_by: Uuid,
        paid_utc: DateTime<Utc>,
    ) -> Result<Option<PaymentStage>, AppError> {
        let mut stages = self.stages.write().unwrap();
        match stages.get_mut(&stage_id) {
            Some(stage) if stage.status == "pending_verification" => {
                stage.status = "paid".to_string();
                stage.frozen_exchange_rate = Some(frozen_rate);
                stage.approved_by = Some(approved_by);
                stage.paid_utc = Some(paid_utc);
                stage.updated_utc = Utc::now();
                Ok(Some(stage.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn reopen_stage(
        &self,
        stage_id: Uuid,
        reason: &str,
    ) -> Result<Option<PaymentStage>, AppError> {
        let mut stages = self.stages.write().unwrap();
        match stages.get_mut(&stage_id) {
            Some(stage) if stage.status == "pending_verification" => {
                stage.status = "available".to_string();
                stage.payment_method = None;
                stage.proof_reference = None;
                stage.rejection_reason = Some(reason.to_string());
                stage.updated_utc = Utc::now();
                Ok(Some(stage.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl InvoiceRepository for InMemoryStore {
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        Ok(self.invoices.read().unwrap().get(&invoice_id).cloned())
    }

    async fn find_invoice_by_stage(&self, stage_id: Uuid) -> Result<Option<Invoice>, AppError> {
        Ok(self.invoice_for_stage(stage_id))
    }

    async fn create_invoice(&self, input: &CreateInvoice) -> Result<Invoice, AppError> {
        let mut invoices = self.invoices.write().unwrap();

        // Stage uniqueness backstop: prefer the existing record.
        if let Some(existing) = invoices.values().find(|i| i.stage_id == input.stage_id) {
            return Ok(existing.clone());
        }

        let invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            project_id: input.project_id,
            client_id: input.client_id,
            stage_id: input.stage_id,
            invoice_number: self.invoice_counter.fetch_add(1, Ordering::SeqCst) + 1,
            amount: input.amount,
            currency: input.currency.clone(),
            status: "paid".to_string(),
            due_date: None,
            paid_date: input.paid_date,
            legal_name: Some(input.snapshot.legal_name.clone()),
            document_type: Some(input.snapshot.document_type.clone()),
            document_number: Some(input.snapshot.document_number.clone()),
            address: Some(input.snapshot.address.clone()),
            city: Some(input.snapshot.city.clone()),
            department: Some(input.snapshot.department.clone()),
            country: Some(input.snapshot.country.clone()),
            email: Some(input.snapshot.email.clone()),
            phone: Some(input.snapshot.phone.clone()),
            issue_timestamp: Some(input.issue_timestamp.clone()),
            exchange_rate: Some(input.exchange_rate),
            cdc: None,
            authorization_protocol: None,
            authority_status: None,
            authority_document: None,
            verification_code: None,
            authority_error: None,
            created_utc: Utc::now(),
        };
        invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(invoice)
    }

    async fn backfill_snapshot(
        &self,
        invoice_id: Uuid,
        snapshot: &ClientSnapshot,
        issue_timestamp: &str,
        exchange_rate: Decimal,
    ) -> Result<Option<Invoice>, AppError> {
        let mut invoices = self.invoices.write().unwrap();
        Ok(invoices.get_mut(&invoice_id).map(|invoice| {
            if invoice.legal_name.is_none() {
                invoice.legal_name = Some(snapshot.legal_name.clone());
                invoice.document_type = Some(snapshot.document_type.clone());
                invoice.document_number = Some(snapshot.document_number.clone());
                invoice.address = Some(snapshot.address.clone());
                invoice.city = Some(snapshot.city.clone());
                invoice.department = Some(snapshot.department.clone());
                invoice.country = Some(snapshot.country.clone());
                invoice.email = Some(snapshot.email.clone());
                invoice.phone = Some(snapshot.phone.clone());
                invoice.issue_timestamp = Some(issue_timestamp.to_string());
                invoice.exchange_rate = Some(exchange_rate);
            }
            invoice.clone()
        }))
    }

    async fn record_authority_result(
        &self,
        invoice_id: Uuid,
        receipt: &AuthorityReceipt,
    ) -> Result<Option<Invoice>, AppError> {
        let mut invoices = self.invoices.write().unwrap();
        Ok(invoices.get_mut(&invoice_id).map(|invoice| {
            if invoice.cdc.is_none() {
                invoice.cdc = receipt.cdc.clone();
                invoice.authorization_protocol = receipt.protocol.clone();
                invoice.authority_status = Some(receipt.status.clone());
                invoice.authority_document = receipt.raw_document.clone();
                invoice.verification_code = receipt.display_code.clone();
                invoice.authority_error = None;
            }
            invoice.clone()
        }))
    }

    async fn record_authority_error(
        &self,
        invoice_id: Uuid,
        message: &str,
    ) -> Result<Option<Invoice>, AppError> {
        let mut invoices = self.invoices.write().unwrap();
        Ok(invoices.get_mut(&invoice_id).map(|invoice| {
            if invoice.cdc.is_none() {
                invoice.authority_error = Some(message.to_string());
            }
            invoice.clone()
        }))
    }
}

// -----------------------------------------------------------------------------
// Boundary fakes
// -----------------------------------------------------------------------------

/// Fixed exchange rate source.
pub struct StaticRates {
    rate: RwLock<Decimal>,
}

impl StaticRates {
    pub fn new(rate: Decimal) -> Self {
        Self {
            rate: RwLock::new(rate),
        }
    }

    pub fn set(&self, rate: Decimal) {
        *self.rate.write().unwrap() = rate;
    }
}

#[async_trait]
impl RateSource for StaticRates {
    async fn current_rate(&self) -> Decimal {
        *self.rate.read().unwrap()
    }
}

/// In-memory directory of billing profiles and contacts.
#[derive(Default)]
pub struct InMemoryDirectory {
    pub profiles: RwLock<HashMap<Uuid, BillingProfile>>,
    pub contacts: RwLock<HashMap<Uuid, Contact>>,
    pub admins: RwLock<Vec<Contact>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_profile(&self, profile: BillingProfile) {
        self.profiles
            .write()
            .unwrap()
            .insert(profile.user_id, profile);
    }

    pub fn set_contact(&self, contact: Contact) {
        self.contacts
            .write()
            .unwrap()
            .insert(contact.user_id, contact);
    }

    pub fn add_admin(&self, contact: Contact) {
        self.contacts
            .write()
            .unwrap()
            .insert(contact.user_id, contact.clone());
        self.admins.write().unwrap().push(contact);
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn billing_profile(&self, user_id: Uuid) -> Result<Option<BillingProfile>, AppError> {
        Ok(self.profiles.read().unwrap().get(&user_id).cloned())
    }

    async fn contact(&self, user_id: Uuid) -> Result<Option<Contact>, AppError> {
        Ok(self.contacts.read().unwrap().get(&user_id).cloned())
    }

    async fn admin_contacts(&self) -> Result<Vec<Contact>, AppError> {
        Ok(self.admins.read().unwrap().clone())
    }
}

/// Notification gateway that records every delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    pub realtime: Mutex<Vec<(Uuid, String)>>,
    pub emails: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn realtime_count(&self) -> usize {
        self.realtime.lock().unwrap().len()
    }

    pub fn email_count(&self) -> usize {
        self.emails.lock().unwrap().len()
    }

    pub fn realtime_titles_for(&self, user_id: Uuid) -> Vec<String> {
        self.realtime
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == user_id)
            .map(|(_, title)| title.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationGateway for RecordingNotifier {
    async fn notify(&self, user_id: Uuid, title: &str, _message: &str, _severity: Severity) {
        self.realtime
            .lock()
            .unwrap()
            .push((user_id, title.to_string()));
    }

    async fn send_email(&self, to: &str, subject: &str, _html_body: &str) {
        self.emails
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string()));
    }
}

/// In-memory proof store.
#[derive(Default)]
pub struct MemProofStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemProofStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProofStore for MemProofStore {
    async fn store(
        &self,
        stage_id: Uuid,
        filename: &str,
        bytes: &[u8],
    ) -> Result<String, AppError> {
        let reference = format!("{}/{}", stage_id, filename);
        self.files
            .write()
            .unwrap()
            .insert(reference.clone(), bytes.to_vec());
        Ok(reference)
    }

    async fn load(&self, reference: &str) -> Result<Vec<u8>, AppError> {
        self.files
            .read()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("proof '{}' not found", reference)))
    }
}

// -----------------------------------------------------------------------------
// Harness
// -----------------------------------------------------------------------------

pub const RATE_7300: i64 = 7300;

pub struct TestHarness {
    pub store: Arc<InMemoryStore>,
    pub rates: Arc<StaticRates>,
    pub directory: Arc<InMemoryDirectory>,
    pub authority: Arc<MockAuthorityClient>,
    pub notifier: Arc<RecordingNotifier>,
    pub proofs: Arc<MemProofStore>,
    pub activation: ActivationEngine,
    pub lifecycle: StageLifecycle,
    pub issuer: InvoiceIssuer,
}

pub fn harness() -> TestHarness {
    let store = Arc::new(InMemoryStore::new());
    let rates = Arc::new(StaticRates::new(Decimal::from(RATE_7300)));
    let directory = Arc::new(InMemoryDirectory::new());
    let authority = Arc::new(MockAuthorityClient::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let proofs = Arc::new(MemProofStore::new());

    let issuer = InvoiceIssuer::new(
        store.clone(),
        store.clone(),
        store.clone(),
        directory.clone(),
        authority.clone(),
    );
    let activation = ActivationEngine::new(
        store.clone(),
        store.clone(),
        directory.clone(),
        notifier.clone(),
    );
    let lifecycle = StageLifecycle::new(
        store.clone(),
        store.clone(),
        rates.clone(),
        directory.clone(),
        notifier.clone(),
        proofs.clone(),
        issuer.clone(),
    );

    TestHarness {
        store,
        rates,
        directory,
        authority,
        notifier,
        proofs,
        activation,
        lifecycle,
        issuer,
    }
}

/// Seed a client with a billing profile and contact, plus one admin.
pub fn seed_people(harness: &TestHarness) -> (Uuid, Uuid) {
    let client_id = Uuid::new_v4();
    let admin_id = Uuid::new_v4();

    harness.directory.set_profile(BillingProfile {
        user_id: client_id,
        legal_name: "ACME S.A.".to_string(),
        document_type: "RUC".to_string(),
        document_number: "80012345-6".to_string(),
        address: "Avda. Mariscal Lopez 1234".to_string(),
        city: "Asuncion".to_string(),
        department: "Central".to_string(),
        country: "PY".to_string(),
        email: "billing@acme.com.py".to_string(),
        phone: "+595 21 123 456".to_string(),
    });
    harness.directory.set_contact(Contact {
        user_id: client_id,
        full_name: "Ana Gonzalez".to_string(),
        email: "ana@acme.com.py".to_string(),
    });
    harness.directory.add_admin(Contact {
        user_id: admin_id,
        full_name: "Portal Admin".to_string(),
        email: "admin@agency.example".to_string(),
    });

    (client_id, admin_id)
}

/// Seed a $4,000 project owned by `client_id`.
pub fn seed_project(harness: &TestHarness, client_id: Uuid) -> Project {
    let project = Project {
        project_id: Uuid::new_v4(),
        client_id,
        name: "Portal redesign".to_string(),
        total_price: Decimal::from(4000),
        progress: 0,
        status: "active".to_string(),
        created_utc: Utc::now(),
        updated_utc: Utc::now(),
    };
    harness.store.insert_project(project.clone());
    project
}

/// Seed the standard four-stage plan (0/25/50/75 thresholds, 25% each).
/// The zero-threshold stage starts `available`, mirroring plan creation.
pub fn seed_quarter_plan(harness: &TestHarness, project: &Project) -> Vec<PaymentStage> {
    let mut stages = Vec::new();
    for (index, threshold) in [0, 25, 50, 75].into_iter().enumerate() {
        let status = if threshold == 0 { "available" } else { "pending" };
        let stage = PaymentStage {
            stage_id: Uuid::new_v4(),
            project_id: project.project_id,
            name: format!("Stage {}", index + 1),
            percentage: Decimal::from(25),
            amount: Decimal::from(1000),
            required_progress: threshold,
            status: status.to_string(),
            payment_method: None,
            proof_reference: None,
            rejection_reason: None,
            frozen_exchange_rate: None,
            paid_utc: None,
            approved_by: None,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        };
        harness.store.insert_stage(stage.clone());
        stages.push(stage);
    }
    stages
}
