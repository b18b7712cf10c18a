//! Invoice snapshot and electronic submission tests.

mod common;

use billing_service::models::{BillingProfile, Invoice, PaymentStage};
use chrono::Utc;
use common::{TestHarness, harness, seed_people, seed_project, seed_quarter_plan};
use rust_decimal::Decimal;
use std::time::Duration;
use uuid::Uuid;

async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", description);
}

async fn submit_and_approve(h: &TestHarness, client_id: Uuid, admin_id: Uuid, stage_id: Uuid) -> Invoice {
    h.lifecycle
        .submit_payment(client_id, stage_id, "bank_transfer", None)
        .await
        .unwrap();
    let (_, invoice) = h.lifecycle.approve(admin_id, stage_id).await.unwrap();
    invoice
}

#[tokio::test]
async fn background_submission_records_the_authority_result() {
    let h = harness();
    let (client_id, admin_id) = seed_people(&h);
    let project = seed_project(&h, client_id);
    let stages = seed_quarter_plan(&h, &project);
    let stage_id = stages[0].stage_id;

    let invoice = submit_and_approve(&h, client_id, admin_id, stage_id).await;
    assert!(invoice.cdc.is_none());

    wait_until("authority result persisted", || {
        h.store
            .invoice_for_stage(stage_id)
            .is_some_and(|i| i.cdc.is_some())
    })
    .await;

    let stored = h.store.invoice_for_stage(stage_id).unwrap();
    assert!(stored.authorization_protocol.is_some());
    assert!(stored.verification_code.is_some());
    assert!(stored.verification_code.unwrap().chars().count() <= 50);
    assert!(stored.authority_error.is_none());
    assert_eq!(h.authority.call_count(), 1);
}

#[tokio::test]
async fn failed_submission_leaves_stage_paid_and_retries_on_read() {
    let h = harness();
    let (client_id, admin_id) = seed_people(&h);
    let project = seed_project(&h, client_id);
    let stages = seed_quarter_plan(&h, &project);
    let stage_id = stages[0].stage_id;

    h.authority.fail_next();

    let invoice = submit_and_approve(&h, client_id, admin_id, stage_id).await;

    // The payment is a confirmed business fact regardless of the authority.
    assert_eq!(h.store.stage(stage_id).status, "paid");

    wait_until("submission failure persisted", || {
        h.store
            .invoice_for_stage(stage_id)
            .is_some_and(|i| i.authority_error.is_some())
    })
    .await;

    let stored = h.store.invoice_for_stage(stage_id).unwrap();
    assert!(stored.cdc.is_none());
    assert_eq!(h.authority.call_count(), 1);

    // A document download retries transparently and succeeds.
    let view = h.issuer.document(invoice.invoice_id).await.unwrap();
    assert!(view.invoice.cdc.is_some());
    assert!(view.verification_code.is_some());
    assert_eq!(h.authority.call_count(), 2);

    // A second download does not resubmit.
    let view2 = h.issuer.document(invoice.invoice_id).await.unwrap();
    assert_eq!(view2.invoice.cdc, view.invoice.cdc);
    assert_eq!(h.authority.call_count(), 2);
}

#[tokio::test]
async fn submitter_skips_invoices_that_already_hold_a_cdc() {
    let h = harness();
    let (client_id, admin_id) = seed_people(&h);
    let project = seed_project(&h, client_id);
    let stages = seed_quarter_plan(&h, &project);
    let stage_id = stages[0].stage_id;

    submit_and_approve(&h, client_id, admin_id, stage_id).await;

    wait_until("authority result persisted", || {
        h.store
            .invoice_for_stage(stage_id)
            .is_some_and(|i| i.cdc.is_some())
    })
    .await;
    assert_eq!(h.authority.call_count(), 1);

    // Invoking the submitter again makes no outbound call and changes
    // nothing.
    let stored = h.store.invoice_for_stage(stage_id).unwrap();
    let stage = h.store.stage(stage_id);
    let resubmitted = h
        .issuer
        .ensure_submitted(stored.clone(), &stage, &project)
        .await
        .unwrap();

    assert_eq!(h.authority.call_count(), 1);
    assert_eq!(resubmitted.cdc, stored.cdc);
    assert_eq!(resubmitted.authorization_protocol, stored.authorization_protocol);
}

#[tokio::test]
async fn snapshot_survives_profile_edits() {
    let h = harness();
    let (client_id, admin_id) = seed_people(&h);
    let project = seed_project(&h, client_id);
    let stages = seed_quarter_plan(&h, &project);
    let stage_id = stages[0].stage_id;

    let invoice = submit_and_approve(&h, client_id, admin_id, stage_id).await;
    assert_eq!(invoice.legal_name.as_deref(), Some("ACME S.A."));
    let original_timestamp = invoice.issue_timestamp.clone();

    // The client renames their company afterward.
    h.directory.set_profile(BillingProfile {
        user_id: client_id,
        legal_name: "ACME Holdings S.A.E.C.A.".to_string(),
        document_type: "RUC".to_string(),
        document_number: "80099999-1".to_string(),
        address: "Nueva direccion 999".to_string(),
        city: "Luque".to_string(),
        department: "Central".to_string(),
        country: "PY".to_string(),
        email: "new@acme.com.py".to_string(),
        phone: "+595 21 999 999".to_string(),
    });

    let stage = h.store.stage(stage_id);
    let again = h.issuer.ensure_invoice(&stage, &project).await.unwrap();
    assert_eq!(again.legal_name.as_deref(), Some("ACME S.A."));
    assert_eq!(again.document_number.as_deref(), Some("80012345-6"));
    assert_eq!(again.issue_timestamp, original_timestamp);

    let view = h.issuer.document(invoice.invoice_id).await.unwrap();
    assert_eq!(view.invoice.legal_name.as_deref(), Some("ACME S.A."));
}

#[tokio::test]
async fn legacy_invoice_is_backfilled_exactly_once() {
    let h = harness();
    let (client_id, _) = seed_people(&h);
    let project = seed_project(&h, client_id);

    // A paid stage and its invoice predating the snapshot fields.
    let stage = PaymentStage {
        stage_id: Uuid::new_v4(),
        project_id: project.project_id,
        name: "Legacy stage".to_string(),
        percentage: Decimal::from(100),
        amount: Decimal::from(4000),
        required_progress: 0,
        status: "paid".to_string(),
        payment_method: Some("bank_transfer".to_string()),
        proof_reference: None,
        rejection_reason: None,
        frozen_exchange_rate: Some(Decimal::from(7100)),
        paid_utc: Some(Utc::now()),
        approved_by: Some(Uuid::new_v4()),
        created_utc: Utc::now(),
        updated_utc: Utc::now(),
    };
    h.store.insert_stage(stage.clone());

    let bare = Invoice {
        invoice_id: Uuid::new_v4(),
        project_id: project.project_id,
        client_id,
        stage_id: stage.stage_id,
        invoice_number: 99,
        amount: Decimal::from(4000),
        currency: "USD".to_string(),
        status: "paid".to_string(),
        due_date: None,
        paid_date: None,
        legal_name: None,
        document_type: None,
        document_number: None,
        address: None,
        city: None,
        department: None,
        country: None,
        email: None,
        phone: None,
        issue_timestamp: None,
        exchange_rate: None,
        cdc: None,
        authorization_protocol: None,
        authority_status: None,
        authority_document: None,
        verification_code: None,
        authority_error: None,
        created_utc: Utc::now(),
    };
    h.store.insert_invoice(bare.clone());

    let filled = h.issuer.ensure_snapshot(bare.clone(), &stage).await.unwrap();
    assert_eq!(filled.legal_name.as_deref(), Some("ACME S.A."));
    assert_eq!(filled.exchange_rate, Some(Decimal::from(7100)));
    assert!(filled.issue_timestamp.is_some());

    // A later profile edit must not leak into the filled snapshot.
    h.directory.set_profile(BillingProfile {
        user_id: client_id,
        legal_name: "Renamed Corp".to_string(),
        document_type: "RUC".to_string(),
        document_number: "80000000-0".to_string(),
        address: "Elsewhere".to_string(),
        city: "Elsewhere".to_string(),
        department: "Central".to_string(),
        country: "PY".to_string(),
        email: "else@where.py".to_string(),
        phone: "+595".to_string(),
    });

    let second = h.issuer.ensure_snapshot(filled.clone(), &stage).await.unwrap();
    assert_eq!(second.legal_name.as_deref(), Some("ACME S.A."));
    assert_eq!(second.issue_timestamp, filled.issue_timestamp);
}

#[tokio::test]
async fn document_renders_as_receipt_while_authority_is_down() {
    let h = harness();
    let (client_id, admin_id) = seed_people(&h);
    let project = seed_project(&h, client_id);
    let stages = seed_quarter_plan(&h, &project);
    let stage_id = stages[0].stage_id;

    h.authority.fail_next();
    let invoice = submit_and_approve(&h, client_id, admin_id, stage_id).await;

    wait_until("submission failure persisted", || {
        h.store
            .invoice_for_stage(stage_id)
            .is_some_and(|i| i.authority_error.is_some())
    })
    .await;

    // Authority still down at download time: the document is a valid
    // receipt without a verification code, not an error.
    h.authority.fail_next();
    let view = h.issuer.document(invoice.invoice_id).await.unwrap();

    assert!(view.invoice.cdc.is_none());
    assert!(view.verification_code.is_none());
    assert_eq!(view.document_number, "001-001-0000001");
    assert_eq!(view.invoice.legal_name.as_deref(), Some("ACME S.A."));
}

#[tokio::test]
async fn concurrent_invoice_creation_converges_on_one_number() {
    let h = harness();
    let (client_id, _) = seed_people(&h);
    let project = seed_project(&h, client_id);

    let stage = PaymentStage {
        stage_id: Uuid::new_v4(),
        project_id: project.project_id,
        name: "Stage 1".to_string(),
        percentage: Decimal::from(25),
        amount: Decimal::from(1000),
        required_progress: 0,
        status: "paid".to_string(),
        payment_method: Some("bank_transfer".to_string()),
        proof_reference: None,
        rejection_reason: None,
        frozen_exchange_rate: Some(Decimal::from(7300)),
        paid_utc: Some(Utc::now()),
        approved_by: Some(Uuid::new_v4()),
        created_utc: Utc::now(),
        updated_utc: Utc::now(),
    };
    h.store.insert_stage(stage.clone());

    let (first, second) = tokio::join!(
        h.issuer.ensure_invoice(&stage, &project),
        h.issuer.ensure_invoice(&stage, &project),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first.invoice_id, second.invoice_id);
    assert_eq!(first.invoice_number, second.invoice_number);
    assert_eq!(h.store.invoice_count(), 1);
}
