use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use renova_billing::{
    DispatchStatus, EngineOptions, Job, RenewalEngine, RunOptions, RunOutcome, SkipReason, Stores,
};
use renova_core::{
    BillingFrequency, DueFilter, Escalation, Invoice, InvoiceStatus, LockStore, Notice,
    Obligation, ObligationStatus,
};
use renova_memstore::{GatewayMode, MemStore, RecordingGateway, RecordingSink};
use rust_decimal::Decimal;
use uuid::Uuid;

struct Harness {
    store: Arc<MemStore>,
    gateway: Arc<RecordingGateway>,
    sink: Arc<RecordingSink>,
    engine: RenewalEngine,
}

fn harness_with(options: EngineOptions) -> Harness {
    let store = Arc::new(MemStore::new());
    let gateway = Arc::new(RecordingGateway::new());
    let sink = Arc::new(RecordingSink::new());
    let engine = RenewalEngine::new(
        Stores {
            obligations: store.clone(),
            invoices: store.clone(),
            ledger: store.clone(),
            locks: store.clone(),
            notice_log: store.clone(),
        },
        gateway.clone(),
        sink.clone(),
        options,
    );
    Harness {
        store,
        gateway,
        sink,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(EngineOptions::default())
}

fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

fn obligation(next_due_at: DateTime<Utc>) -> Obligation {
    Obligation {
        id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        client_id: Uuid::new_v4(),
        contract_id: Uuid::new_v4(),
        amount: Decimal::new(100, 0),
        currency: "USD".to_string(),
        frequency: BillingFrequency::Monthly,
        escalation: Escalation::None,
        next_due_at,
        status: ObligationStatus::Active,
        auto_renew: true,
        pause_reason: None,
        last_processed_at: None,
        created_at: at(2023, 6, 1),
        updated_at: at(2023, 6, 1),
    }
}

fn failed_invoice(attempts: i32, last_attempt_at: Option<DateTime<Utc>>) -> Invoice {
    Invoice {
        id: Uuid::new_v4(),
        obligation_id: Uuid::new_v4(),
        period_start: at(2024, 1, 1).date_naive(),
        amount: Decimal::new(100, 0),
        currency: "USD".to_string(),
        status: InvoiceStatus::Failed,
        due_at: at(2024, 1, 1),
        payment_attempts: attempts,
        last_payment_attempt_at: last_attempt_at,
        payment_ref: None,
        failure_reason: Some("card declined".to_string()),
        created_at: at(2024, 1, 1),
        updated_at: at(2024, 1, 1),
    }
}

#[tokio::test]
async fn renews_due_obligation_with_escalation() {
    let h = harness();
    let mut ob = obligation(at(2024, 1, 1));
    ob.escalation = Escalation::Percent(Decimal::new(5, 0));
    let id = ob.id;
    h.store.insert_obligation(ob).await;

    let summary = h
        .engine
        .process_due(at(2024, 1, 1), &DueFilter::default(), false)
        .await
        .unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.renewed, 1);
    assert_eq!(summary.escalated, 1);
    assert_eq!(summary.failed, 0);

    let invoices = h.store.invoices_for(id).await;
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].amount, Decimal::new(105, 0));
    assert_eq!(invoices[0].status, InvoiceStatus::Pending);
    assert_eq!(invoices[0].due_at, at(2024, 1, 1));

    let updated = h.store.obligation(id).await.unwrap();
    assert_eq!(updated.next_due_at, at(2024, 2, 1));
    assert_eq!(updated.last_processed_at, Some(at(2024, 1, 1)));
}

#[tokio::test]
async fn held_lock_rejects_second_invocation() {
    let h = harness();
    let ob = obligation(at(2024, 1, 1));
    let id = ob.id;
    h.store.insert_obligation(ob).await;

    // another host is mid-run
    assert!(
        h.store
            .try_acquire("billing.renewals", "other-host", Duration::hours(4))
            .await
            .unwrap()
    );

    let outcome = h
        .engine
        .run(Job::Renewals, at(2024, 1, 1), &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Skipped(SkipReason::LockHeld));
    assert!(h.store.invoices_for(id).await.is_empty());
}

#[tokio::test]
async fn completed_run_suppresses_same_day_rerun() {
    let h = harness();
    let ob = obligation(at(2024, 1, 1));
    let id = ob.id;
    h.store.insert_obligation(ob).await;

    let first = h
        .engine
        .run(Job::Renewals, at(2024, 1, 1), &RunOptions::default())
        .await
        .unwrap();
    assert!(matches!(first, RunOutcome::Completed(_)));

    let second = h
        .engine
        .run(Job::Renewals, at(2024, 1, 1), &RunOptions::default())
        .await
        .unwrap();
    assert_eq!(second, RunOutcome::Skipped(SkipReason::AlreadyRan));
    assert_eq!(h.store.invoices_for(id).await.len(), 1);

    // forced rerun goes through the full path again
    let forced = h
        .engine
        .run(
            Job::Renewals,
            at(2024, 1, 1),
            &RunOptions {
                force: true,
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(matches!(forced, RunOutcome::Completed(_)));
    assert_eq!(h.store.invoices_for(id).await.len(), 1);
}

#[tokio::test]
async fn completed_run_is_recorded_and_lock_released() {
    let h = harness();
    h.store.insert_obligation(obligation(at(2024, 1, 1))).await;

    h.engine
        .run(Job::Renewals, at(2024, 1, 1), &RunOptions::default())
        .await
        .unwrap();

    let runs = h.store.runs().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].job_name, "billing.renewals");
    assert_eq!(runs[0].status, "COMPLETED");
    assert_eq!(runs[0].results["renewed"], 1);
    assert!(h.store.lock("billing.renewals").await.is_none());
}

#[tokio::test]
async fn failed_renewal_keeps_due_date_and_retries_next_run() {
    let h = harness();
    let ob = obligation(at(2024, 1, 1));
    let id = ob.id;
    h.store.insert_obligation(ob).await;
    h.store.fail_renewal_for(id).await;

    let summary = h
        .engine
        .process_due(at(2024, 1, 1), &DueFilter::default(), false)
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.renewed, 0);
    assert_eq!(summary.errors.len(), 1);

    let unchanged = h.store.obligation(id).await.unwrap();
    assert_eq!(unchanged.next_due_at, at(2024, 1, 1));
    assert!(unchanged.last_processed_at.is_none());
    assert!(h.store.invoices_for(id).await.is_empty());

    // the failure was transient: the next run picks the obligation up again
    let retry = h
        .engine
        .process_due(at(2024, 1, 2), &DueFilter::default(), false)
        .await
        .unwrap();
    assert_eq!(retry.renewed, 1);
    assert_eq!(h.store.obligation(id).await.unwrap().next_due_at, at(2024, 2, 1));
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let h = harness_with(EngineOptions {
        batch_size: 4,
        ..EngineOptions::default()
    });
    let mut ids = Vec::new();
    for day in 1..=10 {
        let ob = obligation(at(2024, 1, day));
        ids.push(ob.id);
        h.store.insert_obligation(ob).await;
    }

    let outcome = h
        .engine
        .run(
            Job::Renewals,
            at(2024, 1, 15),
            &RunOptions {
                dry_run: true,
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    let RunOutcome::Completed(summary) = outcome else {
        panic!("dry run should complete");
    };
    assert_eq!(summary.processed, 10);
    assert_eq!(summary.renewed, 10);

    assert!(h.store.all_invoices().await.is_empty());
    for (day, id) in (1..=10).zip(&ids) {
        let ob = h.store.obligation(*id).await.unwrap();
        assert_eq!(ob.next_due_at, at(2024, 1, day));
        assert!(ob.last_processed_at.is_none());
    }
    // a dry run is not recorded and must not suppress the real one
    assert!(h.store.runs().await.is_empty());
}

#[tokio::test]
async fn inactive_contract_pauses_instead_of_processing() {
    let h = harness();
    let ob = obligation(at(2024, 1, 1));
    let id = ob.id;
    let contract_id = ob.contract_id;
    h.store.insert_obligation(ob).await;
    h.store.set_contract_active(contract_id, false).await;

    let summary = h
        .engine
        .process_due(at(2024, 1, 1), &DueFilter::default(), false)
        .await
        .unwrap();
    assert_eq!(summary.paused, 1);
    assert_eq!(summary.renewed, 0);
    assert_eq!(summary.failed, 0);

    let paused = h.store.obligation(id).await.unwrap();
    assert_eq!(paused.status, ObligationStatus::Paused);
    assert_eq!(paused.pause_reason.as_deref(), Some("contract no longer active"));
    assert_eq!(paused.next_due_at, at(2024, 1, 1));
    assert!(h.store.invoices_for(id).await.is_empty());
}

#[tokio::test]
async fn existing_period_invoice_counts_as_renewed_once() {
    let h = harness();
    let ob = obligation(at(2024, 1, 1));
    let id = ob.id;
    h.store.insert_obligation(ob).await;
    let mut existing = failed_invoice(0, None);
    existing.obligation_id = id;
    existing.status = InvoiceStatus::Pending;
    h.store.insert_invoice(existing).await;

    let summary = h
        .engine
        .process_due(at(2024, 1, 1), &DueFilter::default(), false)
        .await
        .unwrap();
    assert_eq!(summary.renewed, 1);
    assert_eq!(h.store.invoices_for(id).await.len(), 1);
    assert_eq!(h.store.obligation(id).await.unwrap().next_due_at, at(2024, 2, 1));
}

#[tokio::test]
async fn paging_covers_every_obligation_despite_failures() {
    let h = harness_with(EngineOptions {
        batch_size: 2,
        ..EngineOptions::default()
    });
    let mut ids = Vec::new();
    for day in 1..=5 {
        let ob = obligation(at(2024, 1, day));
        ids.push(ob.id);
        h.store.insert_obligation(ob).await;
    }
    h.store.fail_renewal_for(ids[1]).await;
    h.store.fail_renewal_for(ids[3]).await;

    let summary = h
        .engine
        .process_due(at(2024, 1, 10), &DueFilter::default(), false)
        .await
        .unwrap();

    assert_eq!(summary.processed, 5);
    assert_eq!(summary.renewed, 3);
    assert_eq!(summary.failed, 2);
    assert_eq!(h.store.all_invoices().await.len(), 3);
}

#[tokio::test]
async fn tenant_filter_restricts_the_batch() {
    let h = harness();
    let tenant = Uuid::new_v4();
    let mut mine = obligation(at(2024, 1, 1));
    mine.tenant_id = tenant;
    let mine_id = mine.id;
    let other = obligation(at(2024, 1, 1));
    let other_id = other.id;
    h.store.insert_obligation(mine).await;
    h.store.insert_obligation(other).await;

    let summary = h
        .engine
        .process_due(
            at(2024, 1, 1),
            &DueFilter {
                tenant_id: Some(tenant),
                due_from: None,
            },
            false,
        )
        .await
        .unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(h.store.invoices_for(mine_id).await.len(), 1);
    assert!(h.store.invoices_for(other_id).await.is_empty());
}

#[tokio::test]
async fn retry_respects_backoff_window() {
    let h = harness();
    let last = at(2024, 1, 1);
    let invoice = failed_invoice(1, Some(last));
    let id = invoice.id;
    h.store.insert_invoice(invoice).await;

    // attempts=1 waits four hours
    let early = h
        .engine
        .process_failed(last + Duration::hours(3), false)
        .await
        .unwrap();
    assert_eq!(early.skipped, 1);
    assert_eq!(early.processed, 0);
    assert!(h.gateway.charges().await.is_empty());

    let ready = h
        .engine
        .process_failed(last + Duration::hours(4), false)
        .await
        .unwrap();
    assert_eq!(ready.processed, 1);
    assert_eq!(ready.charged, 1);

    let paid = h.store.invoice(id).await.unwrap();
    assert_eq!(paid.status, InvoiceStatus::Paid);
    assert_eq!(paid.payment_attempts, 2);
    assert_eq!(paid.payment_ref.as_deref(), Some(format!("txn-{id}").as_str()));
}

#[tokio::test]
async fn exhausted_invoice_is_terminal_and_notified_once() {
    let h = harness();
    h.gateway
        .set_mode(GatewayMode::Decline("card declined".to_string()))
        .await;
    let invoice = failed_invoice(2, Some(at(2024, 1, 1)));
    let id = invoice.id;
    h.store.insert_invoice(invoice).await;

    let summary = h
        .engine
        .process_failed(at(2024, 1, 3), false)
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.exhausted, 1);

    let exhausted = h.store.invoice(id).await.unwrap();
    assert_eq!(exhausted.status, InvoiceStatus::Overdue);
    assert_eq!(exhausted.payment_attempts, 3);

    let delivered = h.sink.delivered().await;
    assert_eq!(delivered.len(), 1);
    assert!(matches!(
        delivered[0],
        Notice::PaymentExhausted { invoice_id, attempts: 3, .. } if invoice_id == id
    ));

    // terminal: a later run neither charges nor re-notifies
    let later = h
        .engine
        .process_failed(at(2024, 6, 1), false)
        .await
        .unwrap();
    assert_eq!(later.processed, 0);
    assert_eq!(h.gateway.charges().await.len(), 1);
    assert_eq!(h.sink.delivered().await.len(), 1);
}

#[tokio::test]
async fn unreachable_gateway_burns_an_attempt() {
    let h = harness();
    h.gateway
        .set_mode(GatewayMode::Unreachable("connect timeout".to_string()))
        .await;
    let invoice = failed_invoice(0, None);
    let id = invoice.id;
    h.store.insert_invoice(invoice).await;

    let summary = h
        .engine
        .process_failed(at(2024, 1, 2), false)
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);

    let failed = h.store.invoice(id).await.unwrap();
    assert_eq!(failed.status, InvoiceStatus::Failed);
    assert_eq!(failed.payment_attempts, 1);
    assert!(
        failed
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("gateway unreachable")
    );
}

#[tokio::test]
async fn dry_run_retry_never_touches_the_gateway() {
    let h = harness();
    h.store.insert_invoice(failed_invoice(0, None)).await;

    let summary = h
        .engine
        .process_failed(at(2024, 1, 2), true)
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.charged, 0);
    assert!(h.gateway.charges().await.is_empty());
}

#[tokio::test]
async fn thirty_day_notice_is_sent_exactly_once() {
    let h = harness_with(EngineOptions {
        lead_days: vec![30],
        ..EngineOptions::default()
    });
    let as_of = at(2024, 1, 1);
    let ob = obligation(as_of + Duration::days(20));
    let id = ob.id;
    h.store.insert_obligation(ob).await;

    let first = h.engine.send_due_notices(as_of, false).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].status, DispatchStatus::Sent);
    assert_eq!(first[0].lead_days, 30);

    let second = h.engine.send_due_notices(as_of, false).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].status, DispatchStatus::AlreadySent);

    let delivered = h.sink.delivered().await;
    assert_eq!(delivered.len(), 1);
    assert!(matches!(
        delivered[0],
        Notice::Renewal { obligation_id, lead_days: 30, .. } if obligation_id == id
    ));
}

#[tokio::test]
async fn each_lead_interval_fires_independently() {
    let h = harness();
    let as_of = at(2024, 1, 1);
    // 45 days out: inside the 90 and 60 day windows, outside 30
    h.store
        .insert_obligation(obligation(as_of + Duration::days(45)))
        .await;

    let dispatches = h.engine.send_due_notices(as_of, false).await.unwrap();
    let mut leads: Vec<i32> = dispatches.iter().map(|d| d.lead_days).collect();
    leads.sort_unstable();
    assert_eq!(leads, vec![60, 90]);
    assert!(dispatches.iter().all(|d| d.status == DispatchStatus::Sent));
    assert_eq!(h.sink.delivered().await.len(), 2);
}

#[tokio::test]
async fn failed_delivery_is_logged_not_retried() {
    let h = harness_with(EngineOptions {
        lead_days: vec![30],
        ..EngineOptions::default()
    });
    let as_of = at(2024, 1, 1);
    h.store
        .insert_obligation(obligation(as_of + Duration::days(10)))
        .await;
    h.sink.set_failing(true).await;

    let first = h.engine.send_due_notices(as_of, false).await.unwrap();
    assert_eq!(first[0].status, DispatchStatus::DeliveryFailed);

    h.sink.set_failing(false).await;
    let second = h.engine.send_due_notices(as_of, false).await.unwrap();
    assert_eq!(second[0].status, DispatchStatus::AlreadySent);
    assert!(h.sink.delivered().await.is_empty());
}

#[tokio::test]
async fn notice_run_summarizes_dispatches() {
    let h = harness_with(EngineOptions {
        lead_days: vec![30],
        ..EngineOptions::default()
    });
    let as_of = at(2024, 1, 1);
    h.store
        .insert_obligation(obligation(as_of + Duration::days(10)))
        .await;

    let outcome = h
        .engine
        .run(Job::RenewalNotices, as_of, &RunOptions::default())
        .await
        .unwrap();
    let RunOutcome::Completed(summary) = outcome else {
        panic!("notice run should complete");
    };
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.notices_sent, 1);

    let runs = h.store.runs().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].job_name, "billing.renewal_notices");
}
