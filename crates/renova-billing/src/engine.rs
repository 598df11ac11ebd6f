use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use renova_core::{
    AttemptWrite, ChargeOutcome, DueFilter, InvoiceStore, LockStore, NewInvoice, Notice,
    NoticeLog, NoticeSink, Obligation, ObligationStore, PaymentGateway, RenewalWrite, RunLedger,
    RunRecord, advance_due, eligible_for_retry, escalated_amount, period_start,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::summary::{DispatchStatus, NoticeDispatch, RunSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Renewals,
    PaymentRetry,
    RenewalNotices,
}

impl Job {
    pub fn job_name(&self) -> &'static str {
        match self {
            Job::Renewals => "billing.renewals",
            Job::PaymentRetry => "billing.payment_retry",
            Job::RenewalNotices => "billing.renewal_notices",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub holder_id: String,
    pub batch_size: i64,
    pub max_attempts: i32,
    pub stale_after: Duration,
    pub lead_days: Vec<i32>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            holder_id: "renova".to_string(),
            batch_size: 500,
            max_attempts: 3,
            stale_after: Duration::hours(4),
            lead_days: vec![90, 60, 30],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub force: bool,
    pub dry_run: bool,
    pub filter: DueFilter,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunSummary),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRan,
    LockHeld,
}

pub struct Stores {
    pub obligations: Arc<dyn ObligationStore>,
    pub invoices: Arc<dyn InvoiceStore>,
    pub ledger: Arc<dyn RunLedger>,
    pub locks: Arc<dyn LockStore>,
    pub notice_log: Arc<dyn NoticeLog>,
}

pub struct RenewalEngine {
    obligations: Arc<dyn ObligationStore>,
    invoices: Arc<dyn InvoiceStore>,
    ledger: Arc<dyn RunLedger>,
    locks: Arc<dyn LockStore>,
    notice_log: Arc<dyn NoticeLog>,
    gateway: Arc<dyn PaymentGateway>,
    sink: Arc<dyn NoticeSink>,
    options: EngineOptions,
}

enum Disposition {
    Renewed { escalated: bool },
    Paused,
}

impl RenewalEngine {
    pub fn new(
        stores: Stores,
        gateway: Arc<dyn PaymentGateway>,
        sink: Arc<dyn NoticeSink>,
        options: EngineOptions,
    ) -> Self {
        Self {
            obligations: stores.obligations,
            invoices: stores.invoices,
            ledger: stores.ledger,
            locks: stores.locks,
            notice_log: stores.notice_log,
            gateway,
            sink,
            options,
        }
    }

    /// Runs one job under both single-flight guards: the run ledger at date
    /// granularity and the coordination lock at in-flight granularity. The
    /// lock is always released, success or failure.
    pub async fn run(
        &self,
        job: Job,
        as_of: DateTime<Utc>,
        opts: &RunOptions,
    ) -> Result<RunOutcome> {
        let job_name = job.job_name();
        let run_date = as_of.date_naive();

        if !opts.force
            && !opts.dry_run
            && self
                .ledger
                .has_run_on(job_name, run_date)
                .await
                .context("checking run ledger")?
        {
            info!(job = job_name, %run_date, "skipped: already ran");
            return Ok(RunOutcome::Skipped(SkipReason::AlreadyRan));
        }

        let acquired = match self
            .locks
            .try_acquire(job_name, &self.options.holder_id, self.options.stale_after)
            .await
        {
            Ok(acquired) => acquired,
            Err(err) => {
                // fail-safe: an unreachable lock store reads as a held lock
                warn!(job = job_name, "lock acquisition failed, treating as held: {err:#}");
                false
            }
        };
        if !acquired {
            info!(job = job_name, "skipped: lock held");
            return Ok(RunOutcome::Skipped(SkipReason::LockHeld));
        }

        let started_at = Utc::now();
        let result = self.execute(job, as_of, opts).await;
        if let Err(err) = self.locks.release(job_name, &self.options.holder_id).await {
            warn!(job = job_name, "failed to release job lock: {err:#}");
        }

        match result {
            Ok(summary) => {
                if !opts.dry_run {
                    self.ledger
                        .record_run(&RunRecord {
                            id: Uuid::new_v4(),
                            job_name: job_name.to_string(),
                            run_date,
                            status: "COMPLETED".to_string(),
                            results: serde_json::to_value(&summary)?,
                            started_at,
                            finished_at: Utc::now(),
                        })
                        .await
                        .context("recording run")?;
                }
                Ok(RunOutcome::Completed(summary))
            }
            Err(err) => {
                error!(job = job_name, "run failed: {err:#}");
                if !opts.dry_run {
                    let record = RunRecord {
                        id: Uuid::new_v4(),
                        job_name: job_name.to_string(),
                        run_date,
                        status: "FAILED".to_string(),
                        results: serde_json::json!({ "error": format!("{err:#}") }),
                        started_at,
                        finished_at: Utc::now(),
                    };
                    if let Err(ledger_err) = self.ledger.record_run(&record).await {
                        warn!(job = job_name, "failed to record failed run: {ledger_err:#}");
                    }
                }
                Err(err)
            }
        }
    }

    async fn execute(&self, job: Job, as_of: DateTime<Utc>, opts: &RunOptions) -> Result<RunSummary> {
        match job {
            Job::Renewals => self.process_due(as_of, &opts.filter, opts.dry_run).await,
            Job::PaymentRetry => self.process_failed(as_of, opts.dry_run).await,
            Job::RenewalNotices => {
                let dispatches = self.send_due_notices(as_of, opts.dry_run).await?;
                Ok(summarize_dispatches(&dispatches))
            }
        }
    }

    /// Renews every due obligation in bounded pages. Obligations are
    /// independent: one failure never blocks the rest, and a failed
    /// obligation keeps its due date so the next run picks it up again.
    pub async fn process_due(
        &self,
        as_of: DateTime<Utc>,
        filter: &DueFilter,
        dry_run: bool,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let batch = self.options.batch_size;
        let mut offset = 0i64;
        // failed rows stay inside the due window; page past them
        let mut stuck = 0i64;

        loop {
            let page = self
                .obligations
                .find_due(as_of, filter, batch, offset)
                .await
                .context("loading due obligations")?;
            if page.is_empty() {
                break;
            }
            let full_page = page.len() as i64 == batch;

            for obligation in &page {
                summary.processed += 1;
                match self.renew_one(obligation, as_of, dry_run).await {
                    Ok(Disposition::Renewed { escalated }) => {
                        summary.renewed += 1;
                        if escalated {
                            summary.escalated += 1;
                        }
                    }
                    Ok(Disposition::Paused) => {
                        summary.paused += 1;
                    }
                    Err(err) => {
                        stuck += 1;
                        warn!(obligation_id = %obligation.id, "renewal failed: {err:#}");
                        summary.record_error(format!("{}: {err:#}", obligation.id));
                    }
                }
            }

            if !full_page {
                break;
            }
            offset = if dry_run { offset + batch } else { stuck };
        }

        info!(
            processed = summary.processed,
            renewed = summary.renewed,
            paused = summary.paused,
            failed = summary.failed,
            dry_run,
            "renewal batch finished"
        );
        Ok(summary)
    }

    async fn renew_one(
        &self,
        obligation: &Obligation,
        as_of: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<Disposition> {
        let contract_active = self
            .obligations
            .contract_is_active(obligation.contract_id)
            .await
            .context("checking contract status")?;
        if !contract_active {
            if !dry_run {
                self.obligations
                    .pause(obligation.id, "contract no longer active", as_of)
                    .await
                    .context("pausing obligation")?;
            }
            info!(obligation_id = %obligation.id, "paused: contract no longer active");
            return Ok(Disposition::Paused);
        }

        let amount = escalated_amount(obligation.amount, &obligation.escalation);
        let escalated = amount != obligation.amount;
        let next_due_at = advance_due(obligation.frequency, obligation.next_due_at);

        if dry_run {
            debug!(obligation_id = %obligation.id, %amount, "dry-run: would invoice");
            return Ok(Disposition::Renewed { escalated });
        }

        let invoice = NewInvoice {
            id: Uuid::new_v4(),
            obligation_id: obligation.id,
            period_start: period_start(obligation.next_due_at),
            amount,
            currency: obligation.currency.clone(),
            due_at: obligation.next_due_at,
        };
        match self
            .obligations
            .complete_renewal(obligation.id, invoice, next_due_at, as_of)
            .await?
        {
            RenewalWrite::Invoiced(invoice_id) => {
                debug!(obligation_id = %obligation.id, %invoice_id, "invoice generated");
            }
            RenewalWrite::AlreadyBilled => {
                debug!(obligation_id = %obligation.id, "period already billed");
            }
        }
        Ok(Disposition::Renewed { escalated })
    }

    /// Re-attempts capture for failed invoices that have waited out their
    /// backoff window. An attempt that lands on the ceiling marks the invoice
    /// overdue and emits exactly one payment-exhausted notice.
    pub async fn process_failed(&self, as_of: DateTime<Utc>, dry_run: bool) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let candidates = self
            .invoices
            .find_retryable(self.options.max_attempts, self.options.batch_size)
            .await
            .context("loading retryable invoices")?;

        for invoice in candidates {
            if !eligible_for_retry(
                invoice.payment_attempts,
                invoice.last_payment_attempt_at,
                self.options.max_attempts,
                as_of,
            ) {
                summary.skipped += 1;
                continue;
            }
            summary.processed += 1;
            if dry_run {
                debug!(invoice_id = %invoice.id, "dry-run: would attempt capture");
                continue;
            }

            let outcome = match self.gateway.attempt_charge(&invoice).await {
                Ok(outcome) => outcome,
                // a transport failure still burns an attempt so backoff applies
                Err(err) => ChargeOutcome {
                    approved: false,
                    transaction_id: None,
                    error: Some(format!("gateway unreachable: {err:#}")),
                },
            };

            if outcome.approved {
                self.invoices
                    .record_attempt(
                        invoice.id,
                        &AttemptWrite {
                            at: as_of,
                            approved: true,
                            transaction_id: outcome.transaction_id,
                            error: None,
                            exhausted: false,
                        },
                    )
                    .await
                    .context("recording captured payment")?;
                summary.charged += 1;
                continue;
            }

            let attempts_now = invoice.payment_attempts + 1;
            let exhausted = attempts_now >= self.options.max_attempts;
            self.invoices
                .record_attempt(
                    invoice.id,
                    &AttemptWrite {
                        at: as_of,
                        approved: false,
                        transaction_id: None,
                        error: outcome.error.clone(),
                        exhausted,
                    },
                )
                .await
                .context("recording failed payment attempt")?;
            summary.record_error(format!(
                "{}: {}",
                invoice.id,
                outcome.error.unwrap_or_else(|| "capture declined".to_string())
            ));

            if exhausted {
                summary.exhausted += 1;
                let notice = Notice::PaymentExhausted {
                    invoice_id: invoice.id,
                    obligation_id: invoice.obligation_id,
                    amount: invoice.amount,
                    currency: invoice.currency.clone(),
                    attempts: attempts_now,
                };
                if let Err(err) = self.sink.deliver(notice).await {
                    warn!(invoice_id = %invoice.id, "payment-exhausted notice not delivered: {err:#}");
                }
            }
        }

        info!(
            processed = summary.processed,
            charged = summary.charged,
            exhausted = summary.exhausted,
            failed = summary.failed,
            dry_run,
            "payment retry batch finished"
        );
        Ok(summary)
    }

    /// Sends one renewal notice per (obligation, due date, lead interval).
    /// Delivery is fire-and-forget: the sent record is written even when the
    /// sink errors, so a notice is never retried.
    pub async fn send_due_notices(
        &self,
        as_of: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<Vec<NoticeDispatch>> {
        let mut dispatches = Vec::new();
        for &lead_days in &self.options.lead_days {
            let upcoming = self
                .obligations
                .find_upcoming(as_of, lead_days as i64)
                .await
                .context("loading upcoming obligations")?;

            for obligation in upcoming {
                let due_on = period_start(obligation.next_due_at);
                if self
                    .notice_log
                    .was_sent(obligation.id, due_on, lead_days)
                    .await
                    .context("checking notice log")?
                {
                    dispatches.push(NoticeDispatch {
                        obligation_id: obligation.id,
                        lead_days,
                        status: DispatchStatus::AlreadySent,
                    });
                    continue;
                }

                if dry_run {
                    debug!(obligation_id = %obligation.id, lead_days, "dry-run: would notify");
                    dispatches.push(NoticeDispatch {
                        obligation_id: obligation.id,
                        lead_days,
                        status: DispatchStatus::Sent,
                    });
                    continue;
                }

                let notice = Notice::Renewal {
                    obligation_id: obligation.id,
                    tenant_id: obligation.tenant_id,
                    client_id: obligation.client_id,
                    amount: obligation.amount,
                    currency: obligation.currency.clone(),
                    due_on,
                    lead_days,
                };
                let status = match self.sink.deliver(notice).await {
                    Ok(()) => DispatchStatus::Sent,
                    Err(err) => {
                        warn!(obligation_id = %obligation.id, lead_days, "notice not delivered: {err:#}");
                        DispatchStatus::DeliveryFailed
                    }
                };
                self.notice_log
                    .mark_sent(obligation.id, due_on, lead_days, as_of)
                    .await
                    .context("recording sent notice")?;
                dispatches.push(NoticeDispatch {
                    obligation_id: obligation.id,
                    lead_days,
                    status,
                });
            }
        }
        Ok(dispatches)
    }
}

fn summarize_dispatches(dispatches: &[NoticeDispatch]) -> RunSummary {
    let mut summary = RunSummary {
        processed: dispatches.len() as u64,
        ..RunSummary::default()
    };
    for dispatch in dispatches {
        match dispatch.status {
            DispatchStatus::Sent => summary.notices_sent += 1,
            DispatchStatus::AlreadySent => summary.skipped += 1,
            DispatchStatus::DeliveryFailed => {
                summary.record_error(format!(
                    "{}: {}-day notice delivery failed",
                    dispatch.obligation_id, dispatch.lead_days
                ));
            }
        }
    }
    summary
}
