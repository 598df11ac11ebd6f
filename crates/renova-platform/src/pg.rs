use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use renova_core::{
    AttemptWrite, BillingFrequency, ChargeOutcome, DueFilter, Escalation, Invoice, InvoiceStatus,
    InvoiceStore, LockStore, NewInvoice, NoticeLog, Obligation, ObligationStatus, ObligationStore,
    PaymentGateway, RenewalWrite, RunLedger, RunRecord,
};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

const OBLIGATION_COLUMNS: &str = "id, tenant_id, client_id, contract_id, amount, currency, \
     frequency, escalation_kind, escalation_value, next_due_at, status, auto_renew, \
     pause_reason, last_processed_at, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, obligation_id, period_start, amount, currency, status, \
     due_at, payment_attempts, last_payment_attempt_at, payment_ref, failure_reason, \
     created_at, updated_at";

/// Postgres-backed implementation of every billing storage trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn obligation_from_row(row: &PgRow) -> Result<Obligation> {
    let status_raw: String = row.try_get("status")?;
    let frequency_raw: String = row.try_get("frequency")?;
    let escalation_kind: String = row.try_get("escalation_kind")?;
    let escalation_value: Decimal = row.try_get("escalation_value")?;

    Ok(Obligation {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        client_id: row.try_get("client_id")?,
        contract_id: row.try_get("contract_id")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        frequency: BillingFrequency::parse(&frequency_raw)?,
        escalation: Escalation::from_parts(&escalation_kind, escalation_value)?,
        next_due_at: row.try_get("next_due_at")?,
        status: ObligationStatus::parse(&status_raw)?,
        auto_renew: row.try_get("auto_renew")?,
        pause_reason: row.try_get("pause_reason")?,
        last_processed_at: row.try_get("last_processed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn invoice_from_row(row: &PgRow) -> Result<Invoice> {
    let status_raw: String = row.try_get("status")?;

    Ok(Invoice {
        id: row.try_get("id")?,
        obligation_id: row.try_get("obligation_id")?,
        period_start: row.try_get("period_start")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        status: InvoiceStatus::parse(&status_raw)?,
        due_at: row.try_get("due_at")?,
        payment_attempts: row.try_get("payment_attempts")?,
        last_payment_attempt_at: row.try_get("last_payment_attempt_at")?,
        payment_ref: row.try_get("payment_ref")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ObligationStore for PgStore {
    async fn find_due(
        &self,
        as_of: DateTime<Utc>,
        filter: &DueFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Obligation>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OBLIGATION_COLUMNS}
            FROM obligations
            WHERE status = 'ACTIVE'
              AND auto_renew
              AND next_due_at <= $1
              AND ($2::uuid IS NULL OR tenant_id = $2)
              AND ($3::timestamptz IS NULL OR next_due_at >= $3)
            ORDER BY next_due_at ASC, id ASC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(as_of)
        .bind(filter.tenant_id)
        .bind(filter.due_from)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(obligation_from_row).collect()
    }

    async fn contract_is_active(&self, contract_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT status FROM contracts WHERE id = $1")
            .bind(contract_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|r| r.try_get::<String, _>("status"))
            .transpose()?
            .is_some_and(|status| status == "ACTIVE"))
    }

    async fn pause(&self, obligation_id: Uuid, reason: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE obligations SET status = 'PAUSED', pause_reason = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(obligation_id)
        .bind(reason)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_renewal(
        &self,
        obligation_id: Uuid,
        invoice: NewInvoice,
        next_due_at: DateTime<Utc>,
        processed_at: DateTime<Utc>,
    ) -> Result<RenewalWrite> {
        let mut tx = self.pool.begin().await?;

        // (obligation_id, period_start) is unique; a second writer loses here
        let inserted = sqlx::query(
            r#"
            INSERT INTO invoices (
                id, obligation_id, period_start, amount, currency, status, due_at,
                payment_attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 'PENDING', $6, 0, $7, $7)
            ON CONFLICT (obligation_id, period_start) DO NOTHING
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.obligation_id)
        .bind(invoice.period_start)
        .bind(invoice.amount)
        .bind(&invoice.currency)
        .bind(invoice.due_at)
        .bind(processed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE obligations SET next_due_at = $2, last_processed_at = $3, updated_at = $3 WHERE id = $1",
        )
        .bind(obligation_id)
        .bind(next_due_at)
        .bind(processed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if inserted.rows_affected() == 0 {
            Ok(RenewalWrite::AlreadyBilled)
        } else {
            Ok(RenewalWrite::Invoiced(invoice.id))
        }
    }

    async fn find_upcoming(
        &self,
        as_of: DateTime<Utc>,
        within_days: i64,
    ) -> Result<Vec<Obligation>> {
        let horizon = as_of + Duration::days(within_days);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OBLIGATION_COLUMNS}
            FROM obligations
            WHERE status = 'ACTIVE'
              AND next_due_at > $1
              AND next_due_at <= $2
            ORDER BY next_due_at ASC, id ASC
            "#
        ))
        .bind(as_of)
        .bind(horizon)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(obligation_from_row).collect()
    }
}

#[async_trait]
impl InvoiceStore for PgStore {
    async fn find_retryable(&self, max_attempts: i32, limit: i64) -> Result<Vec<Invoice>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE status = 'FAILED' AND payment_attempts < $1
            ORDER BY last_payment_attempt_at ASC NULLS FIRST, id ASC
            LIMIT $2
            "#
        ))
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(invoice_from_row).collect()
    }

    async fn record_attempt(&self, invoice_id: Uuid, write: &AttemptWrite) -> Result<()> {
        if write.approved {
            sqlx::query(
                r#"
                UPDATE invoices
                SET status = 'PAID',
                    payment_attempts = payment_attempts + 1,
                    last_payment_attempt_at = $2,
                    payment_ref = $3,
                    failure_reason = NULL,
                    updated_at = $2
                WHERE id = $1
                "#,
            )
            .bind(invoice_id)
            .bind(write.at)
            .bind(&write.transaction_id)
            .execute(&self.pool)
            .await?;
        } else {
            let status = if write.exhausted { "OVERDUE" } else { "FAILED" };
            sqlx::query(
                r#"
                UPDATE invoices
                SET status = $2,
                    payment_attempts = payment_attempts + 1,
                    last_payment_attempt_at = $3,
                    failure_reason = $4,
                    updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(invoice_id)
            .bind(status)
            .bind(write.at)
            .bind(&write.error)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl RunLedger for PgStore {
    async fn has_run_on(&self, job_name: &str, date: NaiveDate) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM run_ledger WHERE job_name = $1 AND run_date = $2 AND status = 'COMPLETED') AS ran",
        )
        .bind(job_name)
        .bind(date)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("ran")?)
    }

    async fn record_run(&self, record: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_ledger (id, job_name, run_date, status, results, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_name, run_date) DO UPDATE SET
                id = EXCLUDED.id,
                status = EXCLUDED.status,
                results = EXCLUDED.results,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at
            "#,
        )
        .bind(record.id)
        .bind(&record.job_name)
        .bind(record.run_date)
        .bind(&record.status)
        .bind(&record.results)
        .bind(record.started_at)
        .bind(record.finished_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_runs(&self, job_name: Option<&str>, limit: i64) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_name, run_date, status, results, started_at, finished_at
            FROM run_ledger
            WHERE ($1::text IS NULL OR job_name = $1)
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(job_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RunRecord {
                    id: row.try_get("id")?,
                    job_name: row.try_get("job_name")?,
                    run_date: row.try_get("run_date")?,
                    status: row.try_get("status")?,
                    results: row.try_get("results")?,
                    started_at: row.try_get("started_at")?,
                    finished_at: row.try_get("finished_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl LockStore for PgStore {
    async fn try_acquire(
        &self,
        job_name: &str,
        holder_id: &str,
        stale_after: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let stale_cutoff = now - stale_after;

        // conditional upsert: the update only fires when the held lock is stale,
        // so rows_affected == 0 means somebody live still holds it
        let result = sqlx::query(
            r#"
            INSERT INTO job_locks (job_name, holder_id, acquired_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_name) DO UPDATE SET
                holder_id = EXCLUDED.holder_id,
                acquired_at = EXCLUDED.acquired_at
            WHERE job_locks.acquired_at < $4
            "#,
        )
        .bind(job_name)
        .bind(holder_id)
        .bind(now)
        .bind(stale_cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, job_name: &str, holder_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM job_locks WHERE job_name = $1 AND holder_id = $2")
            .bind(job_name)
            .bind(holder_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl NoticeLog for PgStore {
    async fn was_sent(
        &self,
        obligation_id: Uuid,
        due_on: NaiveDate,
        lead_days: i32,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM renewal_notices WHERE obligation_id = $1 AND due_on = $2 AND lead_days = $3) AS sent",
        )
        .bind(obligation_id)
        .bind(due_on)
        .bind(lead_days)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("sent")?)
    }

    async fn mark_sent(
        &self,
        obligation_id: Uuid,
        due_on: NaiveDate,
        lead_days: i32,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO renewal_notices (obligation_id, due_on, lead_days, sent_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (obligation_id, due_on, lead_days) DO NOTHING
            "#,
        )
        .bind(obligation_id)
        .bind(due_on)
        .bind(lead_days)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Captures payment from the client's prepaid balance: deduct and settle in
/// one transaction. Insufficient funds is a decline, not an error.
pub struct BalanceGateway {
    pool: PgPool,
}

impl BalanceGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentGateway for BalanceGateway {
    async fn attempt_charge(&self, invoice: &Invoice) -> Result<ChargeOutcome> {
        let mut tx = self.pool.begin().await?;

        let obligation_row = sqlx::query("SELECT client_id FROM obligations WHERE id = $1")
            .bind(invoice.obligation_id)
            .fetch_optional(&mut *tx)
            .await?
            .context("obligation not found for invoice")?;
        let client_id: Uuid = obligation_row.try_get("client_id")?;

        let balance_row = sqlx::query(
            "SELECT available FROM client_balances WHERE client_id = $1 AND currency = $2 FOR UPDATE",
        )
        .bind(client_id)
        .bind(&invoice.currency)
        .fetch_optional(&mut *tx)
        .await?;

        let available: Decimal = match balance_row {
            Some(row) => row.try_get("available")?,
            None => {
                return Ok(ChargeOutcome {
                    approved: false,
                    transaction_id: None,
                    error: Some("no payment account on file".to_string()),
                });
            }
        };

        if available < invoice.amount {
            return Ok(ChargeOutcome {
                approved: false,
                transaction_id: None,
                error: Some(format!(
                    "insufficient funds: {} {} available",
                    available, invoice.currency
                )),
            });
        }

        sqlx::query(
            "UPDATE client_balances SET available = available - $3, updated_at = $4 WHERE client_id = $1 AND currency = $2",
        )
        .bind(client_id)
        .bind(&invoice.currency)
        .bind(invoice.amount)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let transaction_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO settlements (id, invoice_id, client_id, amount, currency, received_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(transaction_id)
        .bind(invoice.id)
        .bind(client_id)
        .bind(invoice.amount)
        .bind(&invoice.currency)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ChargeOutcome {
            approved: true,
            transaction_id: Some(transaction_id.to_string()),
            error: None,
        })
    }
}
