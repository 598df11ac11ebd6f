use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{
    DueFilter, Invoice, NewInvoice, Notice, Obligation, RenewalWrite, RunRecord,
};

/// A declined capture is data, not an error; `Err` is reserved for transport
/// failures reaching the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeOutcome {
    pub approved: bool,
    pub transaction_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AttemptWrite {
    pub at: DateTime<Utc>,
    pub approved: bool,
    pub transaction_id: Option<String>,
    pub error: Option<String>,
    pub exhausted: bool,
}

#[async_trait]
pub trait ObligationStore: Send + Sync {
    /// Due obligations in stable order: oldest `next_due_at` first, id as
    /// tiebreak. `offset` skips rows still inside the due window.
    async fn find_due(
        &self,
        as_of: DateTime<Utc>,
        filter: &DueFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<Obligation>>;

    async fn contract_is_active(&self, contract_id: Uuid) -> anyhow::Result<bool>;

    async fn pause(
        &self,
        obligation_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Writes the period invoice and the advanced due date atomically.
    async fn complete_renewal(
        &self,
        obligation_id: Uuid,
        invoice: NewInvoice,
        next_due_at: DateTime<Utc>,
        processed_at: DateTime<Utc>,
    ) -> anyhow::Result<RenewalWrite>;

    /// Active obligations falling due within `within_days` of `as_of`,
    /// excluding anything already due.
    async fn find_upcoming(
        &self,
        as_of: DateTime<Utc>,
        within_days: i64,
    ) -> anyhow::Result<Vec<Obligation>>;
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Failed invoices still under the attempt ceiling, oldest attempt first.
    async fn find_retryable(&self, max_attempts: i32, limit: i64) -> anyhow::Result<Vec<Invoice>>;

    async fn record_attempt(&self, invoice_id: Uuid, write: &AttemptWrite) -> anyhow::Result<()>;
}

#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Only completed runs suppress a re-run; a failed run may be retried the
    /// same day without `--force`.
    async fn has_run_on(&self, job_name: &str, date: NaiveDate) -> anyhow::Result<bool>;

    async fn record_run(&self, record: &RunRecord) -> anyhow::Result<()>;

    async fn recent_runs(
        &self,
        job_name: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<RunRecord>>;
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomic compare-and-swap: succeeds when no lock row exists or the
    /// existing one is older than `stale_after`.
    async fn try_acquire(
        &self,
        job_name: &str,
        holder_id: &str,
        stale_after: Duration,
    ) -> anyhow::Result<bool>;

    /// Releases only the caller's own lock; a reclaimed lock is left alone.
    async fn release(&self, job_name: &str, holder_id: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait NoticeLog: Send + Sync {
    async fn was_sent(
        &self,
        obligation_id: Uuid,
        due_on: NaiveDate,
        lead_days: i32,
    ) -> anyhow::Result<bool>;

    async fn mark_sent(
        &self,
        obligation_id: Uuid,
        due_on: NaiveDate,
        lead_days: i32,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn attempt_charge(&self, invoice: &Invoice) -> anyhow::Result<ChargeOutcome>;
}

#[async_trait]
pub trait NoticeSink: Send + Sync {
    async fn deliver(&self, notice: Notice) -> anyhow::Result<()>;
}
