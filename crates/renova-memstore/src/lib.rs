use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use renova_core::{
    AttemptWrite, ChargeOutcome, DueFilter, Invoice, InvoiceStatus, InvoiceStore, JobLock,
    LockStore, NewInvoice, Notice, NoticeLog, NoticeRecord, NoticeSink, Obligation,
    ObligationStatus, ObligationStore, PaymentGateway, RenewalWrite, RunLedger, RunRecord,
};
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory implementation of every billing storage trait. Backs the engine
/// tests and local development without a database.
#[derive(Default)]
pub struct MemStore {
    obligations: RwLock<HashMap<Uuid, Obligation>>,
    contracts: RwLock<HashMap<Uuid, bool>>,
    invoices: RwLock<HashMap<Uuid, Invoice>>,
    runs: RwLock<Vec<RunRecord>>,
    locks: RwLock<HashMap<String, JobLock>>,
    notices: RwLock<Vec<NoticeRecord>>,
    renewal_failures: RwLock<HashSet<Uuid>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_obligation(&self, obligation: Obligation) {
        self.contracts
            .write()
            .await
            .entry(obligation.contract_id)
            .or_insert(true);
        self.obligations
            .write()
            .await
            .insert(obligation.id, obligation);
    }

    pub async fn set_contract_active(&self, contract_id: Uuid, active: bool) {
        self.contracts.write().await.insert(contract_id, active);
    }

    pub async fn insert_invoice(&self, invoice: Invoice) {
        self.invoices.write().await.insert(invoice.id, invoice);
    }

    /// Makes the next renewal write for the obligation fail, for exercising
    /// the per-item error path.
    pub async fn fail_renewal_for(&self, obligation_id: Uuid) {
        self.renewal_failures.write().await.insert(obligation_id);
    }

    pub async fn obligation(&self, id: Uuid) -> Option<Obligation> {
        self.obligations.read().await.get(&id).cloned()
    }

    pub async fn invoice(&self, id: Uuid) -> Option<Invoice> {
        self.invoices.read().await.get(&id).cloned()
    }

    pub async fn invoices_for(&self, obligation_id: Uuid) -> Vec<Invoice> {
        self.invoices
            .read()
            .await
            .values()
            .filter(|invoice| invoice.obligation_id == obligation_id)
            .cloned()
            .collect()
    }

    pub async fn all_invoices(&self) -> Vec<Invoice> {
        self.invoices.read().await.values().cloned().collect()
    }

    pub async fn runs(&self) -> Vec<RunRecord> {
        self.runs.read().await.clone()
    }

    pub async fn lock(&self, job_name: &str) -> Option<JobLock> {
        self.locks.read().await.get(job_name).cloned()
    }

    pub async fn notice_records(&self) -> Vec<NoticeRecord> {
        self.notices.read().await.clone()
    }
}

#[async_trait]
impl ObligationStore for MemStore {
    async fn find_due(
        &self,
        as_of: DateTime<Utc>,
        filter: &DueFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<Obligation>> {
        let obligations = self.obligations.read().await;
        let mut due: Vec<Obligation> = obligations
            .values()
            .filter(|o| {
                o.status == ObligationStatus::Active && o.auto_renew && o.next_due_at <= as_of
            })
            .filter(|o| filter.tenant_id.is_none_or(|tenant| o.tenant_id == tenant))
            .filter(|o| filter.due_from.is_none_or(|from| o.next_due_at >= from))
            .cloned()
            .collect();
        due.sort_by(|a, b| (a.next_due_at, a.id).cmp(&(b.next_due_at, b.id)));

        Ok(due
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn contract_is_active(&self, contract_id: Uuid) -> anyhow::Result<bool> {
        Ok(self
            .contracts
            .read()
            .await
            .get(&contract_id)
            .copied()
            .unwrap_or(false))
    }

    async fn pause(
        &self,
        obligation_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut obligations = self.obligations.write().await;
        let obligation = obligations
            .get_mut(&obligation_id)
            .ok_or_else(|| anyhow::anyhow!("obligation {obligation_id} not found"))?;
        obligation.status = ObligationStatus::Paused;
        obligation.pause_reason = Some(reason.to_string());
        obligation.updated_at = at;
        Ok(())
    }

    async fn complete_renewal(
        &self,
        obligation_id: Uuid,
        invoice: NewInvoice,
        next_due_at: DateTime<Utc>,
        processed_at: DateTime<Utc>,
    ) -> anyhow::Result<RenewalWrite> {
        if self.renewal_failures.write().await.remove(&obligation_id) {
            anyhow::bail!("storage failure writing renewal for {obligation_id}");
        }

        let mut invoices = self.invoices.write().await;
        let already_billed = invoices
            .values()
            .any(|i| i.obligation_id == obligation_id && i.period_start == invoice.period_start);

        let write = if already_billed {
            RenewalWrite::AlreadyBilled
        } else {
            let id = invoice.id;
            invoices.insert(
                id,
                Invoice {
                    id,
                    obligation_id: invoice.obligation_id,
                    period_start: invoice.period_start,
                    amount: invoice.amount,
                    currency: invoice.currency,
                    status: InvoiceStatus::Pending,
                    due_at: invoice.due_at,
                    payment_attempts: 0,
                    last_payment_attempt_at: None,
                    payment_ref: None,
                    failure_reason: None,
                    created_at: processed_at,
                    updated_at: processed_at,
                },
            );
            RenewalWrite::Invoiced(id)
        };

        let mut obligations = self.obligations.write().await;
        let obligation = obligations
            .get_mut(&obligation_id)
            .ok_or_else(|| anyhow::anyhow!("obligation {obligation_id} not found"))?;
        obligation.next_due_at = next_due_at;
        obligation.last_processed_at = Some(processed_at);
        obligation.updated_at = processed_at;

        Ok(write)
    }

    async fn find_upcoming(
        &self,
        as_of: DateTime<Utc>,
        within_days: i64,
    ) -> anyhow::Result<Vec<Obligation>> {
        let horizon = as_of + Duration::days(within_days);
        let obligations = self.obligations.read().await;
        let mut upcoming: Vec<Obligation> = obligations
            .values()
            .filter(|o| {
                o.status == ObligationStatus::Active
                    && o.next_due_at > as_of
                    && o.next_due_at <= horizon
            })
            .cloned()
            .collect();
        upcoming.sort_by(|a, b| (a.next_due_at, a.id).cmp(&(b.next_due_at, b.id)));
        Ok(upcoming)
    }
}

#[async_trait]
impl InvoiceStore for MemStore {
    async fn find_retryable(&self, max_attempts: i32, limit: i64) -> anyhow::Result<Vec<Invoice>> {
        let invoices = self.invoices.read().await;
        let mut retryable: Vec<Invoice> = invoices
            .values()
            .filter(|i| i.status == InvoiceStatus::Failed && i.payment_attempts < max_attempts)
            .cloned()
            .collect();
        retryable.sort_by(|a, b| (a.last_payment_attempt_at, a.id).cmp(&(b.last_payment_attempt_at, b.id)));
        Ok(retryable.into_iter().take(limit.max(0) as usize).collect())
    }

    async fn record_attempt(&self, invoice_id: Uuid, write: &AttemptWrite) -> anyhow::Result<()> {
        let mut invoices = self.invoices.write().await;
        let invoice = invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| anyhow::anyhow!("invoice {invoice_id} not found"))?;
        invoice.payment_attempts += 1;
        invoice.last_payment_attempt_at = Some(write.at);
        invoice.updated_at = write.at;
        if write.approved {
            invoice.status = InvoiceStatus::Paid;
            invoice.payment_ref = write.transaction_id.clone();
            invoice.failure_reason = None;
        } else {
            invoice.status = if write.exhausted {
                InvoiceStatus::Overdue
            } else {
                InvoiceStatus::Failed
            };
            invoice.failure_reason = write.error.clone();
        }
        Ok(())
    }
}

#[async_trait]
impl RunLedger for MemStore {
    async fn has_run_on(&self, job_name: &str, date: NaiveDate) -> anyhow::Result<bool> {
        Ok(self.runs.read().await.iter().any(|r| {
            r.job_name == job_name && r.run_date == date && r.status == "COMPLETED"
        }))
    }

    async fn record_run(&self, record: &RunRecord) -> anyhow::Result<()> {
        let mut runs = self.runs.write().await;
        if let Some(existing) = runs
            .iter_mut()
            .find(|r| r.job_name == record.job_name && r.run_date == record.run_date)
        {
            *existing = record.clone();
        } else {
            runs.push(record.clone());
        }
        Ok(())
    }

    async fn recent_runs(
        &self,
        job_name: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<RunRecord>> {
        let runs = self.runs.read().await;
        let mut matching: Vec<RunRecord> = runs
            .iter()
            .filter(|r| job_name.is_none_or(|name| r.job_name == name))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(matching.into_iter().take(limit.max(0) as usize).collect())
    }
}

#[async_trait]
impl LockStore for MemStore {
    async fn try_acquire(
        &self,
        job_name: &str,
        holder_id: &str,
        stale_after: Duration,
    ) -> anyhow::Result<bool> {
        let now = Utc::now();
        let mut locks = self.locks.write().await;
        if let Some(existing) = locks.get(job_name) {
            if !existing.is_stale(now, stale_after) {
                return Ok(false);
            }
        }
        locks.insert(
            job_name.to_string(),
            JobLock {
                job_name: job_name.to_string(),
                holder_id: holder_id.to_string(),
                acquired_at: now,
            },
        );
        Ok(true)
    }

    async fn release(&self, job_name: &str, holder_id: &str) -> anyhow::Result<()> {
        let mut locks = self.locks.write().await;
        if locks
            .get(job_name)
            .is_some_and(|lock| lock.holder_id == holder_id)
        {
            locks.remove(job_name);
        }
        Ok(())
    }
}

#[async_trait]
impl NoticeLog for MemStore {
    async fn was_sent(
        &self,
        obligation_id: Uuid,
        due_on: NaiveDate,
        lead_days: i32,
    ) -> anyhow::Result<bool> {
        Ok(self.notices.read().await.iter().any(|n| {
            n.obligation_id == obligation_id && n.due_on == due_on && n.lead_days == lead_days
        }))
    }

    async fn mark_sent(
        &self,
        obligation_id: Uuid,
        due_on: NaiveDate,
        lead_days: i32,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut notices = self.notices.write().await;
        let exists = notices.iter().any(|n| {
            n.obligation_id == obligation_id && n.due_on == due_on && n.lead_days == lead_days
        });
        if !exists {
            notices.push(NoticeRecord {
                obligation_id,
                due_on,
                lead_days,
                sent_at: at,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub enum GatewayMode {
    #[default]
    Approve,
    Decline(String),
    Unreachable(String),
}

/// Payment gateway fake: records every capture attempt and answers according
/// to the configured mode.
#[derive(Default)]
pub struct RecordingGateway {
    mode: RwLock<GatewayMode>,
    charges: RwLock<Vec<Uuid>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_mode(&self, mode: GatewayMode) {
        *self.mode.write().await = mode;
    }

    pub async fn charges(&self) -> Vec<Uuid> {
        self.charges.read().await.clone()
    }
}

#[async_trait]
impl PaymentGateway for RecordingGateway {
    async fn attempt_charge(&self, invoice: &Invoice) -> anyhow::Result<ChargeOutcome> {
        self.charges.write().await.push(invoice.id);
        match self.mode.read().await.clone() {
            GatewayMode::Approve => Ok(ChargeOutcome {
                approved: true,
                transaction_id: Some(format!("txn-{}", invoice.id)),
                error: None,
            }),
            GatewayMode::Decline(reason) => Ok(ChargeOutcome {
                approved: false,
                transaction_id: None,
                error: Some(reason),
            }),
            GatewayMode::Unreachable(reason) => anyhow::bail!(reason),
        }
    }
}

/// Notice sink fake that collects everything delivered.
#[derive(Default)]
pub struct RecordingSink {
    delivered: RwLock<Vec<Notice>>,
    failing: RwLock<bool>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_failing(&self, failing: bool) {
        *self.failing.write().await = failing;
    }

    pub async fn delivered(&self) -> Vec<Notice> {
        self.delivered.read().await.clone()
    }
}

#[async_trait]
impl NoticeSink for RecordingSink {
    async fn deliver(&self, notice: Notice) -> anyhow::Result<()> {
        if *self.failing.read().await {
            anyhow::bail!("notice sink unavailable");
        }
        self.delivered.write().await.push(notice);
        Ok(())
    }
}
