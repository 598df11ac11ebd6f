use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ObligationStatus {
    Active,
    Paused,
    Cancelled,
}

impl ObligationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationStatus::Active => "ACTIVE",
            ObligationStatus::Paused => "PAUSED",
            ObligationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ParseError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(ObligationStatus::Active),
            "PAUSED" => Ok(ObligationStatus::Paused),
            "CANCELLED" => Ok(ObligationStatus::Cancelled),
            other => Err(ParseError::ObligationStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BillingFrequency {
    Monthly,
    Quarterly,
    SemiAnnual,
    Annual,
}

impl BillingFrequency {
    pub fn months(&self) -> u32 {
        match self {
            BillingFrequency::Monthly => 1,
            BillingFrequency::Quarterly => 3,
            BillingFrequency::SemiAnnual => 6,
            BillingFrequency::Annual => 12,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingFrequency::Monthly => "MONTHLY",
            BillingFrequency::Quarterly => "QUARTERLY",
            BillingFrequency::SemiAnnual => "SEMIANNUAL",
            BillingFrequency::Annual => "ANNUAL",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ParseError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "MONTHLY" => Ok(BillingFrequency::Monthly),
            "QUARTERLY" => Ok(BillingFrequency::Quarterly),
            "SEMIANNUAL" => Ok(BillingFrequency::SemiAnnual),
            "ANNUAL" => Ok(BillingFrequency::Annual),
            other => Err(ParseError::Frequency(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Escalation {
    None,
    Percent(Decimal),
    Fixed(Decimal),
}

impl Escalation {
    pub fn as_parts(&self) -> (&'static str, Decimal) {
        match self {
            Escalation::None => ("NONE", Decimal::ZERO),
            Escalation::Percent(rate) => ("PERCENT", *rate),
            Escalation::Fixed(amount) => ("FIXED", *amount),
        }
    }

    pub fn from_parts(kind: &str, value: Decimal) -> Result<Self, ParseError> {
        match kind.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(Escalation::None),
            "PERCENT" => Ok(Escalation::Percent(value)),
            "FIXED" => Ok(Escalation::Fixed(value)),
            other => Err(ParseError::Escalation(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Obligation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub contract_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub frequency: BillingFrequency,
    pub escalation: Escalation,
    pub next_due_at: DateTime<Utc>,
    pub status: ObligationStatus,
    pub auto_renew: bool,
    pub pause_reason: Option<String>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Failed,
    Overdue,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Failed => "FAILED",
            InvoiceStatus::Overdue => "OVERDUE",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ParseError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(InvoiceStatus::Pending),
            "PAID" => Ok(InvoiceStatus::Paid),
            "FAILED" => Ok(InvoiceStatus::Failed),
            "OVERDUE" => Ok(InvoiceStatus::Overdue),
            other => Err(ParseError::InvoiceStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub obligation_id: Uuid,
    pub period_start: NaiveDate,
    pub amount: Decimal,
    pub currency: String,
    pub status: InvoiceStatus,
    pub due_at: DateTime<Utc>,
    pub payment_attempts: i32,
    pub last_payment_attempt_at: Option<DateTime<Utc>>,
    pub payment_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoice {
    pub id: Uuid,
    pub obligation_id: Uuid,
    pub period_start: NaiveDate,
    pub amount: Decimal,
    pub currency: String,
    pub due_at: DateTime<Utc>,
}

/// Outcome of the obligation-scoped renewal write. An invoice that already
/// exists for the billing period is not an error: the due date is still
/// advanced so a crashed run converges on re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalWrite {
    Invoiced(Uuid),
    AlreadyBilled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub job_name: String,
    pub run_date: NaiveDate,
    pub status: String,
    pub results: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLock {
    pub job_name: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
}

impl JobLock {
    pub fn is_stale(&self, as_of: DateTime<Utc>, stale_after: Duration) -> bool {
        as_of - self.acquired_at >= stale_after
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeRecord {
    pub obligation_id: Uuid,
    pub due_on: NaiveDate,
    pub lead_days: i32,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Notice {
    Renewal {
        obligation_id: Uuid,
        tenant_id: Uuid,
        client_id: Uuid,
        amount: Decimal,
        currency: String,
        due_on: NaiveDate,
        lead_days: i32,
    },
    PaymentExhausted {
        invoice_id: Uuid,
        obligation_id: Uuid,
        amount: Decimal,
        currency: String,
        attempts: i32,
    },
}

#[derive(Debug, Clone, Default)]
pub struct DueFilter {
    pub tenant_id: Option<Uuid>,
    pub due_from: Option<DateTime<Utc>>,
}
