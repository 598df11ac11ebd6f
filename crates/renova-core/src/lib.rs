pub mod error;
pub mod models;
pub mod schedule;
pub mod storage;

pub use error::ParseError;
pub use models::{
    BillingFrequency, DueFilter, Escalation, Invoice, InvoiceStatus, JobLock, NewInvoice, Notice,
    NoticeRecord, Obligation, ObligationStatus, RenewalWrite, RunRecord,
};
pub use schedule::{advance_due, eligible_for_retry, escalated_amount, period_start, retry_wait_hours};
pub use storage::{
    AttemptWrite, ChargeOutcome, InvoiceStore, LockStore, NoticeLog, NoticeSink, ObligationStore,
    PaymentGateway, RunLedger,
};
