use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const NOTICE_CHANNEL: &str = "billing.notices";
pub const RUN_CHANNEL: &str = "billing.runs";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletedEvent {
    pub job_name: String,
    pub run_date: NaiveDate,
    pub status: String,
    pub summary: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseObligationRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObligationStatusResponse {
    pub obligation_id: Uuid,
    pub status: String,
    pub pause_reason: Option<String>,
    pub next_due_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
