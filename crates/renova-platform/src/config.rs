use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub redis_url: String,
    pub http_addr: String,
}

impl ServiceConfig {
    pub fn from_env(default_http_addr: &str) -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is required")?;
        let http_addr =
            std::env::var("HTTP_ADDR").unwrap_or_else(|_| default_http_addr.to_string());

        Ok(Self {
            database_url,
            redis_url,
            http_addr,
        })
    }

    pub fn worker_from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is required")?;

        Ok(Self {
            database_url,
            redis_url,
            http_addr: String::new(),
        })
    }
}

/// Tuning knobs for the billing jobs, all optional in the environment.
#[derive(Clone, Debug)]
pub struct BillingConfig {
    pub batch_size: i64,
    pub max_attempts: i32,
    pub lock_stale_hours: i64,
    pub lead_days: Vec<i32>,
    pub failure_threshold: f64,
}

impl BillingConfig {
    pub fn from_env() -> Result<Self> {
        let lead_days_raw = std::env::var("BILLING_NOTICE_LEAD_DAYS")
            .unwrap_or_else(|_| "90,60,30".to_string());

        Ok(Self {
            batch_size: env_or("BILLING_BATCH_SIZE", 500)?,
            max_attempts: env_or("BILLING_MAX_PAYMENT_ATTEMPTS", 3)?,
            lock_stale_hours: env_or("BILLING_LOCK_STALE_HOURS", 4)?,
            lead_days: parse_lead_days(&lead_days_raw)?,
            failure_threshold: env_or("BILLING_FAILURE_THRESHOLD", 0.10)?,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} is not a valid value: {raw}")),
        Err(_) => Ok(default),
    }
}

fn parse_lead_days(raw: &str) -> Result<Vec<i32>> {
    let days = raw
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<i32>()
                .with_context(|| format!("invalid lead day: {part}"))
        })
        .collect::<Result<Vec<i32>>>()?;
    if days.is_empty() || days.iter().any(|d| *d <= 0) {
        anyhow::bail!("BILLING_NOTICE_LEAD_DAYS must be positive day counts");
    }
    Ok(days)
}
