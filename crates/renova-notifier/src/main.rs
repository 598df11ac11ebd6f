use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use redis::Msg;
use renova_core::Notice;
use renova_platform::{NOTICE_CHANNEL, RedisBus, ServiceConfig, connect_database};
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "renova_notifier=info".to_string()),
        )
        .init();

    let config = ServiceConfig::worker_from_env()?;
    let pool = connect_database(&config.database_url).await?;
    let redis = RedisBus::connect(&config.redis_url)?;

    let mut pubsub = redis.subscribe(NOTICE_CHANNEL).await?;
    let mut messages = pubsub.on_message();

    info!("notifier subscribed to {NOTICE_CHANNEL}");

    loop {
        let msg = messages
            .next()
            .await
            .context("notice stream ended unexpectedly")?;
        if let Err(err) = handle_message(&pool, msg).await {
            error!("failed to deliver notice: {err:#}");
        }
    }
}

async fn handle_message(pool: &PgPool, msg: Msg) -> Result<()> {
    let payload: String = msg.get_payload()?;
    let body: serde_json::Value = serde_json::from_str(&payload)?;
    let notice: Notice = serde_json::from_value(body.clone())?;

    match notice {
        Notice::Renewal {
            obligation_id,
            client_id,
            amount,
            currency,
            due_on,
            lead_days,
            ..
        } => {
            record_delivery(pool, "RENEWAL_NOTICE", obligation_id, None, &body).await?;
            info!(
                "renewal notice delivered: obligation {obligation_id} for client {client_id}, {amount} {currency} due {due_on} ({lead_days}d lead)"
            );
        }
        Notice::PaymentExhausted {
            invoice_id,
            obligation_id,
            attempts,
            ..
        } => {
            record_delivery(pool, "PAYMENT_EXHAUSTED", obligation_id, Some(invoice_id), &body).await?;
            info!(
                "payment-exhausted notice delivered: invoice {invoice_id} after {attempts} attempts"
            );
        }
    }

    Ok(())
}

async fn record_delivery(
    pool: &PgPool,
    kind: &str,
    obligation_id: Uuid,
    invoice_id: Option<Uuid>,
    payload: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO notice_deliveries (id, kind, obligation_id, invoice_id, payload, delivered_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(kind)
    .bind(obligation_id)
    .bind(invoice_id)
    .bind(payload)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}
