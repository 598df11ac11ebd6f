use anyhow::Result;
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::PubSub};
use renova_core::{Notice, NoticeSink};
use serde::Serialize;

use crate::contracts::NOTICE_CHANNEL;

#[derive(Clone)]
pub struct RedisBus {
    client: Client,
}

impl RedisBus {
    pub fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        Ok(Self { client })
    }

    pub async fn publish_json<T: Serialize>(&self, channel: &str, payload: &T) -> Result<()> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(payload)?;
        let _: i64 = connection.publish(channel, serialized).await?;
        Ok(())
    }

    pub async fn subscribe(&self, channel: &str) -> Result<PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(pubsub)
    }
}

/// Hands notices to the delivery worker over the bus. Fire-and-forget from
/// the engine's side.
pub struct RedisNoticeSink {
    bus: RedisBus,
}

impl RedisNoticeSink {
    pub fn new(bus: RedisBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl NoticeSink for RedisNoticeSink {
    async fn deliver(&self, notice: Notice) -> Result<()> {
        self.bus.publish_json(NOTICE_CHANNEL, &notice).await
    }
}
