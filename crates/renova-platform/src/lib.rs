pub mod config;
pub mod contracts;
pub mod db;
pub mod pg;
pub mod redis_bus;

pub use config::{BillingConfig, ServiceConfig};
pub use contracts::{
    NOTICE_CHANNEL, ObligationStatusResponse, PauseObligationRequest, RUN_CHANNEL,
    RunCompletedEvent,
};
pub use db::connect_database;
pub use pg::{BalanceGateway, PgStore};
pub use redis_bus::{RedisBus, RedisNoticeSink};
