//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **MemoryBroker**: プロセス内 FIFO（開発・テスト用）
//! - **CronBroker**: cron スケジュールで固定 body を publish
//! - **WebhookBroker**: 外部ペイロードの受け口
//! - **UniqueMiddleware** / **ConfigMiddleware**: 標準ミドルウェア

pub mod config;
pub mod cron;
pub mod memory;
pub mod unique;
pub mod webhook;

pub use self::config::{ConfigMiddleware, ConfigScope, ConfigSource, MemoryConfigSource};
pub use self::cron::CronBroker;
pub use self::memory::{MemoryBroker, MemoryPublisher, MemorySource};
pub use self::unique::{MemorySeenStore, SeenStore, UniqueMiddleware, body_hash};
pub use self::webhook::WebhookBroker;
