//! stepflow-core
//!
//! A message-driven step pipeline: steps consume messages from brokers,
//! run user code, and forward results to other brokers.
//!
//! # モジュール構成
//! - **domain**: メッセージ、失敗シグナル、リトライポリシー、バックオフ
//! - **ports**: Broker / Middleware / StepHandler の抽象
//! - **impls**: メモリ・cron・webhook ブローカー、dedup・config ミドルウェア
//! - **app**: Step、Worker、Registry、Settings、イベント
//! - **schedule**: cron 式の解決と発火時刻の計算
//! - **observability**: ログ初期化

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod schedule;

pub use app::{Registry, Settings, Step, StepBuilder, Worker, WorkerMode};
pub use domain::{Extra, Message, RetryStatus, StepError};
pub use error::{BrokerError, CronError, SetupError, StepflowError};
pub use ports::{Broker, BrokerExt, BrokerOptions, Middleware, StepHandler, StepOutput};
