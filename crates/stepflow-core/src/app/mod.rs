//! App - アプリケーション層
//!
//! ports と domain を組み合わせてステップを実行する。
//!
//! # 主要コンポーネント
//! - **StepBuilder**: ステップの構築とワイヤリング
//! - **Step**: ハンドラ・リトライ・ミドルウェア・入出力ブローカーの束
//! - **Worker**: receive → hooks → handle → retry → settle のループ
//! - **Registry**: グループ単位の起動・停止・待機
//! - **Settings**: `stepflow.toml` + 環境変数

pub mod builder;
pub mod events;
pub mod registry;
pub mod settings;
pub mod step;
pub mod worker;

pub use self::builder::{DEFAULT_GROUP, StepBuilder};
pub use self::events::{EventBus, EventKind, StepEvent};
pub use self::registry::{JobRow, Registry};
pub use self::settings::{
    BrokerSettings, LogSettings, PublishRetrySettings, SETTINGS_FILE, Settings, WorkerSettings,
};
pub use self::step::{Step, is_empty_body};
pub use self::worker::{Disposition, Worker, WorkerMode};
