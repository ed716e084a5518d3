//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryStore**: 開発・テスト用の outbox + dispatch ledger
//! - **SqliteStore**: rusqlite による永続版
//! - **InMemoryBroker**: 分割ログを模したブローカー（障害注入つき）
//! - **NotificationExecutor**: メール通知の SideEffectExecutor（LogTransport / RecordingTransport）
//!
//! 実ブローカー（Kafka など）や SMTP クライアントは外部コラボレーターです。
//! ports の trait を実装すればループ側の変更なしに差し替えられます。

pub mod memory_broker;
pub mod memory_store;
pub mod notification;
pub mod sqlite;

pub use self::memory_broker::{InMemoryBroker, InMemoryConsumer};
pub use self::memory_store::InMemoryStore;
pub use self::notification::{LogTransport, NotificationExecutor, RecordingTransport};
pub use self::sqlite::SqliteStore;
