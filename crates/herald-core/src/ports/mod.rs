//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（RDB, ブローカー, メール送信）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - RDB（outbox + dispatch ledger）が正本（source of truth）
//! - ブローカーは at-least-once の配送路に過ぎない
//! - 2 つのループの間に共有メモリはない。調整は行ロックとメッセージのみ

pub mod broker;
pub mod clock;
pub mod dispatch_ledger;
pub mod executor;
pub mod id_generator;
pub mod mail;
pub mod outbox_store;

pub use self::broker::{BrokerConsumer, BrokerProducer};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dispatch_ledger::DispatchLedger;
pub use self::executor::SideEffectExecutor;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::mail::{MailSettings, MailTransport, OutgoingMail, TransportSecurity};
pub use self::outbox_store::OutboxStore;
