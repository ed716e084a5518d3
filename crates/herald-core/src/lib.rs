//! herald-core
//!
//! Transactional outbox relay with idempotent dispatch.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, outbox event, dispatch record, broker message, backoff, errors）
//! - **ports**: 抽象化レイヤー（OutboxStore, DispatchLedger, BrokerProducer/Consumer, SideEffectExecutor, Clock）
//! - **app**: アプリケーションロジック（producer_loop, consumer_loop, reaper_loop, supervisor, builder）
//! - **impls**: 実装（InMemoryStore, SqliteStore, InMemoryBroker, NotificationExecutor）
//! - **config**: 設定の読み込みと検証

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
