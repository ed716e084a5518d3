//! OutboxStore port - outbox テーブル（正本 / source of truth）
//!
//! # 設計原則
//! - 各操作は単一のローカルトランザクション（途中状態を外に見せない）
//! - claim は行単位の排他。ロック中の行は待たずにスキップする
//! - リトライ状態（attempt_count, next_attempt_at）は行に持たせ、メモリには持たない
//!
//! # 実装
//! - `InMemoryStore`（開発・テスト用）
//! - `SqliteStore`（rusqlite）

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::app::status::OutboxCounts;
use crate::domain::{NewOutboxEvent, OutboxEvent, OutboxId, StoreResult};

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// 新しい `Pending` イベントを即時実行可能として記録する。
    /// 通常は上流の writer が業務データの変更と同じトランザクションで行う。
    async fn insert(&self, event: NewOutboxEvent, now: DateTime<Utc>) -> StoreResult<OutboxEvent>;

    /// 期限の来た行を `created_at` の古い順に最大 `limit` 件 claim する
    ///
    /// - 選ばれた行は 1 トランザクションで `Producing` になり、`attempt_count` +1、`last_error` クリア
    /// - 並行する claimer が保持中の行はスキップ。同じ行が 2 者に渡ることはない
    async fn claim_batch(&self, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<OutboxEvent>>;

    /// `Producing -> Produced`。broker 上の位置を記録する
    async fn mark_produced(
        &self,
        id: OutboxId,
        partition: i32,
        offset: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// `Producing -> Error`。次回試行時刻を設定する
    async fn mark_failed(
        &self,
        id: OutboxId,
        reason: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// `claimed_before` より前から `Producing` のままの行を `Error`（即時再試行可）へ戻し、
    /// 戻した id を返す
    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<OutboxId>>;

    async fn get(&self, id: OutboxId) -> StoreResult<Option<OutboxEvent>>;

    async fn counts(&self) -> StoreResult<OutboxCounts>;
}
