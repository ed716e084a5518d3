//! DispatchLedger port - 副作用の実行記録
//!
//! consumer 側のトランザクションは ledger と outbox の両方に触れるため、
//! この trait の各メソッドが 1 トランザクションに対応します。
//!
//! # フロー
//! 1. `reserve`   (tx1): insert-if-absent + status 読み出し。Sent なら outbox を Confirmed に
//! 2. executor 呼び出し（トランザクション外）
//! 3. `finalize`  (tx2): Reserved -> Sent + outbox Confirmed

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{DispatchRecord, OutboxId, Reservation, StoreResult};

#[async_trait]
pub trait DispatchLedger: Send + Sync {
    /// レコードが無ければ `Reserved` で挿入し、現在の状態を返す。
    /// 既に `Sent` なら同じトランザクションで outbox 行を confirm する。
    /// outbox 行が無い id は `StoreError::NotFound`。
    async fn reserve(&self, id: OutboxId, now: DateTime<Utc>) -> StoreResult<Reservation>;

    /// レコードを `Sent`、outbox 行を `Confirmed` にアトミックに更新する
    async fn finalize(&self, id: OutboxId, effect_id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// executor が恒久的に拒否した payload の outbox 行を confirm する。
    /// ledger レコードは `Reserved` のまま（何も送っていない）。
    async fn confirm_rejected(&self, id: OutboxId, reason: &str, at: DateTime<Utc>)
    -> StoreResult<()>;

    async fn dispatch_record(&self, id: OutboxId) -> StoreResult<Option<DispatchRecord>>;
}
