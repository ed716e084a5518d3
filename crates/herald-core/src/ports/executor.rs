//! SideEffectExecutor port - 外部への通知（副作用）
//!
//! # 契約
//! - 同じ id で複数回呼ばれても安全であること（ledger の dedup が第一層、
//!   executor が下流に渡す安定 ID が第二層）
//! - 検証エラーは panic せず `ExecutionError::Permanent` を返す

use async_trait::async_trait;

use crate::domain::{ExecutionError, OutboxId};

#[async_trait]
pub trait SideEffectExecutor: Send + Sync {
    /// `id` の副作用を実行し、下流の effect id を返す
    async fn execute(&self, id: OutboxId, payload: &[u8]) -> Result<String, ExecutionError>;
}
