//! ConsumerLoop - 冪等ディスパッチ
//!
//! # フロー（メッセージ 1 件ごと）
//! 1. header `outbox-id` を読む。無い・壊れている → commit せずスキップ（次の poll で再提示）
//!    outbox に行が無い id も同じ扱い（ledger には何も書かない）
//! 2. tx1 `reserve()`: ledger に Reserved を insert-if-absent
//!    - Sent なら再配送。outbox を Confirmed にして offset を commit、executor は呼ばない
//! 3. executor 呼び出し（トランザクション外）
//!    - 成功: tx2 `finalize()`（Sent + Confirmed）→ offset commit
//!    - Permanent: outbox を Confirmed（last_error に理由）→ offset commit。ledger は Reserved のまま
//!    - Transient: 何も確定しない。offset も commit しない
//!
//! # 既知のギャップ
//! executor 成功後、tx2 の前にクラッシュすると再配送で executor がもう一度呼ばれる。
//! executor が id を埋め込んだ安定 ID を下流に渡すことで重複を抑える。

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::domain::{Delivery, ExecutionError, HeraldError, OutboxId, Reservation, StoreError};
use crate::ports::{BrokerConsumer, Clock, DispatchLedger, SideEffectExecutor};

/// 1 メッセージの処理結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// executor 実行済み。ledger は `Sent`、offset も commit 済み
    Dispatched { id: OutboxId, effect_id: String },
    /// 既に `Sent`。executor は動かさず confirm と commit だけ行った
    Deduplicated { id: OutboxId },
    /// executor が恒久的に拒否。confirm と commit は行う
    Rejected { id: OutboxId, reason: String },
    /// 一時的な失敗。commit しない
    Deferred { id: OutboxId, reason: String },
    /// `outbox-id` ヘッダが無いか壊れている。commit しない
    MissingKey,
    /// ヘッダの id に対応する outbox 行が無い。reserve も commit もしない
    UnknownEvent { id: OutboxId },
}

impl DispatchOutcome {
    /// broker の offset を進めたか
    pub fn committed(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::Dispatched { .. }
                | DispatchOutcome::Deduplicated { .. }
                | DispatchOutcome::Rejected { .. }
        )
    }
}

pub struct ConsumerLoop {
    consumer: Arc<dyn BrokerConsumer>,
    ledger: Arc<dyn DispatchLedger>,
    executor: Arc<dyn SideEffectExecutor>,
    clock: Arc<dyn Clock>,
    config: ConsumerConfig,
}

impl ConsumerLoop {
    pub fn new(
        consumer: Arc<dyn BrokerConsumer>,
        ledger: Arc<dyn DispatchLedger>,
        executor: Arc<dyn SideEffectExecutor>,
        clock: Arc<dyn Clock>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            consumer,
            ledger,
            executor,
            clock,
            config,
        }
    }

    /// 配送された 1 メッセージを処理する
    pub async fn handle(&self, delivery: &Delivery) -> Result<DispatchOutcome, HeraldError> {
        let partition = delivery.position.partition;
        let offset = delivery.position.offset;

        let id = match delivery.message.outbox_id() {
            Some(Ok(id)) => id,
            Some(Err(e)) => {
                warn!(partition, offset, error = %e, "Unparseable outbox-id header, leaving uncommitted");
                return Ok(DispatchOutcome::MissingKey);
            }
            None => {
                warn!(partition, offset, "Message without outbox-id header, leaving uncommitted");
                return Ok(DispatchOutcome::MissingKey);
            }
        };

        let reservation = match self.ledger.reserve(id, self.clock.now()).await {
            Ok(reservation) => reservation,
            Err(StoreError::NotFound(_)) => {
                warn!(outbox_id = %id, partition, offset, "No outbox row for message, leaving uncommitted");
                return Ok(DispatchOutcome::UnknownEvent { id });
            }
            Err(e) => return Err(e.into()),
        };

        if let Reservation::AlreadySent { effect_id } = reservation {
            self.consumer.commit(delivery).await?;
            info!(
                outbox_id = %id,
                partition,
                offset,
                effect_id = effect_id.as_deref().unwrap_or(""),
                "Redelivered message already sent, confirmed without re-executing"
            );
            return Ok(DispatchOutcome::Deduplicated { id });
        }

        match self.executor.execute(id, &delivery.message.value).await {
            Ok(effect_id) => {
                self.ledger
                    .finalize(id, &effect_id, self.clock.now())
                    .await?;
                self.consumer.commit(delivery).await?;
                info!(outbox_id = %id, partition, offset, effect_id = %effect_id, "Dispatched");
                Ok(DispatchOutcome::Dispatched { id, effect_id })
            }
            Err(ExecutionError::Permanent(reason)) => {
                self.ledger
                    .confirm_rejected(id, &reason, self.clock.now())
                    .await?;
                self.consumer.commit(delivery).await?;
                warn!(outbox_id = %id, partition, offset, reason = %reason, "Payload rejected, confirmed without sending");
                Ok(DispatchOutcome::Rejected { id, reason })
            }
            Err(ExecutionError::Transient(reason)) => {
                warn!(outbox_id = %id, partition, offset, reason = %reason, "Dispatch deferred, leaving uncommitted");
                Ok(DispatchOutcome::Deferred { id, reason })
            }
        }
    }

    /// 1 回 poll して届いたものを処理する
    pub async fn run_once(&self) -> Result<Option<DispatchOutcome>, HeraldError> {
        match self.consumer.poll(self.config.poll_timeout).await? {
            Some(delivery) => self.handle(&delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// `shutdown` が true になる（または sender が drop される）まで consume する。
    /// 処理中のメッセージは必ず最後まで終える。
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), HeraldError> {
        info!(topic = %self.config.topic, "Consumer loop started");

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let polled = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                polled = self.consumer.poll(self.config.poll_timeout) => polled,
            };

            let outcome = match polled {
                Ok(Some(delivery)) => self.handle(&delivery).await,
                Ok(None) => continue,
                Err(e) => Err(e.into()),
            };

            let pause = match outcome {
                Ok(outcome) if outcome.committed() => {
                    debug!(?outcome, "Message handled");
                    false
                }
                Ok(_) => true,
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Consumer loop stopping");
                    break Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Consumer cycle failed, message will be presented again");
                    true
                }
            };

            if pause {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break Ok(());
                        }
                    }
                    _ = tokio::time::sleep(self.config.error_pause) => {}
                }
            }
        };

        info!("Consumer loop stopped");
        result
    }
}
