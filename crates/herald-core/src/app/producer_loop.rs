//! ProducerLoop - outbox の行をブローカーへ publish する
//!
//! # フロー
//! 1. `OutboxStore::claim_batch()` で期限の来た行を claim（Producing へ）
//! 2. 1 行ずつ `BrokerMessage`（key = partition_key, header `outbox-id`）にして publish
//! 3. 成功: `mark_produced()` で partition/offset を記録
//! 4. 失敗: `mark_failed()` で backoff を設定し、バッチの残りは打ち切る
//!    （残りは "batch aborted" として Error に戻し、すぐ再 claim 可能にする）
//! 5. 一定時間 idle して次のサイクルへ
//!
//! 複数インスタンスを同時に動かしてよい。排他は claim の行ロックだけが担う。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ProducerConfig;
use crate::domain::{
    BackoffPolicy, BrokerError, BrokerMessage, ErrorKind, HeraldError, OutboxEvent,
};
use crate::ports::{BrokerProducer, Clock, OutboxStore};

pub const BATCH_ABORTED: &str = "batch aborted";

/// 1 サイクルの結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProduceReport {
    pub claimed: usize,
    pub produced: usize,
    pub failed: usize,
    /// 先行する publish の失敗で、未送信のまま Error に戻した行
    pub released: usize,
}

pub struct ProducerLoop {
    instance: usize,
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn BrokerProducer>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    config: ProducerConfig,
}

impl ProducerLoop {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn BrokerProducer>,
        clock: Arc<dyn Clock>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            instance: 0,
            store,
            broker,
            clock,
            backoff: config.backoff(),
            config,
        }
    }

    /// 複数インスタンス時のログ用ラベル
    pub fn with_instance(mut self, instance: usize) -> Self {
        self.instance = instance;
        self
    }

    /// claim → publish を 1 サイクル実行
    pub async fn run_once(&self) -> Result<ProduceReport, HeraldError> {
        let now = self.clock.now();
        let batch = self.store.claim_batch(self.config.batch_size, now).await?;
        let mut report = ProduceReport {
            claimed: batch.len(),
            ..ProduceReport::default()
        };

        let mut rows = batch.into_iter();
        while let Some(event) = rows.next() {
            let message = BrokerMessage::from_event(&event);
            match self.broker.publish(&event.topic, message).await {
                Ok(position) => {
                    let at = self.clock.now();
                    match self
                        .store
                        .mark_produced(event.id, position.partition, position.offset, at)
                        .await
                    {
                        Ok(()) => {}
                        // The row moved on without us (reaped, or confirmed and then
                        // re-claimed); the broker has the message either way.
                        Err(e) if e.kind() == ErrorKind::Permanent => {
                            warn!(outbox_id = %event.id, error = %e, "Could not record publish");
                        }
                        Err(e) => return Err(e.into()),
                    }
                    report.produced += 1;
                    debug!(
                        instance = self.instance,
                        outbox_id = %event.id,
                        topic = %event.topic,
                        partition = position.partition,
                        offset = position.offset,
                        attempt = event.attempt_count,
                        "Published outbox event"
                    );
                }
                Err(publish_err) => {
                    self.fail(&event, &publish_err).await?;
                    report.failed += 1;

                    let released_at = self.clock.now();
                    for rest in rows.by_ref() {
                        if self.release(&rest, BATCH_ABORTED, released_at).await? {
                            report.released += 1;
                        }
                    }
                    if report.released > 0 {
                        debug!(
                            instance = self.instance,
                            released = report.released,
                            "Released rest of aborted batch"
                        );
                    }

                    if publish_err.kind() == ErrorKind::Infrastructure {
                        return Err(publish_err.into());
                    }
                    break;
                }
            }
        }

        Ok(report)
    }

    async fn fail(&self, event: &OutboxEvent, err: &BrokerError) -> Result<(), HeraldError> {
        let retry_at = self
            .backoff
            .next_attempt_at(self.clock.now(), event.attempt_count);
        self.release(event, &err.to_string(), retry_at).await?;
        warn!(
            instance = self.instance,
            outbox_id = %event.id,
            attempt = event.attempt_count,
            retry_at = %retry_at,
            error = %err,
            "Publish failed, aborting batch"
        );
        Ok(())
    }

    /// claim した行を Error に戻す。行が既に他者に動かされていたら（reap 済みなど）
    /// warn だけ出して `false` を返し、残りの解放は続ける。
    async fn release(
        &self,
        event: &OutboxEvent,
        reason: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool, HeraldError> {
        match self.store.mark_failed(event.id, reason, next_attempt_at).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::Permanent => {
                warn!(
                    instance = self.instance,
                    outbox_id = %event.id,
                    error = %e,
                    "Row moved on before it could be released"
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `shutdown` が true になる（または sender が drop される）までサイクルを回し、
    /// 最後に `flush_timeout` で flush する。Err はインフラ障害のときだけ。
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), HeraldError> {
        info!(instance = self.instance, "Producer loop started");

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            match self.run_once().await {
                Ok(report) if report.claimed > 0 => info!(
                    instance = self.instance,
                    claimed = report.claimed,
                    produced = report.produced,
                    failed = report.failed,
                    released = report.released,
                    "Producer cycle finished"
                ),
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(instance = self.instance, error = %e, "Producer loop stopping");
                    break Err(e);
                }
                Err(e) => {
                    warn!(instance = self.instance, error = %e, "Producer cycle failed, retrying next cycle");
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        };

        if let Err(e) = self.broker.flush(self.config.flush_timeout).await {
            warn!(instance = self.instance, error = %e, "Flush on shutdown failed");
        }
        info!(instance = self.instance, "Producer loop stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewOutboxEvent, OutboxId, OutboxStatus, OUTBOX_ID_HEADER};
    use crate::impls::{InMemoryBroker, InMemoryStore};
    use crate::ports::FixedClock;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use tokio::sync::Mutex;
    use ulid::Ulid;

    use crate::domain::BrokerPosition;

    /// publish を失敗させる前に、reaper と同じく行を Error に戻してしまう
    struct ReapingBroker {
        store: InMemoryStore,
        at: DateTime<Utc>,
    }

    #[async_trait]
    impl BrokerProducer for ReapingBroker {
        async fn publish(&self, _topic: &str, message: BrokerMessage) -> Result<BrokerPosition, BrokerError> {
            let id = message.outbox_id().unwrap().unwrap();
            self.store.mark_failed(id, "claim expired", self.at).await.unwrap();
            Err(BrokerError::Transport("ack timed out".into()))
        }

        async fn flush(&self, _timeout: std::time::Duration) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[derive(Clone)]
    struct RecordingBroker {
        inner: InMemoryBroker,
        flushes: Arc<Mutex<Vec<std::time::Duration>>>,
    }

    #[async_trait]
    impl BrokerProducer for RecordingBroker {
        async fn publish(&self, topic: &str, message: BrokerMessage) -> Result<BrokerPosition, BrokerError> {
            self.inner.publish(topic, message).await
        }

        async fn flush(&self, timeout: std::time::Duration) -> Result<(), BrokerError> {
            self.flushes.lock().await.push(timeout);
            self.inner.flush(timeout).await
        }
    }

    struct Harness {
        store: InMemoryStore,
        broker: InMemoryBroker,
        clock: Arc<FixedClock>,
        producer: ProducerLoop,
    }

    fn harness(batch_size: usize) -> Harness {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new(2);
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        ));
        let config = ProducerConfig {
            batch_size,
            ..ProducerConfig::default()
        };
        let producer = ProducerLoop::new(
            Arc::new(store.clone()),
            Arc::new(broker.clone()),
            clock.clone(),
            config,
        );
        Harness {
            store,
            broker,
            clock,
            producer,
        }
    }

    async fn seed(h: &Harness, n: usize) -> Vec<OutboxId> {
        let mut ids = Vec::new();
        for i in 0..n {
            let id = OutboxId::from_ulid(Ulid::new());
            let at = h.clock.now() + Duration::milliseconds(i as i64);
            h.store
                .insert(
                    NewOutboxEvent::new(id, "notifications", format!("k{i}"), r#"{"to":"a@b.com"}"#),
                    at,
                )
                .await
                .unwrap();
            ids.push(id);
        }
        h.clock.advance(Duration::seconds(1));
        ids
    }

    #[tokio::test]
    async fn publishes_with_outbox_id_header() {
        let h = harness(10);
        let ids = seed(&h, 3).await;

        let report = h.producer.run_once().await.unwrap();
        assert_eq!(
            report,
            ProduceReport {
                claimed: 3,
                produced: 3,
                failed: 0,
                released: 0
            }
        );

        let messages = h.broker.messages("notifications").await;
        assert_eq!(messages.len(), 3);
        for delivery in &messages {
            let id = delivery.message.outbox_id().unwrap().unwrap();
            assert!(ids.contains(&id));
            assert!(delivery.message.header(OUTBOX_ID_HEADER).is_some());

            let row = h.store.get(id).await.unwrap().unwrap();
            assert_eq!(row.status, OutboxStatus::Produced);
            assert_eq!(row.broker_partition, Some(delivery.position.partition));
            assert_eq!(row.broker_offset, Some(delivery.position.offset));
        }
    }

    #[tokio::test]
    async fn first_failure_aborts_the_batch() {
        let h = harness(10);
        let ids = seed(&h, 3).await;
        h.broker.fail_next_publishes(1).await;
        let now = h.clock.now();

        let report = h.producer.run_once().await.unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.produced, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.released, 2);
        assert!(h.broker.messages("notifications").await.is_empty());

        let failed = h.store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(failed.status, OutboxStatus::Error);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.next_attempt_at, now + Duration::seconds(2));
        assert!(failed.last_error.unwrap().contains("injected"));

        for id in &ids[1..] {
            let row = h.store.get(*id).await.unwrap().unwrap();
            assert_eq!(row.status, OutboxStatus::Error);
            assert_eq!(row.last_error.as_deref(), Some(BATCH_ABORTED));
            assert_eq!(row.next_attempt_at, now);
        }

        // Released rows go out on the next cycle; the failed one waits for backoff.
        let report = h.producer.run_once().await.unwrap();
        assert_eq!(report.produced, 2);
        h.clock.advance(Duration::seconds(2));
        let report = h.producer.run_once().await.unwrap();
        assert_eq!(report.produced, 1);
        assert_eq!(h.broker.messages("notifications").await.len(), 3);
    }

    #[tokio::test]
    async fn backoff_grows_with_attempts_and_caps() {
        let h = harness(1);
        let ids = seed(&h, 1).await;
        let mut expected_delays = Vec::new();

        for _ in 0..8 {
            h.broker.fail_next_publishes(1).await;
            let before = h.clock.now();
            h.producer.run_once().await.unwrap();
            let row = h.store.get(ids[0]).await.unwrap().unwrap();
            let delay = row.next_attempt_at - before;
            expected_delays.push(delay.num_seconds());
            h.clock.set(row.next_attempt_at);
        }

        assert_eq!(expected_delays, vec![2, 4, 8, 16, 32, 64, 64, 64]);
    }

    #[tokio::test]
    async fn closed_broker_is_fatal() {
        let h = harness(10);
        seed(&h, 2).await;
        h.broker.close().await;

        let err = h.producer.run_once().await.unwrap_err();
        assert!(err.is_fatal());
        let counts = h.store.counts().await.unwrap();
        assert_eq!(counts.error, 2);
        assert_eq!(counts.producing, 0);
    }

    #[tokio::test]
    async fn store_outage_is_fatal_for_run() {
        let h = harness(10);
        h.store.set_unavailable(true);
        let (_tx, rx) = watch::channel(false);

        let err = h.producer.run(rx).await.unwrap_err();
        assert!(matches!(err, HeraldError::Store(_)));
    }

    #[tokio::test]
    async fn reaped_row_does_not_stop_the_release() {
        let h = harness(10);
        let ids = seed(&h, 3).await;
        let producer = ProducerLoop::new(
            Arc::new(h.store.clone()),
            Arc::new(ReapingBroker {
                store: h.store.clone(),
                at: h.clock.now(),
            }),
            h.clock.clone(),
            ProducerConfig::default(),
        );

        let report = producer.run_once().await.unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.released, 2);

        let reaped = h.store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(reaped.status, OutboxStatus::Error);
        assert_eq!(reaped.last_error.as_deref(), Some("claim expired"));
        for id in &ids[1..] {
            let row = h.store.get(*id).await.unwrap().unwrap();
            assert_eq!(row.status, OutboxStatus::Error);
            assert_eq!(row.last_error.as_deref(), Some(BATCH_ABORTED));
        }
        assert_eq!(h.store.counts().await.unwrap().producing, 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_flushes() {
        let h = harness(10);
        seed(&h, 1).await;
        let broker = RecordingBroker {
            inner: h.broker.clone(),
            flushes: Arc::new(Mutex::new(Vec::new())),
        };
        let config = ProducerConfig {
            flush_timeout: std::time::Duration::from_millis(1234),
            ..ProducerConfig::default()
        };
        let producer = ProducerLoop::new(
            Arc::new(h.store.clone()),
            Arc::new(broker.clone()),
            h.clock.clone(),
            config,
        );
        let (tx, rx) = watch::channel(false);

        let join = tokio::spawn(async move { producer.run(rx).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        join.await.unwrap().unwrap();
        assert_eq!(h.store.counts().await.unwrap().produced, 1);
        assert_eq!(
            *broker.flushes.lock().await,
            vec![std::time::Duration::from_millis(1234)]
        );
    }
}
