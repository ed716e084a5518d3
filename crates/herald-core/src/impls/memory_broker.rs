//! InMemoryBroker - 開発・テスト用の分割ログ
//!
//! # 実装詳細
//! - topic ごとに `partitions` 本の追記ログを持つ
//! - partition はキーの安定ハッシュで決まる（同じキーは同じ partition、順序維持）
//! - consumer group は 1 つ。partition ごとに commit 済み offset を持つ
//! - `poll` は各 partition の「最初の未 commit メッセージ」を round-robin で返す。
//!   commit しなければ同じメッセージが次の poll でも返る
//!
//! # 障害注入
//! - `fail_next_publishes(n)`: 次の n 回の publish を transport error にする
//! - `close()`: 以降の操作はすべて `BrokerError::Closed`
//! - `rewind()`: commit 済み offset を巻き戻す（consumer の再起動・再配送の再現）

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::domain::{BrokerError, BrokerMessage, BrokerPosition, Delivery};
use crate::ports::{BrokerConsumer, BrokerProducer};

pub const DEFAULT_PARTITIONS: usize = 3;

struct BrokerState {
    partitions: usize,
    logs: HashMap<String, Vec<Vec<BrokerMessage>>>,
    /// Next offset to deliver, per (topic, partition).
    committed: HashMap<(String, i32), i64>,
    /// Round-robin start partition for the next poll.
    cursor: usize,
    fail_publishes: u32,
    closed: bool,
}

impl BrokerState {
    fn log_mut(&mut self, topic: &str) -> &mut Vec<Vec<BrokerMessage>> {
        let partitions = self.partitions;
        self.logs
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions])
    }

    fn next_uncommitted(&mut self, topic: &str) -> Option<Delivery> {
        let logs = self.logs.get(topic)?;
        let n = self.partitions;
        for step in 0..n {
            let partition = (self.cursor + step) % n;
            let offset = self
                .committed
                .get(&(topic.to_string(), partition as i32))
                .copied()
                .unwrap_or(0);
            if let Some(message) = logs[partition].get(offset as usize) {
                let delivery = Delivery {
                    topic: topic.to_string(),
                    position: BrokerPosition {
                        partition: partition as i32,
                        offset,
                    },
                    message: message.clone(),
                };
                self.cursor = (partition + 1) % n;
                return Some(delivery);
            }
        }
        None
    }
}

/// Cloning shares the same logs and offsets.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new(partitions: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                partitions: partitions.max(1),
                logs: HashMap::new(),
                committed: HashMap::new(),
                cursor: 0,
                fail_publishes: 0,
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// A consumer-group member subscribed to `topic`.
    pub fn consumer(&self, topic: impl Into<String>) -> InMemoryConsumer {
        InMemoryConsumer {
            broker: self.clone(),
            topic: topic.into(),
        }
    }

    pub async fn fail_next_publishes(&self, n: u32) {
        self.state.lock().await.fail_publishes = n;
    }

    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Move the group's position on one partition back to `offset`.
    pub async fn rewind(&self, topic: &str, partition: i32, offset: i64) {
        let mut state = self.state.lock().await;
        state.committed.insert((topic.to_string(), partition), offset);
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn committed_offset(&self, topic: &str, partition: i32) -> i64 {
        let state = self.state.lock().await;
        state
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
            .unwrap_or(0)
    }

    /// Every message ever published to `topic`, in partition then offset order.
    pub async fn messages(&self, topic: &str) -> Vec<Delivery> {
        let state = self.state.lock().await;
        let Some(logs) = state.logs.get(topic) else {
            return Vec::new();
        };
        logs.iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter().enumerate().map(move |(offset, message)| Delivery {
                    topic: topic.to_string(),
                    position: BrokerPosition {
                        partition: partition as i32,
                        offset: offset as i64,
                    },
                    message: message.clone(),
                })
            })
            .collect()
    }

    pub fn partition_for(key: &str, partitions: usize) -> i32 {
        (fnv1a(key.as_bytes()) % partitions.max(1) as u64) as i32
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl BrokerProducer for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        message: BrokerMessage,
    ) -> Result<BrokerPosition, BrokerError> {
        let position = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(BrokerError::Closed);
            }
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(BrokerError::Transport("injected publish failure".into()));
            }
            let partition = Self::partition_for(&message.key, state.partitions);
            let log = &mut state.log_mut(topic)[partition as usize];
            log.push(message);
            BrokerPosition {
                partition,
                offset: (log.len() - 1) as i64,
            }
        };
        self.notify.notify_waiters();
        Ok(position)
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        // publish() already waited for the append, nothing is outstanding.
        if self.state.lock().await.closed {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    topic: String,
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before looking so a publish in between is not lost.
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.broker.state.lock().await;
                if state.closed {
                    return Err(BrokerError::Closed);
                }
                if let Some(delivery) = state.next_uncommitted(&self.topic) {
                    return Ok(Some(delivery));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        let key = (delivery.topic.clone(), delivery.position.partition);
        let next = delivery.position.offset + 1;
        let entry = state.committed.entry(key).or_insert(0);
        if *entry < next {
            *entry = next;
        }
        Ok(())
    }
}
