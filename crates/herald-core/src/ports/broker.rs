//! Broker ports - 配送ログ（Kafka 相当）への入口と出口
//!
//! ブローカーの transport / partition / replication の内部はこの crate の範囲外です。
//! ここでは producer と consumer group member が必要とする最小の操作だけを定義します。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{BrokerError, BrokerMessage, BrokerPosition, Delivery};

/// publish 側（at-least-once）
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// publish して broker の ack を待つ
    async fn publish(&self, topic: &str, message: BrokerMessage) -> Result<BrokerPosition, BrokerError>;

    /// 未完了の ack を待つ。`timeout` で諦める
    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

/// consume 側。consumer group の 1 メンバー
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// 次のメッセージ。`timeout` 内に何も来なければ `None`
    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// group の commit 済み offset を `delivery` の次へ進める
    async fn commit(&self, delivery: &Delivery) -> Result<(), BrokerError>;
}
