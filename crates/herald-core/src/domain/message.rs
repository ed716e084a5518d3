//! Broker message shape shared by the producer and consumer loops.

use std::collections::BTreeMap;

use super::event::OutboxEvent;
use super::ids::{OutboxId, ParseIdError};

/// outbox id を運ぶヘッダ。producer と全 consumer の間の互換性契約なので名前を変えないこと
pub const OUTBOX_ID_HEADER: &str = "outbox-id";

/// broker に渡す / broker から受け取るメッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// ルーティングキー。順序が保たれるのは同じキーの partition 内だけ
    pub key: String,
    pub value: Vec<u8>,
    pub headers: BTreeMap<String, Vec<u8>>,
}

impl BrokerMessage {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            headers: BTreeMap::new(),
        }
    }

    /// claim 済みの outbox 行からメッセージを作る
    pub fn from_event(event: &OutboxEvent) -> Self {
        Self::new(event.partition_key.clone(), event.payload.clone())
            .with_header(OUTBOX_ID_HEADER, event.id.to_string())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name).map(Vec::as_slice)
    }

    /// 冪等キーを読む
    ///
    /// - ヘッダが無い: `None`
    /// - あるが id として不正: `Some(Err(_))`
    pub fn outbox_id(&self) -> Option<Result<OutboxId, ParseIdError>> {
        let raw = self.header(OUTBOX_ID_HEADER)?;
        let text = String::from_utf8_lossy(raw);
        Some(text.parse())
    }
}

/// publish したメッセージの broker 上の位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BrokerPosition {
    pub partition: i32,
    pub offset: i64,
}

impl std::fmt::Display for BrokerPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]@{}", self.partition, self.offset)
    }
}

/// consumer group のメンバーに配送されたメッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub position: BrokerPosition,
    pub message: BrokerMessage,
}
