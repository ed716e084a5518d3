//! Status - outbox の状態別件数
//!
//! 詰まり（Error が増え続ける、Producing が減らない）を外から観測するためのビュー。

use serde::{Deserialize, Serialize};

use crate::domain::OutboxStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    pub pending: usize,
    pub producing: usize,
    pub produced: usize,
    pub error: usize,
    pub confirmed: usize,
}

impl OutboxCounts {
    pub fn record(&mut self, status: OutboxStatus, n: usize) {
        match status {
            OutboxStatus::Pending => self.pending += n,
            OutboxStatus::Producing => self.producing += n,
            OutboxStatus::Produced => self.produced += n,
            OutboxStatus::Error => self.error += n,
            OutboxStatus::Confirmed => self.confirmed += n,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.producing + self.produced + self.error + self.confirmed
    }

    /// consumer 側でまだ Confirmed になっていない行数
    pub fn in_flight(&self) -> usize {
        self.total() - self.confirmed
    }
}
