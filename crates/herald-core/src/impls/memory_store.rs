//! In-memory outbox store + dispatch ledger.
//!
//! Both tables live behind one mutex. Holding the mutex is the transaction,
//! so claim/reserve/finalize are atomic and no two claimers can see the same
//! row in a claimable state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::app::status::OutboxCounts;
use crate::domain::{
    DispatchRecord, NewOutboxEvent, OutboxEvent, OutboxId, OutboxStatus, Reservation, StoreError,
    StoreResult,
};
use crate::ports::{DispatchLedger, OutboxStore};

#[derive(Default)]
struct Tables {
    outbox: HashMap<OutboxId, OutboxEvent>,
    ledger: HashMap<OutboxId, DispatchRecord>,
}

impl Tables {
    fn event_mut(&mut self, id: OutboxId) -> StoreResult<&mut OutboxEvent> {
        self.outbox.get_mut(&id).ok_or(StoreError::NotFound(id))
    }
}

/// Mutex で守られたテーブル群。clone しても同じテーブルを共有する
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the database: every call fails with
    /// `StoreError::Connection` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Connection("in-memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn insert(&self, event: NewOutboxEvent, now: DateTime<Utc>) -> StoreResult<OutboxEvent> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        if tables.outbox.contains_key(&event.id) {
            return Err(StoreError::Duplicate(event.id));
        }
        let row = OutboxEvent::pending(event, now);
        tables.outbox.insert(row.id, row.clone());
        Ok(row)
    }

    async fn claim_batch(&self, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<OutboxEvent>> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;

        let mut due: Vec<(DateTime<Utc>, OutboxId)> = tables
            .outbox
            .values()
            .filter(|e| e.is_due(now))
            .map(|e| (e.created_at, e.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            let row = tables.event_mut(id)?;
            row.start_claim(now)?;
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn mark_produced(
        &self,
        id: OutboxId,
        partition: i32,
        offset: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        tables.event_mut(id)?.mark_produced(partition, offset, at)
    }

    async fn mark_failed(
        &self,
        id: OutboxId,
        reason: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        tables
            .event_mut(id)?
            .mark_failed(reason.to_string(), next_attempt_at)
    }

    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<OutboxId>> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let mut released = Vec::new();
        for row in tables.outbox.values_mut() {
            let stale = row.status == OutboxStatus::Producing
                && row.claimed_at.is_some_and(|at| at < claimed_before);
            if stale {
                row.mark_failed("claim expired".to_string(), now)?;
                released.push(row.id);
            }
        }
        released.sort();
        Ok(released)
    }

    async fn get(&self, id: OutboxId) -> StoreResult<Option<OutboxEvent>> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables.outbox.get(&id).cloned())
    }

    async fn counts(&self) -> StoreResult<OutboxCounts> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let mut counts = OutboxCounts::default();
        for row in tables.outbox.values() {
            counts.record(row.status, 1);
        }
        Ok(counts)
    }
}

#[async_trait]
impl DispatchLedger for InMemoryStore {
    async fn reserve(&self, id: OutboxId, now: DateTime<Utc>) -> StoreResult<Reservation> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        if !tables.outbox.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let record = tables
            .ledger
            .entry(id)
            .or_insert_with(|| DispatchRecord::reserved(id, now))
            .clone();

        if !record.is_sent() {
            return Ok(Reservation::Reserved);
        }

        // Redelivery of an already-sent id: confirm in the same critical section.
        if let Some(row) = tables.outbox.get_mut(&id) {
            row.confirm(now);
        }
        Ok(Reservation::AlreadySent {
            effect_id: record.effect_id,
        })
    }

    async fn finalize(&self, id: OutboxId, effect_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let Some(record) = tables.ledger.get_mut(&id) else {
            return Err(StoreError::InvalidData(format!(
                "no dispatch reservation for {id}"
            )));
        };
        record.mark_sent(effect_id.to_string(), at);
        if let Some(row) = tables.outbox.get_mut(&id) {
            row.confirm(at);
        }
        Ok(())
    }

    async fn confirm_rejected(
        &self,
        id: OutboxId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        if let Some(row) = tables.outbox.get_mut(&id) {
            row.last_error = Some(reason.to_string());
            row.confirm(at);
        }
        Ok(())
    }

    async fn dispatch_record(&self, id: OutboxId) -> StoreResult<Option<DispatchRecord>> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables.ledger.get(&id).cloned())
    }
}
