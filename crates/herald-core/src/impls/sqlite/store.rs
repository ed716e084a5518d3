use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use tracing::debug;

use super::SqliteStore;
use crate::app::status::OutboxCounts;
use crate::domain::{
    DispatchRecord, DispatchStatus, NewOutboxEvent, OutboxEvent, OutboxId, OutboxStatus,
    Reservation, StoreError, StoreResult,
};
use crate::ports::{DispatchLedger, OutboxStore};

const EVENT_COLUMNS: &str = "id, topic, partition_key, payload, status, attempt_count, last_error, \
     next_attempt_at, created_at, claimed_at, produced_at, confirmed_at, broker_partition, broker_offset";

// ==========================================
// Row mapping
// ==========================================

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(ts)
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => parse_ts(row, idx).map(Some),
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxEvent> {
    Ok(OutboxEvent {
        id: parse_col(row, 0)?,
        topic: row.get(1)?,
        partition_key: row.get(2)?,
        payload: row.get(3)?,
        status: parse_col(row, 4)?,
        attempt_count: row.get(5)?,
        last_error: row.get(6)?,
        next_attempt_at: parse_ts(row, 7)?,
        created_at: parse_ts(row, 8)?,
        claimed_at: parse_opt_ts(row, 9)?,
        produced_at: parse_opt_ts(row, 10)?,
        confirmed_at: parse_opt_ts(row, 11)?,
        broker_partition: row.get(12)?,
        broker_offset: row.get(13)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<DispatchRecord> {
    Ok(DispatchRecord {
        outbox_id: parse_col(row, 0)?,
        status: parse_col(row, 1)?,
        reserved_at: parse_ts(row, 2)?,
        sent_at: parse_opt_ts(row, 3)?,
        effect_id: row.get(4)?,
    })
}

// ==========================================
// Queries
// ==========================================

fn load_event(conn: &Connection, id: OutboxId) -> StoreResult<Option<OutboxEvent>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM outbox_events WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id.to_string()], event_from_row)
        .optional()?)
}

/// Persist every mutable column of `event`.
fn write_back(conn: &Connection, event: &OutboxEvent) -> StoreResult<()> {
    conn.execute(
        "UPDATE outbox_events
         SET status = ?2, attempt_count = ?3, last_error = ?4, next_attempt_at = ?5,
             claimed_at = ?6, produced_at = ?7, confirmed_at = ?8,
             broker_partition = ?9, broker_offset = ?10
         WHERE id = ?1",
        params![
            event.id.to_string(),
            event.status.as_str(),
            event.attempt_count,
            event.last_error,
            ts(event.next_attempt_at),
            opt_ts(event.claimed_at),
            opt_ts(event.produced_at),
            opt_ts(event.confirmed_at),
            event.broker_partition,
            event.broker_offset,
        ],
    )?;
    Ok(())
}

fn load_record(conn: &Connection, id: OutboxId) -> StoreResult<Option<DispatchRecord>> {
    Ok(conn
        .query_row(
            "SELECT outbox_id, status, reserved_at, sent_at, effect_id
             FROM dispatch_ledger WHERE outbox_id = ?1",
            params![id.to_string()],
            record_from_row,
        )
        .optional()?)
}

fn confirm_event(conn: &Connection, id: OutboxId, at: DateTime<Utc>) -> StoreResult<()> {
    if let Some(mut event) = load_event(conn, id)? {
        event.confirm(at);
        write_back(conn, &event)?;
    }
    Ok(())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

// ==========================================
// OutboxStore
// ==========================================

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn insert(&self, event: NewOutboxEvent, now: DateTime<Utc>) -> StoreResult<OutboxEvent> {
        self.call(move |conn| {
            let id = event.id;
            let inserted = conn.execute(
                "INSERT INTO outbox_events
                     (id, topic, partition_key, payload, status, attempt_count, next_attempt_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
                params![
                    id.to_string(),
                    event.topic,
                    event.partition_key,
                    event.payload,
                    OutboxStatus::Pending.as_str(),
                    ts(now),
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => return Err(StoreError::Duplicate(id)),
                Err(e) => return Err(e.into()),
            }
            load_event(conn, id)?.ok_or(StoreError::NotFound(id))
        })
        .await
    }

    async fn claim_batch(&self, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<OutboxEvent>> {
        let mut claimed = self
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let claimed = {
                    let sql = format!(
                        "UPDATE outbox_events
                         SET status = 'Producing', attempt_count = attempt_count + 1,
                             last_error = NULL, claimed_at = ?1
                         WHERE id IN (
                             SELECT id FROM outbox_events
                             WHERE status IN ('Pending', 'Error') AND next_attempt_at <= ?1
                             ORDER BY created_at, id
                             LIMIT ?2
                         )
                         RETURNING {EVENT_COLUMNS}"
                    );
                    let mut stmt = tx.prepare(&sql)?;
                    let rows = stmt.query_map(params![ts(now), limit as i64], event_from_row)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                };
                tx.commit()?;
                Ok(claimed)
            })
            .await?;

        // RETURNING order is unspecified.
        claimed.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        debug!(claimed = claimed.len(), "Claimed outbox batch");
        Ok(claimed)
    }

    async fn mark_produced(
        &self,
        id: OutboxId,
        partition: i32,
        offset: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut event = load_event(&tx, id)?.ok_or(StoreError::NotFound(id))?;
            event.mark_produced(partition, offset, at)?;
            write_back(&tx, &event)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: OutboxId,
        reason: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let reason = reason.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut event = load_event(&tx, id)?.ok_or(StoreError::NotFound(id))?;
            event.mark_failed(reason, next_attempt_at)?;
            write_back(&tx, &event)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<OutboxId>> {
        let mut released = self
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "UPDATE outbox_events
                     SET status = 'Error', last_error = 'claim expired',
                         next_attempt_at = ?2, claimed_at = NULL
                     WHERE status = 'Producing' AND claimed_at < ?1
                     RETURNING id",
                )?;
                let ids = stmt
                    .query_map(params![ts(claimed_before), ts(now)], |row| parse_col(row, 0))?
                    .collect::<Result<Vec<OutboxId>, _>>()?;
                Ok(ids)
            })
            .await?;
        released.sort();
        Ok(released)
    }

    async fn get(&self, id: OutboxId) -> StoreResult<Option<OutboxEvent>> {
        self.call(move |conn| load_event(conn, id)).await
    }

    async fn counts(&self) -> StoreResult<OutboxCounts> {
        self.call(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM outbox_events GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((parse_col::<OutboxStatus>(row, 0)?, row.get::<_, i64>(1)?))
            })?;
            let mut counts = OutboxCounts::default();
            for row in rows {
                let (status, n) = row?;
                counts.record(status, n as usize);
            }
            Ok(counts)
        })
        .await
    }
}

// ==========================================
// DispatchLedger
// ==========================================

#[async_trait]
impl DispatchLedger for SqliteStore {
    async fn reserve(&self, id: OutboxId, now: DateTime<Utc>) -> StoreResult<Reservation> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if load_event(&tx, id)?.is_none() {
                return Err(StoreError::NotFound(id));
            }
            tx.execute(
                "INSERT OR IGNORE INTO dispatch_ledger (outbox_id, status, reserved_at)
                 VALUES (?1, ?2, ?3)",
                params![id.to_string(), DispatchStatus::Reserved.as_str(), ts(now)],
            )?;
            let record = load_record(&tx, id)?.ok_or_else(|| {
                StoreError::InvalidData(format!("dispatch record for {id} vanished"))
            })?;

            let reservation = if record.is_sent() {
                confirm_event(&tx, id, now)?;
                Reservation::AlreadySent {
                    effect_id: record.effect_id,
                }
            } else {
                Reservation::Reserved
            };
            tx.commit()?;
            Ok(reservation)
        })
        .await
    }

    async fn finalize(&self, id: OutboxId, effect_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let effect_id = effect_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut record = load_record(&tx, id)?.ok_or_else(|| {
                StoreError::InvalidData(format!("no dispatch reservation for {id}"))
            })?;
            record.mark_sent(effect_id, at);
            tx.execute(
                "UPDATE dispatch_ledger SET status = ?2, sent_at = ?3, effect_id = ?4
                 WHERE outbox_id = ?1",
                params![
                    id.to_string(),
                    record.status.as_str(),
                    opt_ts(record.sent_at),
                    record.effect_id,
                ],
            )?;
            confirm_event(&tx, id, at)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn confirm_rejected(
        &self,
        id: OutboxId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let reason = reason.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(mut event) = load_event(&tx, id)? {
                event.last_error = Some(reason);
                event.confirm(at);
                write_back(&tx, &event)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn dispatch_record(&self, id: OutboxId) -> StoreResult<Option<DispatchRecord>> {
        self.call(move |conn| load_record(conn, id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn new_event() -> NewOutboxEvent {
        NewOutboxEvent::new(
            OutboxId::from_ulid(Ulid::new()),
            "notifications",
            "customer-7",
            r#"{"to":"a@b.com","subject":"hi"}"#,
        )
    }

    #[tokio::test]
    async fn insert_then_get_preserves_fields() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let new = new_event();
        let inserted = store.insert(new.clone(), t0()).await.unwrap();
        let loaded = store.get(new.id).await.unwrap().unwrap();

        assert_eq!(inserted, loaded);
        assert_eq!(loaded.payload, new.payload);
        assert_eq!(loaded.status, OutboxStatus::Pending);
        assert_eq!(loaded.created_at, t0());
        assert_eq!(loaded.next_attempt_at, t0());
        assert_eq!(loaded.attempt_count, 0);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let new = new_event();
        store.insert(new.clone(), t0()).await.unwrap();
        assert!(matches!(
            store.insert(new, t0()).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn claim_is_ordered_limited_and_exclusive() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let late = store.insert(new_event(), t0() + Duration::seconds(2)).await.unwrap();
        let early = store.insert(new_event(), t0()).await.unwrap();
        let middle = store.insert(new_event(), t0() + Duration::seconds(1)).await.unwrap();
        let now = t0() + Duration::seconds(10);

        let first = store.claim_batch(2, now).await.unwrap();
        assert_eq!(
            first.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![early.id, middle.id]
        );
        assert!(first.iter().all(|e| e.status == OutboxStatus::Producing));
        assert!(first.iter().all(|e| e.attempt_count == 1));
        assert!(first.iter().all(|e| e.claimed_at == Some(now)));

        let second = store.claim_batch(2, now).await.unwrap();
        assert_eq!(second.iter().map(|e| e.id).collect::<Vec<_>>(), vec![late.id]);
        assert!(store.claim_batch(2, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_rows_wait_for_backoff() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let row = store.insert(new_event(), t0()).await.unwrap();
        store.claim_batch(10, t0()).await.unwrap();
        store
            .mark_failed(row.id, "broker down", t0() + Duration::seconds(2))
            .await
            .unwrap();

        let failed = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(failed.status, OutboxStatus::Error);
        assert_eq!(failed.last_error.as_deref(), Some("broker down"));
        assert_eq!(failed.claimed_at, None);

        assert!(store.claim_batch(10, t0() + Duration::seconds(1)).await.unwrap().is_empty());
        let retried = store.claim_batch(10, t0() + Duration::seconds(2)).await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].attempt_count, 2);
        assert_eq!(retried[0].last_error, None);
    }

    #[tokio::test]
    async fn mark_produced_records_position() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let row = store.insert(new_event(), t0()).await.unwrap();

        let err = store.mark_produced(row.id, 0, 0, t0()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store.claim_batch(1, t0()).await.unwrap();
        store.mark_produced(row.id, 1, 17, t0()).await.unwrap();
        let produced = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(produced.status, OutboxStatus::Produced);
        assert_eq!(produced.broker_partition, Some(1));
        assert_eq!(produced.broker_offset, Some(17));
        assert_eq!(produced.produced_at, Some(t0()));

        let missing = OutboxId::from_ulid(Ulid::new());
        assert!(matches!(
            store.mark_produced(missing, 0, 0, t0()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reclaim_stale_only_touches_old_claims() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let old = store.insert(new_event(), t0()).await.unwrap();
        let fresh = store.insert(new_event(), t0() + Duration::seconds(1)).await.unwrap();
        store.claim_batch(1, t0() + Duration::seconds(5)).await.unwrap();
        store.claim_batch(1, t0() + Duration::seconds(100)).await.unwrap();

        let released = store
            .reclaim_stale(t0() + Duration::seconds(60), t0() + Duration::seconds(130))
            .await
            .unwrap();
        assert_eq!(released, vec![old.id]);

        let old_row = store.get(old.id).await.unwrap().unwrap();
        assert_eq!(old_row.status, OutboxStatus::Error);
        assert_eq!(old_row.last_error.as_deref(), Some("claim expired"));
        assert_eq!(old_row.next_attempt_at, t0() + Duration::seconds(130));
        assert_eq!(
            store.get(fresh.id).await.unwrap().unwrap().status,
            OutboxStatus::Producing
        );
    }

    #[tokio::test]
    async fn ledger_round_trip_confirms_outbox() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let row = store.insert(new_event(), t0()).await.unwrap();

        assert_eq!(store.reserve(row.id, t0()).await.unwrap(), Reservation::Reserved);
        assert_eq!(store.reserve(row.id, t0()).await.unwrap(), Reservation::Reserved);
        store.finalize(row.id, "msg-1", t0()).await.unwrap();

        let record = store.dispatch_record(row.id).await.unwrap().unwrap();
        assert_eq!(record.status, DispatchStatus::Sent);
        assert_eq!(record.effect_id.as_deref(), Some("msg-1"));
        assert_eq!(record.sent_at, Some(t0()));

        let confirmed = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(confirmed.status, OutboxStatus::Confirmed);
        assert_eq!(confirmed.confirmed_at, Some(t0()));

        assert_eq!(
            store.reserve(row.id, t0() + Duration::seconds(5)).await.unwrap(),
            Reservation::AlreadySent {
                effect_id: Some("msg-1".into())
            }
        );
    }

    #[tokio::test]
    async fn reserve_rejects_ids_without_an_outbox_row() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let ghost = OutboxId::from_ulid(Ulid::new());

        let err = store.reserve(ghost, t0()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == ghost));
        assert!(store.dispatch_record(ghost).await.unwrap().is_none());
        assert!(matches!(
            store.finalize(ghost, "msg-1", t0()).await,
            Err(StoreError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn finalize_without_reservation_fails() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let row = store.insert(new_event(), t0()).await.unwrap();
        assert!(matches!(
            store.finalize(row.id, "msg-1", t0()).await,
            Err(StoreError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn rejected_payload_is_confirmed_with_reason() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let row = store.insert(new_event(), t0()).await.unwrap();
        store.reserve(row.id, t0()).await.unwrap();
        store.confirm_rejected(row.id, "invalid recipient", t0()).await.unwrap();

        let confirmed = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(confirmed.status, OutboxStatus::Confirmed);
        assert_eq!(confirmed.last_error.as_deref(), Some("invalid recipient"));
        assert_eq!(
            store.dispatch_record(row.id).await.unwrap().unwrap().status,
            DispatchStatus::Reserved
        );
    }

    #[tokio::test]
    async fn counts_group_by_status() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        for _ in 0..3 {
            store.insert(new_event(), t0()).await.unwrap();
        }
        store.claim_batch(1, t0()).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.producing, 1);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.db");
        let id = {
            let store = SqliteStore::open(&path).await.unwrap();
            store.insert(new_event(), t0()).await.unwrap().id
        };

        let reopened = SqliteStore::open(&path).await.unwrap();
        let row = reopened.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(reopened.claim_batch(5, t0()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_claimers_on_separate_connections_never_share_a_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.db");
        let writer = SqliteStore::open(&path).await.unwrap();
        for _ in 0..300 {
            writer.insert(new_event(), t0()).await.unwrap();
        }

        let mut joins = Vec::new();
        for _ in 0..4 {
            let store = SqliteStore::open(&path).await.unwrap();
            joins.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_batch(7, t0()).await.unwrap();
                    if batch.is_empty() {
                        break mine;
                    }
                    mine.extend(batch.into_iter().map(|e| e.id));
                }
            }));
        }

        let mut seen = HashSet::new();
        for join in joins {
            for id in join.await.unwrap() {
                assert!(seen.insert(id), "{id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 300);
        assert_eq!(writer.counts().await.unwrap().producing, 300);
    }
}
