//! Schema migrations, tracked in the `migrations` table and applied in order.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::domain::StoreResult;

pub const CURRENT_VERSION: i32 = 2;

pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version >= CURRENT_VERSION {
        debug!(current_version, "Schema up to date");
        return Ok(());
    }
    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_events(conn)?;
    }
    if current_version < 2 {
        migrate_v2_dispatch_ledger(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: outbox rows. Timestamps are fixed-width RFC 3339 text, so string
/// comparison is time comparison.
fn migrate_v1_outbox_events(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_events (
            id TEXT PRIMARY KEY,
            topic TEXT NOT NULL,
            partition_key TEXT NOT NULL,
            payload BLOB NOT NULL,
            status TEXT NOT NULL DEFAULT 'Pending',
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            next_attempt_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            claimed_at TEXT,
            produced_at TEXT,
            confirmed_at TEXT,
            broker_partition INTEGER,
            broker_offset INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_events_due
            ON outbox_events(status, next_attempt_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_events_created_at
            ON outbox_events(created_at);
        ",
    )?;
    record_migration(conn, 1, "outbox_events")
}

/// V2: consumer-side dispatch ledger. 1 outbox 行につき高々 1 レコード。
fn migrate_v2_dispatch_ledger(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS dispatch_ledger (
            outbox_id TEXT PRIMARY KEY REFERENCES outbox_events(id),
            status TEXT NOT NULL DEFAULT 'Reserved',
            reserved_at TEXT NOT NULL,
            sent_at TEXT,
            effect_id TEXT
        );
        ",
    )?;
    record_migration(conn, 2, "dispatch_ledger")
}
