//! SqliteStore - rusqlite による outbox + dispatch ledger
//!
//! # 設計原則
//! - 接続は 1 本。tokio-rusqlite の専用スレッドで SQL を実行する（runtime をブロックしない）
//! - 各 port メソッドは 1 トランザクション（書き込みは `BEGIN IMMEDIATE`）
//! - claim は `UPDATE ... WHERE id IN (SELECT ... LIMIT n) RETURNING`。
//!   書き込みロックを取った時点で対象行が確定するので、同じ行を二重に claim しない
//!
//! 別プロセスから同じファイルを開いた場合も、SQLite のデータベースロックと
//! `busy_timeout` で claim は直列化される。

mod migrations;
mod store;

use std::path::Path;

use tracing::info;

use crate::domain::{StoreError, StoreResult};

pub use self::migrations::CURRENT_VERSION;

fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> StoreError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => StoreError::Database(e),
        tokio_rusqlite::Error::Close(_) => StoreError::Connection("connection closed".to_string()),
        other => StoreError::Connection(other.to_string()),
    }
}

/// 1 つの SQLite DB で outbox store と dispatch ledger を兼ねる
///
/// clone しても接続は共有される
#[derive(Clone)]
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
    /// `path` の DB を開き（無ければ作成）、マイグレーションを流す
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self { conn };

        store
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode = WAL;
                    PRAGMA synchronous = NORMAL;
                    PRAGMA busy_timeout = 5000;
                    PRAGMA foreign_keys = ON;
                    ",
                )?;
                migrations::run_migrations(conn)
            })
            .await?;

        info!(path = %path.display(), "Outbox database opened");
        Ok(store)
    }

    /// Private in-memory database, for tests and demos.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self { conn };
        store
            .call(|conn| {
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                migrations::run_migrations(conn)
            })
            .await?;
        Ok(store)
    }

    /// Run `f` on the database thread.
    async fn call<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok(f(conn)))
            .await
            .map_err(from_tokio_rusqlite)?
    }
}
