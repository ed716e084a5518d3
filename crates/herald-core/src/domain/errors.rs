//! Errors - エラー型と分類
//!
//! ループはエラーを ErrorKind で分類して振る舞いを決めます。
//! - Transient: 次のサイクルで再試行
//! - Permanent: 再試行しても無意味（パイプラインを先に進める）
//! - Infrastructure: 接続喪失など。ループを終了し、外部の supervisor に再起動を任せる

use thiserror::Error;

use super::event::OutboxStatus;
use super::ids::OutboxId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// outbox store / dispatch ledger のエラー
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// store に到達できない。プロセス内でリトライしても直らない
    #[error("connection error: {0}")]
    Connection(String),

    #[error("outbox event not found: {0}")]
    NotFound(OutboxId),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("outbox event {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: OutboxId,
        from: OutboxStatus,
        to: OutboxStatus,
    },

    #[error("outbox event {0} already exists")]
    Duplicate(OutboxId),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Connection(_) => ErrorKind::Infrastructure,
            StoreError::Database(_) => ErrorKind::Transient,
            StoreError::NotFound(_)
            | StoreError::InvalidData(_)
            | StoreError::InvalidTransition { .. }
            | StoreError::Duplicate(_) => ErrorKind::Permanent,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// broker producer / consumer のエラー
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// publish / fetch が通信路上で失敗した
    #[error("broker transport error: {0}")]
    Transport(String),

    /// クライアント停止済み、または接続が恒久的に失われた
    #[error("broker connection closed")]
    Closed,
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Transport(_) => ErrorKind::Transient,
            BrokerError::Closed => ErrorKind::Infrastructure,
        }
    }
}

/// 副作用 executor の失敗
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// 何度やっても成功しない（宛先が不正など）
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// 再配送でリトライする価値がある
    #[error("transient failure: {0}")]
    Transient(String),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::Permanent(_) => ErrorKind::Permanent,
            ExecutionError::Transient(_) => ErrorKind::Transient,
        }
    }
}

/// ループが返すトップレベルのエラー
#[derive(Debug, Error)]
pub enum HeraldError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl HeraldError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HeraldError::Store(e) => e.kind(),
            HeraldError::Broker(e) => e.kind(),
            HeraldError::Config(_) => ErrorKind::Permanent,
        }
    }

    /// ループを止めてプロセス監視に再起動を任せるべきか
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }
}
