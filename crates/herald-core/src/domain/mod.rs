//! Domain model (ids, outbox rows, ledger rows, broker messages, errors).
//!
//! ここにある型はストレージやブローカーの実装を知りません。
//! 状態遷移のルールはすべてこのモジュールのメソッドに集約します。

pub mod backoff;
pub mod dispatch;
pub mod errors;
pub mod event;
pub mod ids;
pub mod message;
pub mod notification;

pub use self::backoff::BackoffPolicy;
pub use self::dispatch::{DispatchRecord, DispatchStatus, Reservation};
pub use self::errors::{
    BrokerError, ErrorKind, ExecutionError, HeraldError, StoreError, StoreResult,
};
pub use self::event::{NewOutboxEvent, OutboxEvent, OutboxStatus};
pub use self::ids::{OutboxId, ParseIdError};
pub use self::message::{BrokerMessage, BrokerPosition, Delivery, OUTBOX_ID_HEADER};
pub use self::notification::{EmailPayload, NormalizedEmail, PayloadError};
