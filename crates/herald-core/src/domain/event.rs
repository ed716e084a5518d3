//! Outbox event: one row per domain event to deliver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::{StoreError, StoreResult};
use super::ids::OutboxId;

/// outbox 行の配送状態
///
/// 状態遷移:
/// - Pending -> Producing -> Produced -> Confirmed
/// - Pending -> Producing -> Error -> Producing（backoff 後に再試行）
///
/// `Confirmed` が終端。consumer 側が副作用を処理し終えたときに書く。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxStatus {
    /// upstream writer が書いた直後。まだ誰も claim していない
    Pending,

    /// producer インスタンスが claim 済み。publish 中
    Producing,

    /// broker が受理した
    Produced,

    /// 直近の publish が失敗。`next_attempt_at` を過ぎたら再び claim 可能
    Error,

    /// consumer が副作用を処理済み
    Confirmed,
}

impl OutboxStatus {
    pub const ALL: [OutboxStatus; 5] = [
        OutboxStatus::Pending,
        OutboxStatus::Producing,
        OutboxStatus::Produced,
        OutboxStatus::Error,
        OutboxStatus::Confirmed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "Pending",
            OutboxStatus::Producing => "Producing",
            OutboxStatus::Produced => "Produced",
            OutboxStatus::Error => "Error",
            OutboxStatus::Confirmed => "Confirmed",
        }
    }

    /// producer が claim できる状態か（`next_attempt_at` は別に見る）
    pub fn is_claimable(self) -> bool {
        self.can_transition_to(OutboxStatus::Producing)
    }

    /// `self -> next` が許される遷移か
    ///
    /// 逆向きの辺は `Error -> Producing` だけ。Confirmed へはどの状態からでも
    /// 遷移できる: producer が broker の ack を記録する前に consumer が
    /// メッセージを見ることがあり、再配送が古い `Error` を追い越すこともある。
    pub fn can_transition_to(self, next: OutboxStatus) -> bool {
        use OutboxStatus::*;
        match (self, next) {
            (Pending | Error, Producing) => true,
            (Producing, Produced | Error) => true,
            (_, Confirmed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutboxStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown outbox status: {s}"))
    }
}

/// 保存されている outbox 行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: OutboxId,
    pub topic: String,
    pub partition_key: String,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,

    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// `status` が `Pending` / `Error` のときだけ意味を持つ
    pub next_attempt_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub produced_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub broker_partition: Option<i32>,
    pub broker_offset: Option<i64>,
}

impl OutboxEvent {
    /// 書き込まれた直後の行を作る（即時に claim 可能）
    pub fn pending(new: NewOutboxEvent, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            topic: new.topic,
            partition_key: new.partition_key,
            payload: new.payload,
            status: OutboxStatus::Pending,
            attempt_count: 0,
            last_error: None,
            next_attempt_at: now,
            created_at: now,
            claimed_at: None,
            produced_at: None,
            confirmed_at: None,
            broker_partition: None,
            broker_offset: None,
        }
    }

    /// `now` の時点で claim 対象か
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.next_attempt_at <= now
    }

    // 行の状態はここでしか変えない。どの store 実装も同じ規則を通る。

    fn check_transition(&self, to: OutboxStatus) -> StoreResult<()> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            })
        }
    }

    pub(crate) fn start_claim(&mut self, now: DateTime<Utc>) -> StoreResult<()> {
        self.check_transition(OutboxStatus::Producing)?;
        self.status = OutboxStatus::Producing;
        self.attempt_count += 1;
        self.last_error = None;
        self.claimed_at = Some(now);
        Ok(())
    }

    /// Producing -> Produced。consumer が先に Confirmed にした行は
    /// Confirmed のまま、broker の位置だけ記録する。
    pub(crate) fn mark_produced(
        &mut self,
        partition: i32,
        offset: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if self.status != OutboxStatus::Confirmed {
            self.check_transition(OutboxStatus::Produced)?;
            self.status = OutboxStatus::Produced;
        }
        self.produced_at = Some(at);
        self.broker_partition = Some(partition);
        self.broker_offset = Some(offset);
        self.last_error = None;
        self.claimed_at = None;
        Ok(())
    }

    /// Producing -> Error。Confirmed の行には何もしない。
    pub(crate) fn mark_failed(
        &mut self,
        reason: String,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if self.status == OutboxStatus::Confirmed {
            return Ok(());
        }
        self.check_transition(OutboxStatus::Error)?;
        self.status = OutboxStatus::Error;
        self.last_error = Some(reason);
        self.next_attempt_at = next_attempt_at;
        self.claimed_at = None;
        Ok(())
    }

    /// 冪等。すでに Confirmed なら最初のタイムスタンプを残す。
    pub(crate) fn confirm(&mut self, at: DateTime<Utc>) {
        if self.status != OutboxStatus::Confirmed {
            self.status = OutboxStatus::Confirmed;
            self.confirmed_at = Some(at);
            self.claimed_at = None;
        }
    }
}

/// upstream writer がドメインイベントを記録するときに渡すもの
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub id: OutboxId,
    pub topic: String,
    pub partition_key: String,
    pub payload: Vec<u8>,
}

impl NewOutboxEvent {
    pub fn new(
        id: OutboxId,
        topic: impl Into<String>,
        partition_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            partition_key: partition_key.into(),
            payload: payload.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn event(now: DateTime<Utc>) -> OutboxEvent {
        let new = NewOutboxEvent::new(OutboxId::from_ulid(Ulid::new()), "orders", "k1", "{}");
        OutboxEvent::pending(new, now)
    }

    #[test]
    fn allowed_transitions() {
        use OutboxStatus::*;
        assert!(Pending.can_transition_to(Producing));
        assert!(Error.can_transition_to(Producing));
        assert!(Producing.can_transition_to(Produced));
        assert!(Producing.can_transition_to(Error));
        assert!(Produced.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Confirmed));

        assert!(!Confirmed.can_transition_to(Producing));
        assert!(!Produced.can_transition_to(Producing));
        assert!(!Producing.can_transition_to(Pending));
        assert!(!Confirmed.can_transition_to(Error));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("producing".parse::<OutboxStatus>(), Ok(OutboxStatus::Producing));
        assert_eq!("Confirmed".parse::<OutboxStatus>(), Ok(OutboxStatus::Confirmed));
        assert!("Sent".parse::<OutboxStatus>().is_err());
    }

    #[test]
    fn claim_increments_attempts_and_clears_error() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut e = event(now);
        e.start_claim(now).unwrap();
        e.mark_failed("boom".into(), now).unwrap();
        e.start_claim(now).unwrap();

        assert_eq!(e.status, OutboxStatus::Producing);
        assert_eq!(e.attempt_count, 2);
        assert_eq!(e.last_error, None);
        assert_eq!(e.claimed_at, Some(now));
    }

    #[test]
    fn is_due_respects_next_attempt_at() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut e = event(now);
        assert!(e.is_due(now));

        e.start_claim(now).unwrap();
        assert!(!e.is_due(now));

        e.mark_failed("boom".into(), now + Duration::seconds(4)).unwrap();
        assert!(!e.is_due(now + Duration::seconds(3)));
        assert!(e.is_due(now + Duration::seconds(4)));
    }

    #[test]
    fn mutators_follow_the_transition_table() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut e = event(now);

        assert!(matches!(
            e.mark_produced(0, 0, now),
            Err(StoreError::InvalidTransition {
                from: OutboxStatus::Pending,
                to: OutboxStatus::Produced,
                ..
            })
        ));
        assert!(matches!(
            e.mark_failed("boom".into(), now),
            Err(StoreError::InvalidTransition { to: OutboxStatus::Error, .. })
        ));
        assert_eq!(e.status, OutboxStatus::Pending);

        e.start_claim(now).unwrap();
        e.mark_produced(1, 7, now).unwrap();
        assert!(e.start_claim(now).is_err());
        assert!(e.mark_failed("late".into(), now).is_err());
        assert_eq!(e.status, OutboxStatus::Produced);
    }

    #[test]
    fn confirmed_rows_keep_their_status() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut e = event(now);
        e.start_claim(now).unwrap();
        e.confirm(now);

        e.mark_produced(2, 9, now).unwrap();
        e.mark_failed("late failure".into(), now).unwrap();

        assert_eq!(e.status, OutboxStatus::Confirmed);
        assert_eq!(e.broker_offset, Some(9));
        assert_eq!(e.last_error, None);
    }

    #[test]
    fn confirm_is_idempotent() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut e = event(t0);
        e.confirm(t0);
        e.confirm(t0 + Duration::seconds(10));
        assert_eq!(e.confirmed_at, Some(t0));
    }
}
