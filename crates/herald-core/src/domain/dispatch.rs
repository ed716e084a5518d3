//! Dispatch ledger model.
//!
//! One record per outbox id that has entered the consumer pipeline.
//! States: *absent* -> Reserved -> Sent (terminal).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::OutboxId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatchStatus {
    /// consumer が id を見た。副作用が実行されたかは不明
    Reserved,

    /// 副作用を実行し、finalize トランザクションも commit 済み
    Sent,
}

impl DispatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStatus::Reserved => "Reserved",
            DispatchStatus::Sent => "Sent",
        }
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("Reserved") {
            Ok(DispatchStatus::Reserved)
        } else if s.eq_ignore_ascii_case("Sent") {
            Ok(DispatchStatus::Sent)
        } else {
            Err(format!("unknown dispatch status: {s}"))
        }
    }
}

/// ledger の 1 行。`status == Sent` の行があることだけが、副作用実行済みの証拠になる
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub outbox_id: OutboxId,
    pub status: DispatchStatus,
    pub reserved_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub effect_id: Option<String>,
}

impl DispatchRecord {
    pub fn reserved(outbox_id: OutboxId, now: DateTime<Utc>) -> Self {
        Self {
            outbox_id,
            status: DispatchStatus::Reserved,
            reserved_at: now,
            sent_at: None,
            effect_id: None,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == DispatchStatus::Sent
    }

    /// Reserved -> Sent。既に `Sent` なら触らない（最初の effect id を残す）
    pub(crate) fn mark_sent(&mut self, effect_id: String, at: DateTime<Utc>) {
        if self.status == DispatchStatus::Reserved {
            self.status = DispatchStatus::Sent;
            self.sent_at = Some(at);
            self.effect_id = Some(effect_id);
        }
    }
}

/// reserve トランザクションの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// 枠を確保した（初見、または前回の試行が finalize されなかった）。
    /// 呼び出し側は副作用を実行して finalize すること。
    Reserved,

    /// 既に `Sent`。outbox 行は同じトランザクションで confirm 済み。副作用を再実行してはいけない
    AlreadySent { effect_id: Option<String> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    #[test]
    fn mark_sent_only_once() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap();
        let mut record = DispatchRecord::reserved(OutboxId::from_ulid(Ulid::new()), t0);
        assert!(!record.is_sent());

        record.mark_sent("first".into(), t0);
        record.mark_sent("second".into(), t1);

        assert!(record.is_sent());
        assert_eq!(record.effect_id.as_deref(), Some("first"));
        assert_eq!(record.sent_at, Some(t0));
    }

    #[test]
    fn status_roundtrips_through_str() {
        for status in [DispatchStatus::Reserved, DispatchStatus::Sent] {
            assert_eq!(status.as_str().parse::<DispatchStatus>(), Ok(status));
        }
        assert!("Confirmed".parse::<DispatchStatus>().is_err());
    }
}
