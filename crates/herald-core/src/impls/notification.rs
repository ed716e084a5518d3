//! NotificationExecutor - outbox payload をメールとして送る SideEffectExecutor
//!
//! # フロー
//! 1. payload(JSON) を decode して正規化（宛先が空・不正なら Permanent）
//! 2. outbox id から安定した Message-Id `<{id}@outbox>` と `X-Outbox-Id` ヘッダを付与
//! 3. MailTransport に渡し、transport が返した ID を effect id として返す
//!
//! 同じ id で再実行されても Message-Id が同じなので、下流で重複排除できる。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::domain::{EmailPayload, ExecutionError, OutboxId};
use crate::ports::{MailSettings, MailTransport, OutgoingMail, SideEffectExecutor};

pub const OUTBOX_ID_MAIL_HEADER: &str = "X-Outbox-Id";

pub fn message_id_for(id: OutboxId) -> String {
    format!("<{id}@outbox>")
}

pub struct NotificationExecutor<T> {
    settings: MailSettings,
    transport: T,
}

impl<T: MailTransport> NotificationExecutor<T> {
    pub fn new(settings: MailSettings, transport: T) -> Self {
        Self {
            settings,
            transport,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Validate the payload and address the message. Fails permanently on
    /// anything a retry cannot fix.
    pub fn compose(&self, id: OutboxId, payload: &[u8]) -> Result<OutgoingMail, ExecutionError> {
        let email = EmailPayload::decode(payload)
            .and_then(EmailPayload::normalized)
            .map_err(|e| ExecutionError::Permanent(e.to_string()))?;

        Ok(OutgoingMail {
            message_id: message_id_for(id),
            headers: vec![(OUTBOX_ID_MAIL_HEADER.to_string(), id.to_string())],
            from: self.settings.sender_identity(),
            to: email.to,
            subject: email.subject,
            body: email.body,
        })
    }
}

#[async_trait]
impl<T: MailTransport> SideEffectExecutor for NotificationExecutor<T> {
    async fn execute(&self, id: OutboxId, payload: &[u8]) -> Result<String, ExecutionError> {
        let mail = self.compose(id, payload)?;
        self.transport.send(&mail).await
    }
}

/// Writes each message as a structured log line instead of sending it.
#[derive(Debug, Default, Clone)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<String, ExecutionError> {
        info!(
            message_id = %mail.message_id,
            from = %mail.from,
            to = %mail.to,
            subject = %mail.subject,
            body_len = mail.body.len(),
            "Mail handed to log transport"
        );
        Ok(mail.message_id.clone())
    }
}

/// Keeps every message it was asked to send. Can be told to fail.
#[derive(Debug, Default, Clone)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<OutgoingMail>>>,
    transient_failures: Arc<AtomicU32>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` sends fail with `ExecutionError::Transient`.
    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<String, ExecutionError> {
        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ExecutionError::Transient("mail server busy".into()));
        }
        self.sent.lock().await.push(mail.clone());
        Ok(mail.message_id.clone())
    }
}
