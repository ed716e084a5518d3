//! MailTransport port - 通知の送信経路（SMTP など）
//!
//! 接続・認証・プロトコルの詳細は外部コラボレーターの責務です。
//! NotificationExecutor はこの trait 越しに組み立て済みのメールを渡します。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::ExecutionError;

/// A fully addressed message ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    /// Stable identifier derived from the outbox id (`<id@outbox>`).
    pub message_id: String,
    pub headers: Vec<(String, String)>,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Hand the message over. Returns the id the transport assigned, which
    /// should be `mail.message_id` unless the transport rewrites it.
    async fn send(&self, mail: &OutgoingMail) -> Result<String, ExecutionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportSecurity {
    #[default]
    StartTls,
    Implicit,
    Auto,
    None,
}

/// Transport settings, injected rather than hard-coded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailSettings {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub sender_address: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub transport_security: TransportSecurity,
}

fn default_port() -> u16 {
    587
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            sender_address: String::new(),
            sender_name: String::new(),
            transport_security: TransportSecurity::default(),
        }
    }
}

impl MailSettings {
    /// `"Name <address>"`, or just the address when no name is configured.
    pub fn sender_identity(&self) -> String {
        if self.sender_name.is_empty() {
            self.sender_address.clone()
        } else {
            format!("{} <{}>", self.sender_name, self.sender_address)
        }
    }
}
