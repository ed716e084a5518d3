//! Notification payload carried in outbox events bound for the mail executor.

use serde::{Deserialize, Serialize};

pub const DEFAULT_SUBJECT: &str = "(no subject)";

/// `{ "to": "...", "subject": "...", "body": "..." }`
///
/// Keys are matched case-insensitively so upstream writers that emit
/// `"To"`/`"Subject"` still decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailPayload {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Why a payload can never be delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),

    #[error("recipient is empty")]
    MissingRecipient,

    #[error("recipient {0:?} is not a valid address")]
    InvalidRecipient(String),
}

impl EmailPayload {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: Some(subject.into()),
            body: Some(body.into()),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| PayloadError::Malformed(e.to_string()))?;
        let value = match value {
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v))
                    .collect(),
            ),
            other => other,
        };
        serde_json::from_value(value).map_err(|e| PayloadError::Malformed(e.to_string()))
    }

    /// Validate the recipient and fill in defaults for subject and body.
    pub fn normalized(self) -> Result<NormalizedEmail, PayloadError> {
        let to = self.to.trim().to_string();
        if to.is_empty() {
            return Err(PayloadError::MissingRecipient);
        }
        if !is_plausible_address(&to) {
            return Err(PayloadError::InvalidRecipient(to));
        }

        let subject = self
            .subject
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SUBJECT.to_string());

        Ok(NormalizedEmail {
            to,
            subject,
            body: self.body.unwrap_or_default(),
        })
    }
}

/// A payload that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

fn is_plausible_address(addr: &str) -> bool {
    if addr.chars().any(char::is_whitespace) {
        return false;
    }
    match addr.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}
