//! Shared types for the spam-report pipeline.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;

// ── Pipeline items ──────────────────────────────────────────────────

/// Raw email address fed into the head of the pipeline.
///
/// Not validated: the only rejected shape is an empty (or all-whitespace)
/// string, which the identity stage skips.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Email(String);

impl Email {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Trimmed address, or `None` if nothing is left.
    pub fn trimmed(&self) -> Option<&str> {
        let trimmed = self.0.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

impl From<&str> for Email {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Email {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// A resolved identity. `email` is canonical and may differ from the raw
/// address that resolved to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub email: String,
}

/// Opaque identifier of a message in some user's mailbox.
///
/// Ordered as a plain string, so `msg10` sorts before `msg2`. Listers with
/// numeric ids should zero-pad them (`msg002`, `msg010`) to get numeric
/// report order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message id together with its spam verdict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassifiedMessage {
    pub id: MessageId,
    pub has_spam: bool,
}

impl ClassifiedMessage {
    /// Report line: `"<has_spam> <id>"`.
    pub fn report_line(&self) -> String {
        format!("{} {}", self.has_spam, self.id)
    }
}

// ── Collaborator traits ─────────────────────────────────────────────

/// Resolves a raw address to its canonical user. Must tolerate concurrent calls.
#[async_trait]
pub trait UserResolver: Send + Sync {
    async fn resolve_user(&self, email: &str) -> User;
}

/// Lists the message ids belonging to a batch of users.
#[async_trait]
pub trait MessageLister: Send + Sync {
    async fn list_messages(&self, users: &[User]) -> Result<Vec<MessageId>, CollaboratorError>;
}

/// Decides whether a single message is spam.
#[async_trait]
pub trait SpamClassifier: Send + Sync {
    async fn has_spam(&self, id: &MessageId) -> Result<bool, CollaboratorError>;
}

/// The external services one pipeline run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub users: Arc<dyn UserResolver>,
    pub messages: Arc<dyn MessageLister>,
    pub spam: Arc<dyn SpamClassifier>,
}

// ── Run bookkeeping ─────────────────────────────────────────────────

/// Per-stage counters reported when a stage finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    /// Stage name, as used in logs.
    pub stage: String,
    /// Items read from the stage's input.
    pub received: usize,
    /// Items written to the stage's output.
    pub emitted: usize,
    /// Items dropped on purpose (malformed input, duplicates).
    pub skipped: usize,
    /// Collaborator calls that failed without aborting the run.
    pub failed: usize,
}

impl StageStats {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_trimmed_rejects_blank() {
        assert_eq!(Email::from("  a@x.com ").trimmed(), Some("a@x.com"));
        assert_eq!(Email::from("   ").trimmed(), None);
        assert_eq!(Email::from("").trimmed(), None);
    }

    #[test]
    fn report_line_format() {
        let spam = ClassifiedMessage {
            id: MessageId::from("msg1"),
            has_spam: true,
        };
        let ham = ClassifiedMessage {
            id: MessageId::from("msg2"),
            has_spam: false,
        };
        assert_eq!(spam.report_line(), "true msg1");
        assert_eq!(ham.report_line(), "false msg2");
    }

    #[test]
    fn message_id_orders_lexicographically() {
        let mut ids = vec![MessageId::from("b"), MessageId::from("a"), MessageId::from("c")];
        ids.sort();
        assert_eq!(ids, vec![MessageId::from("a"), MessageId::from("b"), MessageId::from("c")]);
    }

    #[test]
    fn numeric_ids_need_padding_for_numeric_order() {
        assert!(MessageId::from("msg10") < MessageId::from("msg2"));
        assert!(MessageId::from("msg002") < MessageId::from("msg010"));
    }

    #[test]
    fn message_id_serializes_as_string() {
        let json = serde_json::to_value(MessageId::from("msg9")).unwrap();
        assert_eq!(json, serde_json::json!("msg9"));

        let classified: ClassifiedMessage =
            serde_json::from_str(r#"{"id": "m1", "has_spam": true}"#).unwrap();
        assert_eq!(classified.id.as_str(), "m1");
        assert!(classified.has_spam);
    }
}
