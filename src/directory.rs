//! In-memory mail directory — a self-contained implementation of all three
//! collaborators, loadable from a JSON fixture.
//!
//! ```json
//! {
//!   "users": [{"id": 1, "email": "a@x.com", "aliases": ["alias@x.com"]}],
//!   "mailboxes": {"a@x.com": ["msg1", "msg2"]},
//!   "spam": ["msg1"],
//!   "broken_messages": [],
//!   "offline_mailboxes": [],
//!   "latency_ms": 0
//! }
//! ```
//!
//! Addresses are matched case-insensitively. Unknown addresses resolve to a
//! synthetic user whose canonical email is the lowercased address.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{CollaboratorError, DirectoryError};
use crate::pipeline::types::{
    Collaborators, MessageId, MessageLister, SpamClassifier, User, UserResolver,
};

/// On-disk shape of a directory fixture.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DirectoryFixture {
    pub users: Vec<UserEntry>,
    /// Canonical email → message ids.
    pub mailboxes: HashMap<String, Vec<MessageId>>,
    pub spam: Vec<MessageId>,
    /// Messages whose spam check fails.
    pub broken_messages: Vec<MessageId>,
    /// Canonical emails whose mailbox listing fails.
    pub offline_mailboxes: Vec<String>,
    /// Base delay applied to every call, with up to 50% random jitter.
    pub latency_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct UserEntry {
    pub id: u64,
    pub email: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Directory of users, mailboxes and spam verdicts.
#[derive(Debug, Default)]
pub struct MailDirectory {
    /// Lowercased address (canonical or alias) → user.
    by_address: HashMap<String, User>,
    mailboxes: HashMap<String, Vec<MessageId>>,
    spam: HashSet<MessageId>,
    broken: HashSet<MessageId>,
    offline: HashSet<String>,
    latency: Duration,
}

impl MailDirectory {
    /// Load a fixture from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let directory = Self::from_json(&raw)?;
        info!(
            path = %path.display(),
            addresses = directory.by_address.len(),
            mailboxes = directory.mailboxes.len(),
            "Loaded mail directory"
        );
        Ok(directory)
    }

    pub fn from_json(raw: &str) -> Result<Self, DirectoryError> {
        let fixture: DirectoryFixture = serde_json::from_str(raw)?;
        Self::from_fixture(fixture)
    }

    pub fn from_fixture(fixture: DirectoryFixture) -> Result<Self, DirectoryError> {
        let mut by_address = HashMap::new();

        for entry in fixture.users {
            let user = User {
                id: entry.id,
                email: entry.email.to_lowercase(),
            };
            let addresses = std::iter::once(&entry.email).chain(entry.aliases.iter());
            for address in addresses {
                let key = address.to_lowercase();
                if by_address.insert(key.clone(), user.clone()).is_some() {
                    return Err(DirectoryError::DuplicateUser(key));
                }
            }
        }

        Ok(Self {
            by_address,
            mailboxes: fixture
                .mailboxes
                .into_iter()
                .map(|(email, ids)| (email.to_lowercase(), ids))
                .collect(),
            spam: fixture.spam.into_iter().collect(),
            broken: fixture.broken_messages.into_iter().collect(),
            offline: fixture
                .offline_mailboxes
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
            latency: Duration::from_millis(fixture.latency_ms),
        })
    }

    /// Share this directory as every collaborator of a run.
    pub fn collaborators(self: Arc<Self>) -> Collaborators {
        Collaborators {
            users: self.clone(),
            messages: self.clone(),
            spam: self,
        }
    }

    async fn simulate_latency(&self) {
        if self.latency.is_zero() {
            return;
        }
        let delay = self.latency + jitter(self.latency / 2);
        tokio::time::sleep(delay).await;
    }
}

fn jitter(max: Duration) -> Duration {
    let max_micros = max.as_micros() as u64;
    if max_micros == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rand::thread_rng().gen_range(0..=max_micros))
}

/// Stable id for an address the directory does not know.
fn synthetic_id(canonical: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    hasher.finish()
}

#[async_trait]
impl UserResolver for MailDirectory {
    async fn resolve_user(&self, email: &str) -> User {
        self.simulate_latency().await;

        let key = email.to_lowercase();
        match self.by_address.get(&key) {
            Some(user) => user.clone(),
            None => {
                debug!(email = %key, "Unknown address, using synthetic user");
                User {
                    id: synthetic_id(&key),
                    email: key,
                }
            }
        }
    }
}

#[async_trait]
impl MessageLister for MailDirectory {
    async fn list_messages(&self, users: &[User]) -> Result<Vec<MessageId>, CollaboratorError> {
        self.simulate_latency().await;

        if let Some(user) = users.iter().find(|u| self.offline.contains(&u.email)) {
            return Err(CollaboratorError::new(
                "messages",
                format!("mailbox {} is offline", user.email),
            ));
        }

        Ok(users
            .iter()
            .filter_map(|u| self.mailboxes.get(&u.email))
            .flatten()
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SpamClassifier for MailDirectory {
    async fn has_spam(&self, id: &MessageId) -> Result<bool, CollaboratorError> {
        self.simulate_latency().await;

        if self.broken.contains(id) {
            return Err(CollaboratorError::new(
                "spam",
                format!("classifier rejected message {id}"),
            ));
        }
        Ok(self.spam.contains(id))
    }
}
