//! Identity resolution — raw emails in, unique canonical users out.
//!
//! Every address is resolved in its own subtask. Different addresses may
//! resolve to the same canonical user (aliases, case variants); a guarded
//! set owned by the stage for the run lets only the first one through.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::PipelineError;
use crate::pipeline::stage::{
    Emitter, Stage, StageIo, drain_subtasks, reap_finished, record_failure,
};
use crate::pipeline::types::{Email, StageStats, User, UserResolver};

/// Dedup fan-out stage: `Email` → `User`.
pub struct ResolveUsers {
    resolver: Arc<dyn UserResolver>,
}

impl ResolveUsers {
    pub fn new(resolver: Arc<dyn UserResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Stage for ResolveUsers {
    type Input = Email;
    type Output = User;

    fn name(&self) -> &'static str {
        "resolve_users"
    }

    async fn run(&self, mut io: StageIo<Email, User>) -> Result<StageStats, PipelineError> {
        let mut stats = StageStats::new(self.name());
        let seen: Arc<Mutex<HashSet<String>>> = Arc::default();
        let mut subtasks = JoinSet::new();
        let mut failure = None;

        loop {
            let email = match io.recv().await {
                Ok(Some(email)) => email,
                Ok(None) => break,
                Err(e) => {
                    record_failure(&mut failure, e);
                    break;
                }
            };
            stats.received += 1;

            let Some(address) = email.trimmed() else {
                debug!("Skipping empty email");
                stats.skipped += 1;
                continue;
            };
            let address = address.to_string();

            let resolver = Arc::clone(&self.resolver);
            let seen = Arc::clone(&seen);
            let emitter = io.emitter();

            subtasks.spawn(resolve_one(resolver, address, seen, emitter));

            reap_finished(self.name(), &mut subtasks, &mut failure, |forwarded| {
                count_resolution(&mut stats, forwarded)
            });
            if failure.is_some() {
                io.cancel_token().cancel();
                break;
            }
        }

        drain_subtasks(self.name(), &mut subtasks, &mut failure, |forwarded| {
            count_resolution(&mut stats, forwarded)
        })
        .await;

        match failure {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

fn count_resolution(stats: &mut StageStats, forwarded: bool) {
    if forwarded {
        stats.emitted += 1;
    } else {
        stats.skipped += 1;
    }
}

/// Resolve one address and forward the user if nobody forwarded it first.
/// Returns whether the user was forwarded.
async fn resolve_one(
    resolver: Arc<dyn UserResolver>,
    address: String,
    seen: Arc<Mutex<HashSet<String>>>,
    emitter: Emitter<User>,
) -> Result<bool, PipelineError> {
    let user = emitter
        .until_cancelled(resolver.resolve_user(&address))
        .await?;

    let first = seen.lock().await.insert(user.email.clone());
    if !first {
        debug!(email = %address, canonical = %user.email, "Duplicate user dropped");
        return Ok(false);
    }

    emitter.send(user).await?;
    Ok(true)
}
