//! Message listing — users in, message ids out, one lister call per batch.
//!
//! Users accumulate in a buffer owned by the stage task. A full buffer is
//! handed to a subtask; the final partial batch is flushed inline once the
//! input closes, so the stage only finishes after its ids are forwarded.
//! A failed batch is logged and dropped without affecting the others.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::pipeline::stage::{
    Emitter, Stage, StageIo, drain_subtasks, reap_finished, record_failure,
};
use crate::pipeline::types::{MessageId, MessageLister, StageStats, User};

/// Batching stage: `User` → `MessageId`.
pub struct ListMessages {
    lister: Arc<dyn MessageLister>,
    batch_size: usize,
}

impl ListMessages {
    /// `batch_size` of zero is treated as one.
    pub fn new(lister: Arc<dyn MessageLister>, batch_size: usize) -> Self {
        Self {
            lister,
            batch_size: batch_size.max(1),
        }
    }
}

/// What happened to one batch.
enum BatchOutcome {
    Forwarded(usize),
    Failed,
}

#[async_trait]
impl Stage for ListMessages {
    type Input = User;
    type Output = MessageId;

    fn name(&self) -> &'static str {
        "list_messages"
    }

    async fn run(&self, mut io: StageIo<User, MessageId>) -> Result<StageStats, PipelineError> {
        let mut stats = StageStats::new(self.name());
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut subtasks = JoinSet::new();
        let mut failure = None;

        loop {
            let user = match io.recv().await {
                Ok(Some(user)) => user,
                Ok(None) => break,
                Err(e) => {
                    record_failure(&mut failure, e);
                    break;
                }
            };
            stats.received += 1;
            batch.push(user);

            if batch.len() == self.batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(self.batch_size));
                subtasks.spawn(list_batch(Arc::clone(&self.lister), full, io.emitter()));
            }

            reap_finished(self.name(), &mut subtasks, &mut failure, |outcome| {
                tally(&mut stats, outcome)
            });
            if failure.is_some() {
                io.cancel_token().cancel();
                break;
            }
        }

        if failure.is_none() && !batch.is_empty() {
            debug!(size = batch.len(), "Flushing final partial batch");
            match list_batch(Arc::clone(&self.lister), batch, io.emitter()).await {
                Ok(outcome) => tally(&mut stats, outcome),
                Err(e) => record_failure(&mut failure, e),
            }
        }

        drain_subtasks(self.name(), &mut subtasks, &mut failure, |outcome| {
            tally(&mut stats, outcome)
        })
        .await;

        match failure {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

fn tally(stats: &mut StageStats, outcome: BatchOutcome) {
    match outcome {
        BatchOutcome::Forwarded(n) => stats.emitted += n,
        BatchOutcome::Failed => stats.failed += 1,
    }
}

/// Resolve one batch and forward its ids.
async fn list_batch(
    lister: Arc<dyn MessageLister>,
    batch: Vec<User>,
    emitter: Emitter<MessageId>,
) -> Result<BatchOutcome, PipelineError> {
    let listed = emitter.until_cancelled(lister.list_messages(&batch)).await?;

    let ids = match listed {
        Ok(ids) => ids,
        Err(e) => {
            warn!(
                batch_size = batch.len(),
                error = %e,
                "Listing messages failed, dropping batch"
            );
            return Ok(BatchOutcome::Failed);
        }
    };

    let count = ids.len();
    for id in ids {
        emitter.send(id).await?;
    }
    Ok(BatchOutcome::Forwarded(count))
}
