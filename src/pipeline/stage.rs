//! Stage abstraction — one unit of pipeline work bound to its neighbours.
//!
//! A stage reads from a typed receiver and writes to a typed sender. It
//! signals end-of-data by returning: the engine drops its `StageIo`, which
//! closes the output channel for the next stage.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::pipeline::types::StageStats;

/// A single processing step in a pipeline.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Stage name, used in logs and run summaries.
    fn name(&self) -> &'static str;

    /// Consume `io.input` until it closes (or the run is cancelled).
    async fn run(
        &self,
        io: StageIo<Self::Input, Self::Output>,
    ) -> Result<StageStats, PipelineError>;
}

/// The channels and cancellation signal handed to a running stage.
pub struct StageIo<I, O> {
    input: mpsc::Receiver<I>,
    emitter: Emitter<O>,
}

impl<I, O> StageIo<I, O> {
    pub fn new(
        input: mpsc::Receiver<I>,
        output: mpsc::Sender<O>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            input,
            emitter: Emitter { tx: output, cancel },
        }
    }

    /// Next input item, `Ok(None)` once upstream closes.
    pub async fn recv(&mut self) -> Result<Option<I>, PipelineError> {
        tokio::select! {
            biased;
            _ = self.emitter.cancel.cancelled() => Err(PipelineError::Cancelled),
            item = self.input.recv() => Ok(item),
        }
    }

    pub async fn send(&self, item: O) -> Result<(), PipelineError> {
        self.emitter.send(item).await
    }

    /// A cloneable output handle for subtasks.
    pub fn emitter(&self) -> Emitter<O> {
        self.emitter.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.emitter.cancel
    }
}

/// Output side of a stage, shared with the subtasks it spawns.
pub struct Emitter<O> {
    tx: mpsc::Sender<O>,
    cancel: CancellationToken,
}

impl<O> Clone for Emitter<O> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<O> Emitter<O> {
    /// Forward one item downstream. A closed downstream means the run is
    /// unwinding, so it reports as `Cancelled`.
    pub async fn send(&self, item: O) -> Result<(), PipelineError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            sent = self.tx.send(item) => sent.map_err(|_| PipelineError::Cancelled),
        }
    }

    /// Run `fut` unless the pipeline is cancelled first.
    pub async fn until_cancelled<F: Future>(&self, fut: F) -> Result<F::Output, PipelineError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Signal every task in the run to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Keep the more informative of two failures: anything beats `Cancelled`,
/// otherwise the first one recorded wins.
pub(crate) fn record_failure(slot: &mut Option<PipelineError>, err: PipelineError) {
    match slot {
        Some(existing) if !existing.is_cancelled() => {}
        Some(_) if err.is_cancelled() => {}
        _ => *slot = Some(err),
    }
}

/// Collect every subtask that has already finished, without waiting.
///
/// Stages call this after each spawn so finished tasks do not pile up in
/// the set and a failed subtask is noticed while input is still flowing.
pub(crate) fn reap_finished<T: 'static>(
    stage: &'static str,
    subtasks: &mut JoinSet<Result<T, PipelineError>>,
    failure: &mut Option<PipelineError>,
    mut on_done: impl FnMut(T),
) {
    while let Some(joined) = subtasks.try_join_next() {
        settle(stage, joined, failure, &mut on_done);
    }
}

/// Await every subtask in `subtasks`, feeding successes to `on_done` and
/// recording failures into `failure`.
pub(crate) async fn drain_subtasks<T: 'static>(
    stage: &'static str,
    subtasks: &mut JoinSet<Result<T, PipelineError>>,
    failure: &mut Option<PipelineError>,
    mut on_done: impl FnMut(T),
) {
    while let Some(joined) = subtasks.join_next().await {
        settle(stage, joined, failure, &mut on_done);
    }
}

fn settle<T>(
    stage: &'static str,
    joined: Result<Result<T, PipelineError>, JoinError>,
    failure: &mut Option<PipelineError>,
    on_done: &mut impl FnMut(T),
) {
    match joined {
        Ok(Ok(value)) => on_done(value),
        Ok(Err(e)) => record_failure(failure, e),
        Err(join_err) => record_failure(
            failure,
            PipelineError::StagePanicked {
                stage,
                reason: join_err.to_string(),
            },
        ),
    }
}
