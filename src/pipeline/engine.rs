//! Pipeline engine — wires stages into a chain and supervises their tasks.
//!
//! The engine owns no business logic. It creates one bounded channel between
//! each pair of adjacent stages, spawns one task per stage, and joins them.
//! The head sender and tail receiver are handed back to the caller, who
//! feeds the former (dropping it to signal end-of-input) and drains the
//! latter until it closes.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span};
use uuid::Uuid;

use crate::error::{PipelineError, StageFailure};
use crate::pipeline::stage::{Stage, StageIo};
use crate::pipeline::types::StageStats;

type StageResult = Result<StageStats, PipelineError>;

/// Deferred spawn of one stage, bound to its input and output channels.
type Launcher = Box<dyn FnOnce(CancellationToken, Span) -> JoinHandle<StageResult> + Send>;

/// Builder for a typed chain of stages.
///
/// `I` is the head input type, `O` the current tail output type. Each
/// `then` call checks at compile time that the new stage consumes `O`.
pub struct PipelineBuilder<I, O> {
    channel_capacity: usize,
    head: mpsc::Sender<I>,
    tail: mpsc::Receiver<O>,
    stages: Vec<(&'static str, Launcher)>,
}

impl<I, O> PipelineBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Start a chain with `stage` at its head.
    pub fn new<S>(stage: S, channel_capacity: usize) -> Self
    where
        S: Stage<Input = I, Output = O>,
    {
        let channel_capacity = channel_capacity.max(1);
        let (head, input) = mpsc::channel(channel_capacity);
        let (output, tail) = mpsc::channel(channel_capacity);
        let name = stage.name();

        Self {
            channel_capacity,
            head,
            tail,
            stages: vec![(name, launcher(stage, input, output))],
        }
    }

    /// Append `stage`, fed by the current tail.
    pub fn then<S>(self, stage: S) -> PipelineBuilder<I, S::Output>
    where
        S: Stage<Input = O>,
    {
        let Self {
            channel_capacity,
            head,
            tail,
            mut stages,
        } = self;

        let (output, next_tail) = mpsc::channel(channel_capacity);
        stages.push((stage.name(), launcher(stage, tail, output)));

        PipelineBuilder {
            channel_capacity,
            head,
            tail: next_tail,
            stages,
        }
    }

    /// Stage names in chain order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|(name, _)| *name).collect()
    }

    /// Spawn every stage. Must be called from within a tokio runtime.
    pub fn start(self) -> RunningPipeline<I, O> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let cancel = CancellationToken::new();

        info!(%run_id, stages = self.stages.len(), "Starting pipeline");

        let tasks = self
            .stages
            .into_iter()
            .map(|(name, launch)| {
                let span = info_span!("stage", %run_id, stage = name);
                (name, launch(cancel.clone(), span))
            })
            .collect();

        RunningPipeline {
            input: self.head,
            output: self.tail,
            handle: PipelineHandle {
                run_id,
                started_at,
                cancel,
                tasks,
            },
        }
    }
}

fn launcher<S: Stage>(
    stage: S,
    input: mpsc::Receiver<S::Input>,
    output: mpsc::Sender<S::Output>,
) -> Launcher {
    Box::new(move |cancel: CancellationToken, span: Span| {
        tokio::spawn(
            async move {
                debug!("Stage started");
                let io = StageIo::new(input, output, cancel.clone());
                // `io` is consumed here, so the output channel closes as soon
                // as `run` returns.
                let result = stage.run(io).await;

                match &result {
                    Ok(stats) => info!(
                        received = stats.received,
                        emitted = stats.emitted,
                        skipped = stats.skipped,
                        failed = stats.failed,
                        "Stage finished"
                    ),
                    Err(e) if e.is_cancelled() => debug!("Stage cancelled"),
                    Err(e) => {
                        error!(error = %e, "Stage failed, cancelling pipeline");
                        cancel.cancel();
                    }
                }
                result
            }
            .instrument(span),
        )
    })
}

/// A started pipeline: the caller's ends of the chain plus the join handle.
pub struct RunningPipeline<I, O> {
    /// Head of the chain. Drop it to signal end-of-input.
    pub input: mpsc::Sender<I>,
    /// Tail of the chain. Yields `None` once the last stage finishes.
    pub output: mpsc::Receiver<O>,
    pub handle: PipelineHandle,
}

impl<I, O> RunningPipeline<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Feed `items`, close the head, drain the tail and join every stage.
    pub async fn run_to_end<It>(self, items: It) -> Result<(Vec<O>, RunSummary), PipelineError>
    where
        It: IntoIterator<Item = I>,
        It::IntoIter: Send + 'static,
    {
        let Self {
            input,
            output,
            handle,
        } = self;

        let items = items.into_iter();
        let feeder = tokio::spawn(async move {
            for item in items {
                // Head stage gone: the run is unwinding.
                if input.send(item).await.is_err() {
                    break;
                }
            }
        });

        let collected: Vec<O> = ReceiverStream::new(output).collect().await;

        if let Err(e) = feeder.await {
            error!(error = %e, "Input feeder task failed");
        }

        let summary = handle.join().await?;
        Ok((collected, summary))
    }
}

/// Supervises the stage tasks of one run.
pub struct PipelineHandle {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<StageResult>)>,
}

impl PipelineHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Ask every stage to stop. `join` will then report `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that fires when the run is cancelled (by the caller or by a
    /// failing stage).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for every stage task.
    ///
    /// Returns the per-stage stats, or one aggregated error naming each
    /// failing stage. Follow-on `Cancelled` results are dropped when a
    /// stage reported a root cause.
    pub async fn join(self) -> Result<RunSummary, PipelineError> {
        let (names, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        let results = futures::future::join_all(handles).await;

        let mut stages = Vec::with_capacity(results.len());
        let mut failures = Vec::new();

        for (stage, joined) in names.into_iter().zip(results) {
            match joined {
                Ok(Ok(stats)) => stages.push(stats),
                Ok(Err(error)) => failures.push(StageFailure { stage, error }),
                Err(join_err) => failures.push(StageFailure {
                    stage,
                    error: PipelineError::StagePanicked {
                        stage,
                        reason: join_err.to_string(),
                    },
                }),
            }
        }

        if failures.is_empty() {
            let summary = RunSummary {
                run_id: self.run_id,
                started_at: self.started_at,
                finished_at: Utc::now(),
                stages,
            };
            info!(run_id = %summary.run_id, "Pipeline finished");
            return Ok(summary);
        }

        if failures.iter().all(|f| f.error.is_cancelled()) {
            info!(run_id = %self.run_id, "Pipeline cancelled");
            return Err(PipelineError::Cancelled);
        }

        failures.retain(|f| !f.error.is_cancelled());
        error!(
            run_id = %self.run_id,
            failed_stages = failures.len(),
            "Pipeline aborted"
        );
        Err(PipelineError::Aborted { failures })
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One entry per stage, in chain order.
    pub stages: Vec<StageStats>,
}

impl RunSummary {
    pub fn stage(&self, name: &str) -> Option<&StageStats> {
        self.stages.iter().find(|s| s.stage == name)
    }
}
