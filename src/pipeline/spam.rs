//! Spam classification — bounded fan-out over message ids.
//!
//! A semaphore caps the number of outstanding classifier calls. The stage
//! loop takes a permit before spawning, so a saturated gate stalls intake
//! rather than piling up tasks. A classifier failure is fatal to the run:
//! the subtask cancels the pipeline and the stage reports the failure once
//! its remaining subtasks have unwound.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::error::PipelineError;
use crate::pipeline::stage::{
    Emitter, Stage, StageIo, drain_subtasks, reap_finished, record_failure,
};
use crate::pipeline::types::{ClassifiedMessage, MessageId, SpamClassifier, StageStats};

/// Bounded fan-out stage: `MessageId` → `ClassifiedMessage`.
pub struct ClassifySpam {
    classifier: Arc<dyn SpamClassifier>,
    max_concurrent: usize,
}

impl ClassifySpam {
    /// `max_concurrent` of zero is treated as one.
    pub fn new(classifier: Arc<dyn SpamClassifier>, max_concurrent: usize) -> Self {
        Self {
            classifier,
            max_concurrent: max_concurrent.max(1),
        }
    }
}

#[async_trait]
impl Stage for ClassifySpam {
    type Input = MessageId;
    type Output = ClassifiedMessage;

    fn name(&self) -> &'static str {
        "classify_spam"
    }

    async fn run(
        &self,
        mut io: StageIo<MessageId, ClassifiedMessage>,
    ) -> Result<StageStats, PipelineError> {
        let mut stats = StageStats::new(self.name());
        let gate = Arc::new(Semaphore::new(self.max_concurrent));
        let mut subtasks = JoinSet::new();
        let mut failure = None;

        loop {
            let id = match io.recv().await {
                Ok(Some(id)) => id,
                Ok(None) => break,
                Err(e) => {
                    record_failure(&mut failure, e);
                    break;
                }
            };
            stats.received += 1;

            let emitter = io.emitter();
            // The semaphore is never closed, so acquisition only fails through
            // cancellation.
            let permit = match emitter.until_cancelled(Arc::clone(&gate).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) | Err(_) => {
                    record_failure(&mut failure, PipelineError::Cancelled);
                    break;
                }
            };

            subtasks.spawn(classify_one(Arc::clone(&self.classifier), id, permit, emitter));

            reap_finished(self.name(), &mut subtasks, &mut failure, |()| stats.emitted += 1);
            if failure.is_some() {
                io.cancel_token().cancel();
                break;
            }
        }

        drain_subtasks(self.name(), &mut subtasks, &mut failure, |()| stats.emitted += 1).await;

        match failure {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

/// Classify one message, holding `permit` only for the classifier call.
async fn classify_one(
    classifier: Arc<dyn SpamClassifier>,
    id: MessageId,
    permit: OwnedSemaphorePermit,
    emitter: Emitter<ClassifiedMessage>,
) -> Result<(), PipelineError> {
    let verdict = emitter.until_cancelled(classifier.has_spam(&id)).await;
    drop(permit);

    match verdict? {
        Ok(has_spam) => {
            debug!(id = %id, has_spam, "Message classified");
            emitter.send(ClassifiedMessage { id, has_spam }).await
        }
        Err(source) => {
            error!(id = %id, error = %source, "Spam check failed, cancelling pipeline");
            emitter.cancel();
            Err(PipelineError::Classify {
                message_id: id,
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::error::CollaboratorError;

    /// Tracks how many calls overlap; ids in `spam` are spam, ids in `broken` fail.
    #[derive(Default)]
    struct CountingClassifier {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        spam: HashSet<String>,
        broken: HashSet<String>,
    }

    #[async_trait]
    impl SpamClassifier for CountingClassifier {
        async fn has_spam(&self, id: &MessageId) -> Result<bool, CollaboratorError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(5)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.broken.contains(id.as_str()) {
                return Err(CollaboratorError::new("spam", "classifier crashed"));
            }
            Ok(self.spam.contains(id.as_str()))
        }
    }

    fn ids(n: usize) -> Vec<MessageId> {
        (0..n).map(|i| MessageId::new(format!("m{i:03}"))).collect()
    }

    async fn run_stage(
        classifier: Arc<CountingClassifier>,
        cap: usize,
        input: Vec<MessageId>,
    ) -> (Vec<ClassifiedMessage>, Result<StageStats, PipelineError>) {
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let stage = ClassifySpam::new(classifier, cap);
        let io = StageIo::new(in_rx, out_tx, CancellationToken::new());

        let handle = tokio::spawn(async move { stage.run(io).await });
        tokio::spawn(async move {
            for id in input {
                if in_tx.send(id).await.is_err() {
                    break;
                }
            }
        });

        let mut out = Vec::new();
        while let Some(m) = out_rx.recv().await {
            out.push(m);
        }
        (out, handle.await.unwrap())
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_cap() {
        for cap in [1usize, 3, 5] {
            let classifier = Arc::new(CountingClassifier::default());
            let (out, stats) = run_stage(Arc::clone(&classifier), cap, ids(40)).await;

            assert_eq!(out.len(), 40);
            assert_eq!(stats.unwrap().emitted, 40);
            let peak = classifier.peak.load(Ordering::SeqCst);
            assert!(peak <= cap, "peak {peak} exceeded cap {cap}");
            assert!(peak >= 1);
        }
    }

    #[tokio::test]
    async fn verdicts_follow_classifier() {
        let classifier = Arc::new(CountingClassifier {
            spam: HashSet::from(["m001".to_string()]),
            ..Default::default()
        });
        let (mut out, _) = run_stage(classifier, 2, ids(3)).await;
        out.sort_by(|a, b| a.id.cmp(&b.id));

        let verdicts: Vec<bool> = out.iter().map(|m| m.has_spam).collect();
        assert_eq!(verdicts, vec![false, true, false]);
    }

    #[tokio::test]
    async fn classifier_failure_cancels_and_reports() {
        let classifier = Arc::new(CountingClassifier {
            broken: HashSet::from(["m002".to_string()]),
            ..Default::default()
        });
        let (_, result) = run_stage(Arc::clone(&classifier), 1, ids(200)).await;

        match result {
            Err(PipelineError::Classify { message_id, .. }) => {
                assert_eq!(message_id.as_str(), "m002");
            }
            other => panic!("Expected Classify error, got {other:?}"),
        }
        // Intake stops once the failure is seen.
        assert!(classifier.calls.load(Ordering::SeqCst) < 200);
    }

    /// Panics on `m000`, answers every other id after a short delay.
    #[derive(Default)]
    struct PanickingClassifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SpamClassifier for PanickingClassifier {
        async fn has_spam(&self, id: &MessageId) -> Result<bool, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if id.as_str() == "m000" {
                panic!("classifier crashed");
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(false)
        }
    }

    #[tokio::test]
    async fn subtask_panic_stops_stage_while_input_open() {
        let classifier = Arc::new(PanickingClassifier::default());
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let stage = ClassifySpam::new(Arc::clone(&classifier) as Arc<dyn SpamClassifier>, 1);
        let io = StageIo::new(in_rx, out_tx, cancel.clone());

        let handle = tokio::spawn(async move { stage.run(io).await });
        // The feeder hands the sender back instead of dropping it, so the
        // input never closes.
        let feeder = tokio::spawn(async move {
            for id in ids(500) {
                if in_tx.send(id).await.is_err() {
                    break;
                }
            }
            in_tx
        });
        tokio::spawn(async move { while out_rx.recv().await.is_some() {} });

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("stage kept waiting for input after a subtask panicked")
            .unwrap();

        match result {
            Err(PipelineError::StagePanicked { stage, .. }) => assert_eq!(stage, "classify_spam"),
            other => panic!("Expected StagePanicked, got {other:?}"),
        }
        assert!(cancel.is_cancelled());
        assert!(classifier.calls.load(Ordering::SeqCst) < 500);

        let _in_tx = feeder.await.unwrap();
    }

    #[tokio::test]
    async fn finished_checks_are_counted_while_streaming() {
        let classifier = Arc::new(CountingClassifier::default());
        let (out, stats) = run_stage(classifier, 2, ids(300)).await;

        assert_eq!(out.len(), 300);
        let stats = stats.unwrap();
        assert_eq!(stats.received, 300);
        assert_eq!(stats.emitted, 300);
    }
}
