//! Result aggregation — the barrier at the end of the chain.
//!
//! Buffers every classified message until upstream closes, then emits one
//! report line per message: spam first, each group ascending by id.

use std::cmp::Ordering;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::pipeline::stage::{Stage, StageIo};
use crate::pipeline::types::{ClassifiedMessage, StageStats};

/// Barrier stage: `ClassifiedMessage` → report line.
#[derive(Debug, Default)]
pub struct CombineResults;

#[async_trait]
impl Stage for CombineResults {
    type Input = ClassifiedMessage;
    type Output = String;

    fn name(&self) -> &'static str {
        "combine_results"
    }

    async fn run(
        &self,
        mut io: StageIo<ClassifiedMessage, String>,
    ) -> Result<StageStats, PipelineError> {
        let mut stats = StageStats::new(self.name());
        let mut results = Vec::new();

        while let Some(message) = io.recv().await? {
            stats.received += 1;
            results.push(message);
        }

        sort_for_report(&mut results);

        for message in &results {
            io.send(message.report_line()).await?;
            stats.emitted += 1;
        }
        Ok(stats)
    }
}

/// Report order: `has_spam` descending, then id ascending.
pub fn report_order(a: &ClassifiedMessage, b: &ClassifiedMessage) -> Ordering {
    b.has_spam.cmp(&a.has_spam).then_with(|| a.id.cmp(&b.id))
}

pub fn sort_for_report(results: &mut [ClassifiedMessage]) {
    results.sort_by(report_order);
}
