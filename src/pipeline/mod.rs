//! Multi-stage concurrent spam-report pipeline.
//!
//! Raw emails flow through:
//! 1. `ResolveUsers` — concurrent identity lookups, duplicates suppressed
//! 2. `ListMessages` — users batched into message-listing calls
//! 3. `ClassifySpam` — spam checks behind a concurrency gate
//! 4. `CombineResults` — barrier that sorts and formats the report
//!
//! Each stage runs as its own task, linked to its neighbours by a bounded
//! channel. A classifier failure cancels the whole run and surfaces as a
//! single error from `PipelineHandle::join`.

pub mod combine;
pub mod engine;
pub mod messages;
pub mod spam;
pub mod spam_report;
pub mod stage;
pub mod types;
pub mod users;

pub use engine::{PipelineBuilder, PipelineHandle, RunSummary, RunningPipeline};
pub use spam_report::{SpamReport, run_spam_report, spam_report_pipeline, stream_spam_report};
pub use stage::{Emitter, Stage, StageIo};
