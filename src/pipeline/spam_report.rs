//! The standard spam-report chain:
//! `ResolveUsers` → `ListMessages` → `ClassifySpam` → `CombineResults`.

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span};

use crate::config::PipelineConfig;
use crate::error::{self, PipelineError};
use crate::pipeline::combine::CombineResults;
use crate::pipeline::engine::{PipelineBuilder, RunSummary, RunningPipeline};
use crate::pipeline::messages::ListMessages;
use crate::pipeline::spam::ClassifySpam;
use crate::pipeline::types::{Collaborators, Email};
use crate::pipeline::users::ResolveUsers;

/// Build the spam-report chain. Emails in, report lines out.
pub fn spam_report_pipeline(
    collaborators: &Collaborators,
    config: &PipelineConfig,
) -> PipelineBuilder<Email, String> {
    PipelineBuilder::new(
        ResolveUsers::new(collaborators.users.clone()),
        config.channel_capacity,
    )
    .then(ListMessages::new(
        collaborators.messages.clone(),
        config.batch_size,
    ))
    .then(ClassifySpam::new(
        collaborators.spam.clone(),
        config.max_concurrent_checks,
    ))
    .then(CombineResults)
}

/// Output of a completed spam-report run.
#[derive(Debug, Clone, Serialize)]
pub struct SpamReport {
    /// `"<has_spam> <message-id>"`, spam first, ids ascending within each group.
    pub lines: Vec<String>,
    pub summary: RunSummary,
}

/// Run the spam-report chain over `emails` and wait for the result.
pub async fn run_spam_report<It, E>(
    emails: It,
    collaborators: &Collaborators,
    config: &PipelineConfig,
) -> Result<SpamReport, PipelineError>
where
    It: IntoIterator<Item = E>,
    It::IntoIter: Send + 'static,
    E: Into<Email> + Send + 'static,
{
    let running = spam_report_pipeline(collaborators, config).start();
    let span = info_span!("spam_report", run_id = %running.handle.run_id());

    let emails = emails.into_iter().map(|email| -> Email { email.into() });
    let (lines, summary) = running.run_to_end(emails).instrument(span.clone()).await?;

    span.in_scope(|| info!(lines = lines.len(), "Spam report complete"));
    Ok(SpamReport { lines, summary })
}

/// Stream newline-separated emails from `reader` through the chain, writing
/// each report line to `writer` as it arrives.
///
/// Reading stops at end of input or once the run is cancelled, so a failed
/// run finishes even if `reader` never reaches EOF.
pub async fn stream_spam_report<R, W>(
    reader: R,
    writer: &mut W,
    collaborators: &Collaborators,
    config: &PipelineConfig,
) -> error::Result<RunSummary>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let RunningPipeline {
        input,
        mut output,
        handle,
    } = spam_report_pipeline(collaborators, config).start();
    let span = info_span!("spam_report", run_id = %handle.run_id());

    let feeder = tokio::spawn(
        feed_lines(reader, input, handle.cancel_token()).instrument(span.clone()),
    );

    let written = match write_lines(&mut output, writer).await {
        Ok(written) => written,
        Err(e) => {
            handle.cancel();
            return Err(e.into());
        }
    };

    let fed = feeder.await.map_err(std::io::Error::other)?;
    let summary = handle.join().instrument(span.clone()).await?;
    let read = fed?;

    span.in_scope(|| info!(emails = read, lines = written, "Spam report streamed"));
    Ok(summary)
}

async fn feed_lines<R>(
    reader: R,
    input: mpsc::Sender<Email>,
    cancel: CancellationToken,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut fed = 0;
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        // Head stage gone: the run is unwinding.
        if input.send(Email::from(line)).await.is_err() {
            break;
        }
        fed += 1;
    }
    Ok(fed)
}

async fn write_lines<W>(
    output: &mut mpsc::Receiver<String>,
    writer: &mut W,
) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(line) = output.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        written += 1;
    }
    writer.flush().await?;
    Ok(written)
}
