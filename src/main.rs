use std::sync::Arc;

use anyhow::Context;
use tokio::io::BufReader;
use tracing::{info, warn};

use spamsift::config::PipelineConfig;
use spamsift::directory::MailDirectory;
use spamsift::pipeline::stream_spam_report;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout carries only report lines.
    let (log_writer, _log_guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(log_writer)
        .init();

    let config = PipelineConfig::from_env();
    config.validate()?;

    let directory = match std::env::var("SPAMSIFT_DIRECTORY") {
        Ok(path) => MailDirectory::load(&path)
            .with_context(|| format!("failed to load mail directory from {path}"))?,
        Err(_) => {
            warn!("SPAMSIFT_DIRECTORY not set, every address resolves to an empty mailbox");
            MailDirectory::default()
        }
    };
    let collaborators = Arc::new(directory).collaborators();

    info!(
        batch_size = config.batch_size,
        max_concurrent_checks = config.max_concurrent_checks,
        "spamsift v{}",
        env!("CARGO_PKG_VERSION")
    );

    let summary = stream_spam_report(
        BufReader::new(tokio::io::stdin()),
        &mut tokio::io::stdout(),
        &collaborators,
        &config,
    )
    .await?;

    for stage in &summary.stages {
        info!(
            stage = %stage.stage,
            received = stage.received,
            emitted = stage.emitted,
            skipped = stage.skipped,
            failed = stage.failed,
            "Stage summary"
        );
    }

    Ok(())
}
