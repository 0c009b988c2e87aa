//! Tests for streaming a report from a line reader to a writer, the path the
//! binary takes with stdin and stdout.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::time::timeout;

use spamsift::config::PipelineConfig;
use spamsift::directory::MailDirectory;
use spamsift::error::{Error, PipelineError};
use spamsift::pipeline::stream_spam_report;
use spamsift::pipeline::types::Collaborators;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn directory(broken: &[&str]) -> Collaborators {
    let fixture = serde_json::json!({
        "users": [
            {"id": 1, "email": "a@x.com"},
            {"id": 2, "email": "b@x.com"}
        ],
        "mailboxes": {"a@x.com": ["msg1"], "b@x.com": ["msg2"]},
        "spam": ["msg1"],
        "broken_messages": broken,
    });
    Arc::new(MailDirectory::from_json(&fixture.to_string()).unwrap()).collaborators()
}

#[tokio::test]
async fn writes_one_line_per_message() {
    let input: &[u8] = b"a@x.com\n\nb@x.com\nA@x.com\n";
    let mut out = Vec::new();

    let summary = timeout(
        TEST_TIMEOUT,
        stream_spam_report(input, &mut out, &directory(&[]), &PipelineConfig::default()),
    )
    .await
    .expect("report hung")
    .unwrap();

    assert_eq!(String::from_utf8(out).unwrap(), "true msg1\nfalse msg2\n");

    let users = summary.stage("resolve_users").unwrap();
    assert_eq!(users.received, 4);
    assert_eq!(users.emitted, 2);
    assert_eq!(users.skipped, 2);
}

#[tokio::test]
async fn empty_reader_writes_nothing() {
    let input: &[u8] = b"";
    let mut out = Vec::new();

    let summary = timeout(
        TEST_TIMEOUT,
        stream_spam_report(input, &mut out, &directory(&[]), &PipelineConfig::default()),
    )
    .await
    .expect("report hung")
    .unwrap();

    assert!(out.is_empty());
    assert_eq!(summary.stages.len(), 4);
}

#[tokio::test]
async fn failure_ends_run_while_reader_stays_open() {
    let (reader, mut feed) = tokio::io::duplex(1024);
    feed.write_all(b"a@x.com\n").await.unwrap();
    let mut out = Vec::new();

    // `feed` stays alive, so the reader never reaches EOF.
    let result = timeout(
        TEST_TIMEOUT,
        stream_spam_report(
            BufReader::new(reader),
            &mut out,
            &directory(&["msg1"]),
            &PipelineConfig::default().with_batch_size(1),
        ),
    )
    .await
    .expect("report kept reading after the run failed");

    match result {
        Err(Error::Pipeline(err)) => match err.root_cause() {
            PipelineError::Classify { message_id, .. } => assert_eq!(message_id.as_str(), "msg1"),
            other => panic!("Expected Classify root cause, got {other:?}"),
        },
        other => panic!("Expected pipeline error, got {other:?}"),
    }
    assert!(out.is_empty());
    drop(feed);
}
