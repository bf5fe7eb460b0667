use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mixdrop_engine::{EngineError, SentProgressCallback, TransferError};
use mixdrop_store::{SentProgress, TransferStatus};
use tokio::sync::mpsc;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Fingerprint exhaustion
// ══════════════════════════════════════════════════════════════════════════════

/// With no retries allowed and every round lost, each part is sent exactly
/// once. The first part that needs a second attempt fails the transfer, and
/// the error reaches the callback once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exhausted_fingerprints_fail_the_transfer() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new(PAYLOAD_SIZE);
    net.fail_every(1);
    let sender = started_node(&net, &test_config()).await?;

    let (error_tx, mut errors) = mpsc::unbounded_channel();
    let progress: SentProgressCallback =
        Arc::new(move |_: &SentProgress, err: Option<&TransferError>| {
            if let Some(err) = err {
                let _ = error_tx.send(err.clone());
            }
        });

    let tid = sender
        .engine
        .send(RECEIVER, test_file("doomed.bin", 5 * 60, 0.0), Some(progress), Duration::ZERO)
        .await?;

    let err = tokio::time::timeout(Duration::from_secs(10), errors.recv())
        .await?
        .expect("error channel closed");
    assert_eq!(err, TransferError::RetriesExhausted);
    assert_eq!(err.to_string(), "file transfer failed: ran out of retries");

    let progress = sender.engine.sent_progress(tid)?;
    assert_eq!(progress.status, TransferStatus::Failed);
    assert_eq!(progress.arrived, 0);
    assert!(!progress.completed);

    // Parts still queued for the failed transfer are dropped unsent.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(net.transmitted(), 5);
    assert!(errors.try_recv().is_err(), "error reported twice");
    assert!(sender.announcer.completions().is_empty());

    sender.engine.close_send(tid)?;
    assert!(matches!(
        sender.engine.sent_progress(tid),
        Err(EngineError::NoTransfer(_))
    ));

    sender.engine.shutdown().await;
    Ok(())
}

/// A receiver that never gets every part cannot hand out the file.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_incomplete_file_is_not_returned() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new(PAYLOAD_SIZE);
    net.fail_every(1);
    let config = test_config();
    let sender = started_node(&net, &config).await?;
    let receiver = started_node(&net, &config).await?;

    sender
        .engine
        .send(RECEIVER, test_file("lost.bin", 3 * 60, 0.0), None, Duration::ZERO)
        .await?;
    let recv_tid = deliver_announcement(&sender, &receiver, None)?;

    wait_until("three sends", Duration::from_secs(5), || net.transmitted() == 3).await?;
    let err = receiver.engine.receive(recv_tid).unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot get incomplete file: missing 3 of 3 parts"
    );
    assert_eq!(net.registered_fingerprints(), 3);

    sender.engine.shutdown().await;
    receiver.engine.shutdown().await;
    Ok(())
}
