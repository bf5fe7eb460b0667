use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mixdrop_core::wire::PART_HEADER_LEN;
use mixdrop_engine::{EngineError, ReceivedProgressCallback, SentProgressCallback, TransferError};
use mixdrop_store::{ReceivedProgress, SentProgress, TransferStatus};
use tokio::sync::mpsc;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  End to end — sender and receiver over the simulated network
// ══════════════════════════════════════════════════════════════════════════════

/// A 16-part file over a network that loses every 4th round. Lost parts are
/// resent under fresh fingerprints until all of them arrive.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_survives_lossy_network() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new(PAYLOAD_SIZE);
    net.fail_every(4);
    let config = test_config();
    let sender = started_node(&net, &config).await?;
    let receiver = started_node(&net, &config).await?;

    let (report_tx, mut reports) = mpsc::unbounded_channel();
    let progress: SentProgressCallback =
        Arc::new(move |p: &SentProgress, err: Option<&TransferError>| {
            let _ = report_tx.send((p.arrived, p.total, p.completed, err.cloned()));
        });

    let file = test_file("lossy.bin", 16 * 60, 0.5);
    let data = file.data.clone();
    let sent_tid = sender
        .engine
        .send(RECEIVER, file, Some(progress), Duration::ZERO)
        .await?;
    let recv_tid = deliver_announcement(&sender, &receiver, None)?;

    let received = wait_received(&receiver, recv_tid, Duration::from_secs(10)).await?;
    assert_eq!(received, data, "file corrupted in transit");

    // Registration reports right away; the last report is the completion.
    let first = reports.recv().await.expect("initial report");
    assert_eq!(first, (0, 16, false, None));
    loop {
        let (arrived, total, completed, err) =
            tokio::time::timeout(Duration::from_secs(10), reports.recv())
                .await?
                .expect("progress channel closed");
        assert_eq!(total, 16);
        assert!(err.is_none(), "unexpected error: {err:?}");
        if completed {
            assert_eq!(arrived, 16);
            break;
        }
    }

    // 16 deliveries with every 4th round lost takes 21 sends.
    assert_eq!(net.transmitted(), 21);

    wait_until("completion notice", Duration::from_secs(5), || {
        sender.announcer.completions() == vec![RECEIVER]
    })
    .await?;
    assert_eq!(net.registered_fingerprints(), 0, "receive fingerprints left behind");

    sender.engine.close_send(sent_tid)?;
    assert!(matches!(
        sender.engine.sent_progress(sent_tid),
        Err(EngineError::NoTransfer(_))
    ));

    sender.engine.shutdown().await;
    receiver.engine.shutdown().await;
    Ok(())
}

/// A 4 KiB file in 256-byte parts over a network that loses every 3rd
/// round. With retry 0.5 it has 24 fingerprints; the 16 deliveries take 23
/// sends, so exhaustion is one lost round away.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_four_kib_file_with_every_third_round_lost() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new(256 + PART_HEADER_LEN);
    net.fail_every(3);
    let config = test_config();
    let sender = started_node(&net, &config).await?;
    let receiver = started_node(&net, &config).await?;

    let file = test_file("report.pdf", 4096, 0.5);
    let data = file.data.clone();
    let sent_tid = sender.engine.send(RECEIVER, file, None, Duration::ZERO).await?;
    let recv_tid = deliver_announcement(&sender, &receiver, None)?;

    let received = wait_received(&receiver, recv_tid, Duration::from_secs(10)).await?;
    assert_eq!(received, data, "file corrupted in transit");

    wait_until("sender completion", Duration::from_secs(5), || {
        sender
            .engine
            .sent_progress(sent_tid)
            .map(|p| p.status == TransferStatus::Completed)
            .unwrap_or(false)
    })
    .await?;
    let progress = sender.engine.sent_progress(sent_tid)?;
    assert_eq!((progress.arrived, progress.total), (16, 16));
    assert_eq!(net.transmitted(), 23);

    sender.engine.shutdown().await;
    receiver.engine.shutdown().await;
    Ok(())
}

/// Several transfers share rounds of up to 11 parts. Every transfer
/// completes with its own bytes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_share_rounds() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new(PAYLOAD_SIZE);
    net.fail_every(3);
    let mut config = test_config();
    config.sending.max_parts_per_round = 11;
    let sender = started_node(&net, &config).await?;
    let receiver = started_node(&net, &config).await?;

    let mut pending = Vec::new();
    for (name, len) in [("a.bin", 600), ("b.bin", 1000), ("c.bin", 250)] {
        let file = test_file(name, len, 3.0);
        let data = file.data.clone();
        let sent_tid = sender.engine.send(RECEIVER, file, None, Duration::ZERO).await?;
        let recv_tid = deliver_announcement(&sender, &receiver, None)?;
        pending.push((sent_tid, recv_tid, data));
    }

    for (sent_tid, recv_tid, data) in pending {
        let received = wait_received(&receiver, recv_tid, Duration::from_secs(10)).await?;
        assert_eq!(received, data);
        wait_until("sender completion", Duration::from_secs(5), || {
            sender
                .engine
                .sent_progress(sent_tid)
                .map(|p| p.status == TransferStatus::Completed)
                .unwrap_or(false)
        })
        .await?;
    }
    wait_until("completion notices", Duration::from_secs(5), || {
        sender.announcer.completions().len() == 3
    })
    .await?;

    sender.engine.shutdown().await;
    receiver.engine.shutdown().await;
    Ok(())
}

/// The receiver's callback sees the count climb to the total.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_receiver_progress_reaches_total() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new(PAYLOAD_SIZE);
    let config = test_config();
    let sender = started_node(&net, &config).await?;
    let receiver = started_node(&net, &config).await?;

    let (report_tx, mut reports) = mpsc::unbounded_channel();
    let progress: ReceivedProgressCallback =
        Arc::new(move |p: &ReceivedProgress, _: Option<&TransferError>| {
            let _ = report_tx.send((p.received, p.total, p.completed));
        });

    sender
        .engine
        .send(RECEIVER, test_file("progress.bin", 500, 0.5), None, Duration::ZERO)
        .await?;
    let recv_tid = deliver_announcement(&sender, &receiver, Some(progress))?;

    let mut last = None;
    while let Ok(Some(report)) =
        tokio::time::timeout(Duration::from_secs(10), reports.recv()).await
    {
        last = Some(report);
        if report.2 {
            break;
        }
    }
    assert_eq!(last, Some((9, 9, true)));

    let tracker = receiver.engine.received_progress(recv_tid)?.tracker;
    assert_eq!(tracker.num_parts(), 9);

    sender.engine.shutdown().await;
    receiver.engine.shutdown().await;
    Ok(())
}

/// Sending refuses an unhealthy network; a transfer interrupted by an
/// outage finishes once the network recovers.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_outage_pauses_and_resumes_sending() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new(PAYLOAD_SIZE);
    let config = test_config();
    let sender = started_node(&net, &config).await?;
    let receiver = started_node(&net, &config).await?;

    net.set_healthy(false);
    let refused = sender
        .engine
        .send(RECEIVER, test_file("early.bin", 100, 0.5), None, Duration::ZERO)
        .await;
    assert!(matches!(refused, Err(EngineError::NetworkUnhealthy)));

    net.set_healthy(true);
    let file = test_file("outage.bin", 20 * 60, 2.0);
    let data = file.data.clone();
    sender.engine.send(RECEIVER, file, None, Duration::ZERO).await?;
    let recv_tid = deliver_announcement(&sender, &receiver, None)?;

    net.set_healthy(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let during = net.transmitted();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(net.transmitted(), during, "sent while unhealthy");

    net.set_healthy(true);
    let received = wait_received(&receiver, recv_tid, Duration::from_secs(10)).await?;
    assert_eq!(received, data);

    sender.engine.shutdown().await;
    receiver.engine.shutdown().await;
    Ok(())
}
