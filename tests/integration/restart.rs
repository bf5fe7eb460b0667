use std::time::Duration;

use anyhow::Result;
use mixdrop_store::TransferStatus;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Restarts — state on disk carries a transfer across engine lifetimes
// ══════════════════════════════════════════════════════════════════════════════

/// The sender stops while all of its rounds are unresolved. On restart it
/// asks the network how those rounds went, keeps the parts that arrived and
/// resends the rest.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sender_restart_recovers_unresolved_rounds() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new(PAYLOAD_SIZE);
    net.fail_every(2);
    net.hold_queries(true);
    let mut config = test_config();
    config.storage.path = temp_dir("sender");

    let receiver = started_node(&net, &config).await?;
    let sender = disk_node(&net, &config)?;
    sender.engine.start().await?;

    let file = test_file("restart.bin", 4 * 60, 2.0);
    let data = file.data.clone();
    let sent_tid = sender.engine.send(RECEIVER, file, None, Duration::ZERO).await?;
    let recv_tid = deliver_announcement(&sender, &receiver, None)?;

    // One round per worker, none of them answered.
    wait_until("four sends", Duration::from_secs(5), || net.transmitted() == 4).await?;
    wait_until("two deliveries", Duration::from_secs(5), || {
        receiver
            .engine
            .received_progress(recv_tid)
            .map(|p| p.received == 2)
            .unwrap_or(false)
    })
    .await?;
    sender.engine.shutdown().await;
    drop(sender);

    net.hold_queries(false);
    let sender = disk_node(&net, &config)?;
    let progress = sender.engine.sent_progress(sent_tid)?;
    assert_eq!(progress.arrived, 0);
    assert_eq!(progress.status, TransferStatus::Running);
    sender.engine.start().await?;

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
    wait_until("completion notice", Duration::from_secs(5), || {
        sender.announcer.completions() == vec![RECEIVER]
    })
    .await?;

    sender.engine.shutdown().await;
    receiver.engine.shutdown().await;
    let _ = std::fs::remove_dir_all(&config.storage.path);
    Ok(())
}

/// The receiver stops halfway through. A new engine on the same storage
/// picks the transfer back up and registers for the parts still missing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_receiver_restart_keeps_received_parts() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new(PAYLOAD_SIZE);

    // Ten rounds a second so the transfer is still running when we stop.
    let mut slow = test_config();
    slow.sending.max_throughput = 640;
    let sender = started_node(&net, &slow).await?;

    let mut config = test_config();
    config.storage.path = temp_dir("receiver");
    let receiver = disk_node(&net, &config)?;
    receiver.engine.start().await?;

    let file = test_file("resume.bin", 20 * 60, 0.5);
    let data = file.data.clone();
    sender.engine.send(RECEIVER, file, None, Duration::ZERO).await?;
    let recv_tid = deliver_announcement(&sender, &receiver, None)?;

    wait_until("first parts", Duration::from_secs(5), || {
        receiver
            .engine
            .received_progress(recv_tid)
            .map(|p| p.received >= 2)
            .unwrap_or(false)
    })
    .await?;
    net.set_healthy(false);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let before = receiver.engine.received_progress(recv_tid)?.received;
    assert!(before < 20, "finished before the restart");
    receiver.engine.shutdown().await;
    drop(receiver);

    let receiver = disk_node(&net, &config)?;
    assert_eq!(receiver.engine.received_progress(recv_tid)?.received, before);
    receiver.engine.start().await?;
    net.set_healthy(true);

    let received = wait_received(&receiver, recv_tid, Duration::from_secs(15)).await?;
    assert_eq!(received, data);
    wait_until("completion notice", Duration::from_secs(5), || {
        sender.announcer.completions() == vec![RECEIVER]
    })
    .await?;

    sender.engine.shutdown().await;
    receiver.engine.shutdown().await;
    let _ = std::fs::remove_dir_all(&config.storage.path);
    Ok(())
}
