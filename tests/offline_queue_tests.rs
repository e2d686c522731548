// Offline sends: queue while disconnected, deliver on reconnect

use anyhow::Result;
use std::sync::atomic::Ordering;
use std::time::Duration;

mod common;
use common::{fast_queue_config, wait_for_messages, Harness, CONVERSATION_ID};

use parley::models::QueueStatus;
use parley::MessageStatus;

#[tokio::test]
async fn test_offline_message_is_delivered_after_reconnect() -> Result<()> {
    let harness = Harness::new(false, fast_queue_config(10)).await;
    let _auto_flush = harness.queue.spawn_auto_flush();
    let conversation = harness.open().await;

    let queued = conversation.send_message("hi").await?;
    assert_eq!(queued.status, MessageStatus::Sending);
    assert!(queued.id.starts_with("temp_"));
    assert_eq!(harness.api.sends.load(Ordering::SeqCst), 0);

    let entries = harness.queue.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, queued.id);
    assert_eq!(entries[0].text, "hi");
    assert_eq!(entries[0].status, QueueStatus::Queued);

    harness.network.set_online(true);

    let messages = wait_for_messages(&conversation, |m| {
        m.len() == 1 && m[0].status == MessageStatus::Sent
    })
    .await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "srv_0");
    assert_eq!(messages[0].text, "hi");
    assert!(harness.queue.is_empty().await);

    let stored = harness.store.load_messages(CONVERSATION_ID).await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, "srv_0");
    Ok(())
}

#[tokio::test]
async fn test_full_queue_fails_the_send() -> Result<()> {
    let harness = Harness::new(false, fast_queue_config(1)).await;
    let conversation = harness.open().await;

    conversation.send_message("first").await?;
    let failure = conversation.send_message("second").await.unwrap_err();
    assert_eq!(failure.code, "QUEUE_FULL");

    let messages = conversation.messages().await;
    let second = messages.iter().find(|m| m.text == "second").unwrap();
    assert_eq!(second.status, MessageStatus::Failed);
    assert_eq!(harness.queue.len().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_queue_survives_restart() -> Result<()> {
    let harness = Harness::new(false, fast_queue_config(10)).await;
    let conversation = harness.open().await;
    conversation.send_message("persist me").await?;
    conversation.close().await;

    let reloaded = parley::OfflineQueue::load(
        harness.kv.clone(),
        harness.store.clone(),
        harness.api.clone(),
        harness.network.clone(),
        fast_queue_config(10),
    )
    .await;
    let entries = reloaded.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].text, "persist me");
    Ok(())
}

#[tokio::test]
async fn test_exhausted_entry_marks_message_failed() -> Result<()> {
    let harness = Harness::new(false, fast_queue_config(10)).await;
    let conversation = harness.open().await;
    let queued = conversation.send_message("doomed").await?;

    harness.api.set_failing(true);
    harness.network.set_online(true);
    for _ in 0..3 {
        let summary = harness.queue.flush().await;
        assert_eq!(summary.failed, 1);
    }
    // retries exhausted: reported and surfaced in the timeline
    let summary = harness.queue.flush().await;
    assert!(summary.errors[0].contains("permanently failed"));

    let messages = wait_for_messages(&conversation, |m| m[0].status == MessageStatus::Failed).await;
    assert_eq!(messages[0].id, queued.id);
    assert_eq!(messages[0].status, MessageStatus::Failed);

    // a manual retry takes it out of the queue and sends directly
    harness.api.set_failing(false);
    let sent = conversation.retry_message(&queued.id).await?;
    assert_eq!(sent.status, MessageStatus::Sent);
    assert!(harness.queue.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_flushes_do_not_double_send() -> Result<()> {
    let harness = Harness::new(false, fast_queue_config(10)).await;
    let conversation = harness.open().await;
    for text in ["one", "two", "three"] {
        conversation.send_message(text).await?;
    }
    harness.network.set_online(true);

    let (a, b) = tokio::join!(harness.queue.flush(), harness.queue.flush());
    assert_eq!(a.success + b.success, 3);
    assert_eq!(harness.api.sends.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let messages = conversation.messages().await;
    assert!(messages.iter().all(|m| m.status == MessageStatus::Sent));
    Ok(())
}
