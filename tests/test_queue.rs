// Queue scheduling: ordering, the concurrency cap, and event emission.

use chunkflow::{QueueEventKind, UploadQueue};

#[test]
fn scheduling_order_full_lifecycle() {
    let queue = UploadQueue::new(2);

    queue.enqueue("background", 0);
    queue.enqueue("interactive", 10);
    queue.enqueue("bulk", 0);

    // Highest priority first, then FIFO among equals
    let first = queue.next().unwrap();
    let second = queue.next().unwrap();
    assert_eq!(first.file_id, "interactive");
    assert_eq!(second.file_id, "background");

    // Cap of two reached
    assert!(queue.next().is_none());

    queue.complete(&first.file_id);
    assert_eq!(queue.next().unwrap().file_id, "bulk");

    queue.fail("background");
    queue.complete("bulk");

    let stats = queue.stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.active_uploads, 0);
}

#[test]
fn retried_items_yield_to_fresh_ones() {
    let queue = UploadQueue::new(1);
    queue.enqueue("flaky", 5);
    queue.enqueue("steady", 5);

    assert_eq!(queue.next().unwrap().file_id, "flaky");
    queue.retry("flaky");

    // Same priority, fewer attempts wins
    assert_eq!(queue.next().unwrap().file_id, "steady");
    queue.complete("steady");
    assert_eq!(queue.next().unwrap().file_id, "flaky");
}

#[test]
fn queue_positions_update_as_items_drain() {
    let queue = UploadQueue::new(1);
    queue.enqueue("a", 3);
    queue.enqueue("b", 2);
    queue.enqueue("c", 1);

    assert_eq!(queue.position("a"), Some(0));
    assert_eq!(queue.position("c"), Some(2));

    queue.next();
    assert_eq!(queue.position("b"), Some(0));
    assert_eq!(queue.position("c"), Some(1));
}

#[tokio::test]
async fn every_mutation_emits_an_event() {
    let queue = UploadQueue::new(1);
    let mut rx = queue.subscribe();

    queue.enqueue("a", 0);
    queue.next().unwrap();
    queue.retry("a");
    queue.next().unwrap();
    queue.complete("a");
    queue.remove("a");

    let kinds: Vec<QueueEventKind> = (0..6).map(|_| rx.try_recv().unwrap().kind).collect();
    assert_eq!(
        kinds,
        vec![
            QueueEventKind::Enqueued,
            QueueEventKind::Started,
            QueueEventKind::Retried,
            QueueEventKind::Started,
            QueueEventKind::Completed,
            QueueEventKind::Removed,
        ]
    );
}
