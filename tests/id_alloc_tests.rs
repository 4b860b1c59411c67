
use switchyard::error::MatchingError;
use switchyard::id_alloc::IdBlockAllocator;
use switchyard::store::QueueStore;
use uuid::Uuid;

use test_helpers::*;

#[tokio::test]
async fn first_block_follows_range_arithmetic() {
    let store = memory_store();
    let queue = activity_queue(Uuid::new_v4(), "tl0");

    // range_id 1 with block size B owns [B+1, 2B].
    let (allocator, ack_level) = IdBlockAllocator::acquire(store.clone(), queue, 100)
        .await
        .expect("acquire");
    assert_eq!(ack_level, 0);

    let first = allocator.allocate().await.expect("allocate");
    assert_eq!(first.task_id, 101);
    assert_eq!(first.range_id, 1);
}

#[tokio::test]
async fn ids_are_strictly_increasing() {
    let store = memory_store();
    let queue = activity_queue(Uuid::new_v4(), "tl0");
    let (allocator, _) = IdBlockAllocator::acquire(store.clone(), queue, 10)
        .await
        .expect("acquire");

    let mut last = 0;
    for _ in 0..35 {
        let id = allocator.allocate().await.expect("allocate");
        assert!(id.task_id > last, "{} not > {}", id.task_id, last);
        last = id.task_id;
    }
}

#[tokio::test]
async fn exhausting_a_block_renews_the_lease() {
    let store = memory_store();
    let queue = activity_queue(Uuid::new_v4(), "tl0");
    let (allocator, _) = IdBlockAllocator::acquire(store.clone(), queue, 3)
        .await
        .expect("acquire");

    // Block [4, 6] under range 1.
    for expected in [4, 5, 6] {
        let id = allocator.allocate().await.expect("allocate");
        assert_eq!(id.task_id, expected);
        assert_eq!(id.range_id, 1);
    }
    assert!(allocator.block_exhausted().await);

    // The 4th allocation renews first, landing in [7, 9] under range 2.
    let id = allocator.allocate().await.expect("allocate");
    assert_eq!(id.task_id, 7);
    assert_eq!(id.range_id, 2);
    assert!(!allocator.block_exhausted().await);
}

#[tokio::test]
async fn renewal_conflict_is_lease_lost() {
    let store = memory_store();
    let queue = activity_queue(Uuid::new_v4(), "tl0");
    let (allocator, _) = IdBlockAllocator::acquire(store.clone(), queue.clone(), 2)
        .await
        .expect("acquire");

    allocator.allocate().await.expect("allocate");
    allocator.allocate().await.expect("allocate");

    // Another instance takes over before the renewal.
    store.lease_queue(&queue, None).await.expect("takeover");

    let err = allocator.allocate().await.expect_err("conflict");
    assert!(matches!(err, MatchingError::LeaseLost));
}
