//! The Persistent Message Buffer's durable half (§4.1, §4.8): a SQLite-backed store with one
//! writer connection and a pool of readers, opened once per process and shared by the Buffer,
//! the Dispatcher, the Janitor, and the `buffer-monitor` CLI.

pub mod lock;
pub mod pool;
pub mod store;

pub use pool::{open, open_in_memory, open_shared, StorePools};
pub use store::Store;

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{DataType, Destination, NewMessage, Priority, Source, Status};
    use std::time::Duration;

    async fn test_store() -> Store {
        let pools = open_in_memory().await.expect("open in-memory store");
        Store::new(pools)
    }

    fn sample(topic: &str, coalesce: bool) -> NewMessage {
        NewMessage {
            source: Source::Mqtt,
            destination: Destination::Opcua,
            topic_or_node: topic.to_string(),
            value: "42".to_string(),
            data_type: DataType::Int32,
            priority: Priority::Normal,
            max_retries: 3,
            ttl: chrono::Duration::hours(1),
            coalesce,
        }
    }

    #[tokio::test]
    async fn insert_and_claim_round_trip() {
        let store = test_store().await;
        let id = store.insert(&sample("line1/temp", false)).await.unwrap();

        let claimed = store.claim(10, "worker-a", Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].status, Status::Processing);
        assert_eq!(claimed[0].lease_owner.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn claim_excludes_already_claimed_rows() {
        let store = test_store().await;
        store.insert(&sample("line1/temp", false)).await.unwrap();

        let first = store.claim(10, "worker-a", Duration::from_secs(30)).await.unwrap();
        let second = store.claim(10, "worker-b", Duration::from_secs(30)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn coalesce_replaces_pending_row_instead_of_inserting() {
        let store = test_store().await;
        let first = store.insert(&sample("line1/temp", true)).await.unwrap();
        let second = store.insert(&sample("line1/temp", true)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.count_status(Status::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fail_retry_requeues_until_budget_exhausted() {
        let store = test_store().await;
        let id = store.insert(&sample("line1/temp", false)).await.unwrap();

        for _ in 0..3 {
            store.claim(10, "worker-a", Duration::from_secs(30)).await.unwrap();
            let requeued = store
                .fail_retry(id, "sensor timeout", Duration::from_millis(1))
                .await
                .unwrap();
            assert!(requeued);
        }

        store.claim(10, "worker-a", Duration::from_secs(30)).await.unwrap();
        let requeued = store.fail_retry(id, "sensor timeout", Duration::from_millis(1)).await.unwrap();
        assert!(!requeued);
        assert_eq!(store.count_status(Status::Failed).await.unwrap(), 1);

        let archive = store.query_failed(10).await.unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive[0].original_id, id);
    }

    #[tokio::test]
    async fn reclaim_stuck_returns_abandoned_lease_to_pending() {
        let store = test_store().await;
        store.insert(&sample("line1/temp", false)).await.unwrap();
        store.claim(10, "worker-a", Duration::from_millis(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = store.reclaim_stuck().await.unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(store.count_status(Status::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reclaim_stuck_archives_once_retry_budget_exhausted() {
        let store = test_store().await;
        let mut message = sample("line1/temp", false);
        message.max_retries = 0;
        let id = store.insert(&message).await.unwrap();
        store.claim(10, "worker-a", Duration::from_millis(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = store.reclaim_stuck().await.unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(store.count_status(Status::Pending).await.unwrap(), 0);
        assert_eq!(store.count_status(Status::Failed).await.unwrap(), 1);

        let archive = store.query_failed(10).await.unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive[0].original_id, id);
    }

    #[tokio::test]
    async fn expire_due_archives_overdue_pending_rows() {
        let store = test_store().await;
        let mut expiring = sample("line1/temp", false);
        expiring.ttl = chrono::Duration::milliseconds(1);
        store.insert(&expiring).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = store.expire_due().await.unwrap();
        assert_eq!(expired, 1);
        assert_eq!(store.count_status(Status::Expired).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_completed_rows() {
        let store = test_store().await;
        let id = store.insert(&sample("line1/temp", false)).await.unwrap();
        store.claim(10, "worker-a", Duration::from_secs(30)).await.unwrap();
        store.complete(id).await.unwrap();

        let removed_too_soon = store.cleanup(chrono::Utc::now() - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(removed_too_soon, 0);

        let removed = store.cleanup(chrono::Utc::now() + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 1);
    }
}
