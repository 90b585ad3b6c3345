//! 离线同步端到端测试（仅使用公开 API）

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use comanda_sync::{
    ActionKind, BackingStore, Collection, ComandaSyncError, NetworkStatus, OfflineSync, Result, SubmitOutcome,
    SyncConfig, SyncEvent,
};
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use tokio::sync::Mutex;

/// 记录写入并可切换可达性的后端
#[derive(Debug, Default)]
struct FlakyStore {
    reachable: Mutex<bool>,
    inserted: Mutex<Vec<(Collection, Map<String, Value>)>>,
}

impl FlakyStore {
    fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            reachable: Mutex::new(reachable),
            inserted: Mutex::new(Vec::new()),
        })
    }

    async fn set_reachable(&self, reachable: bool) {
        *self.reachable.lock().await = reachable;
    }

    async fn check(&self) -> Result<()> {
        if *self.reachable.lock().await {
            Ok(())
        } else {
            Err(ComandaSyncError::Transport("network unreachable".to_string()))
        }
    }
}

#[async_trait]
impl BackingStore for FlakyStore {
    async fn insert(&self, collection: Collection, record: &Map<String, Value>) -> Result<()> {
        self.check().await?;
        self.inserted.lock().await.push((collection, record.clone()));
        Ok(())
    }

    async fn update(&self, _collection: Collection, _id: &str, _fields: &Map<String, Value>) -> Result<()> {
        self.check().await
    }

    async fn delete(&self, _collection: Collection, _id: &str) -> Result<()> {
        self.check().await
    }
}

fn record(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn config(dir: &TempDir) -> SyncConfig {
    SyncConfig::builder()
        .data_dir(dir.path())
        .tenant_id("loja_centro")
        .settle_delay_ms(20)
        .entry_timeout_ms(1000)
        .notifications_enabled(false)
        .build()
}

#[tokio::test]
async fn offline_sales_are_replayed_in_order_after_reconnect() {
    let dir = TempDir::new().unwrap();
    let store = FlakyStore::new(false);
    let sync = OfflineSync::initialize(config(&dir), Some(store.clone()), None, None)
        .await
        .unwrap();
    let mut events = sync.subscribe();

    sync.set_network_status(NetworkStatus::Offline);
    for amount in [10, 20, 30] {
        let outcome = sync
            .submit(ActionKind::Insert, "sales", record(json!({"amount": amount})))
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued(_)));
    }
    assert_eq!(sync.pending_count().await, 3);

    store.set_reachable(true).await;
    sync.set_network_status(NetworkStatus::Online);

    let completed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::SyncCompleted { success_count, failed_count, .. }) => {
                    break (success_count, failed_count)
                }
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(completed, (3, 0));

    let amounts: Vec<Value> = store
        .inserted
        .lock()
        .await
        .iter()
        .map(|(_, record)| record["amount"].clone())
        .collect();
    assert_eq!(amounts, vec![json!(10), json!(20), json!(30)]);
    assert_eq!(sync.pending_count().await, 0);

    sync.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreachable_store_keeps_entries_for_next_cycle() {
    let dir = TempDir::new().unwrap();
    let store = FlakyStore::new(false);
    let sync = OfflineSync::initialize(config(&dir), Some(store.clone()), None, None)
        .await
        .unwrap();

    sync.enqueue(ActionKind::Insert, "products", record(json!({"name": "Coxinha"})))
        .await
        .unwrap();

    let report = sync.sync_now().await.unwrap();
    assert_eq!((report.success_count, report.failed_count), (0, 1));
    assert_eq!(sync.pending_count().await, 1);

    store.set_reachable(true).await;
    let report = sync.sync_now().await.unwrap();
    assert_eq!((report.success_count, report.failed_count), (1, 0));
    assert_eq!(sync.pending_count().await, 0);
}
