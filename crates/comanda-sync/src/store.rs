//! 后端存储接口
//!
//! 同步器把离线动作重放到托管数据库。这里定义：
//! - 允许重放的集合白名单 [`Collection`]
//! - 重放前校验 [`ReplayCommand::from_action`]
//! - 后端存储抽象 [`BackingStore`]（生产实现见 `http_client::RestBackingStore`）

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::storage::queue::{ActionKind, QueuedAction};

/// payload 中记录 ID 的字段名
pub const RECORD_ID_FIELD: &str = "id";

/// 允许重放的集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Collection {
    Sales,
    Products,
    Ingredients,
    Customers,
    FixedCosts,
    Productions,
    Recipes,
    StockMovements,
    CashMovements,
    Settings,
    IntermediateRecipes,
}

impl Collection {
    pub const ALL: [Collection; 11] = [
        Collection::Sales,
        Collection::Products,
        Collection::Ingredients,
        Collection::Customers,
        Collection::FixedCosts,
        Collection::Productions,
        Collection::Recipes,
        Collection::StockMovements,
        Collection::CashMovements,
        Collection::Settings,
        Collection::IntermediateRecipes,
    ];

    /// 集合名（入队时使用的 target）
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Sales => "sales",
            Collection::Products => "products",
            Collection::Ingredients => "ingredients",
            Collection::Customers => "customers",
            Collection::FixedCosts => "fixed-costs",
            Collection::Productions => "productions",
            Collection::Recipes => "recipes",
            Collection::StockMovements => "stock-movements",
            Collection::CashMovements => "cash-movements",
            Collection::Settings => "settings",
            Collection::IntermediateRecipes => "intermediate-recipes",
        }
    }

    /// 数据库表名
    pub fn table_name(&self) -> &'static str {
        match self {
            Collection::FixedCosts => "fixed_costs",
            Collection::StockMovements => "stock_movements",
            Collection::CashMovements => "cash_movements",
            Collection::IntermediateRecipes => "intermediate_recipes",
            other => other.as_str(),
        }
    }

    /// 按集合名查找，不在白名单内返回 None
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = ReplayRejection;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ReplayRejection::UnknownCollection(s.to_string()))
    }
}

/// 重放前校验失败的原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayRejection {
    #[error("集合不在白名单内: {0}")]
    UnknownCollection(String),

    #[error("{kind} 操作缺少记录 ID: {target}")]
    MissingRecordId { kind: ActionKind, target: String },
}

/// 后端存储（托管关系数据库）
///
/// 同步器把它当黑盒：不在内部重试，重试只发生在下一次同步触发时。
#[async_trait]
pub trait BackingStore: Send + Sync + fmt::Debug {
    async fn insert(&self, collection: Collection, record: &Map<String, Value>) -> Result<()>;

    async fn update(&self, collection: Collection, id: &str, fields: &Map<String, Value>) -> Result<()>;

    async fn delete(&self, collection: Collection, id: &str) -> Result<()>;
}

/// 已通过校验、可以直接发给后端的重放指令
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayCommand {
    Insert {
        collection: Collection,
        record: Map<String, Value>,
    },
    Update {
        collection: Collection,
        id: String,
        fields: Map<String, Value>,
    },
    Delete {
        collection: Collection,
        id: String,
    },
}

impl ReplayCommand {
    /// 校验离线动作并转换为重放指令
    ///
    /// 先校验集合白名单，再校验 UPDATE/DELETE 的记录 ID。
    pub fn from_action(action: &QueuedAction) -> std::result::Result<Self, ReplayRejection> {
        let collection: Collection = action.target.parse()?;

        match action.kind {
            ActionKind::Insert => Ok(ReplayCommand::Insert {
                collection,
                record: action.payload.clone(),
            }),
            ActionKind::Update => {
                let id = action.record_id().ok_or_else(|| ReplayRejection::MissingRecordId {
                    kind: action.kind,
                    target: action.target.clone(),
                })?;
                let mut fields = action.payload.clone();
                fields.remove(RECORD_ID_FIELD);
                Ok(ReplayCommand::Update { collection, id, fields })
            }
            ActionKind::Delete => {
                let id = action.record_id().ok_or_else(|| ReplayRejection::MissingRecordId {
                    kind: action.kind,
                    target: action.target.clone(),
                })?;
                Ok(ReplayCommand::Delete { collection, id })
            }
        }
    }

    pub fn collection(&self) -> Collection {
        match self {
            ReplayCommand::Insert { collection, .. }
            | ReplayCommand::Update { collection, .. }
            | ReplayCommand::Delete { collection, .. } => *collection,
        }
    }

    /// 发送到后端存储
    pub async fn dispatch(&self, store: &dyn BackingStore) -> Result<()> {
        match self {
            ReplayCommand::Insert { collection, record } => store.insert(*collection, record).await,
            ReplayCommand::Update { collection, id, fields } => store.update(*collection, id, fields).await,
            ReplayCommand::Delete { collection, id } => store.delete(*collection, id).await,
        }
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use crate::error::ComandaSyncError;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    /// 记录下来的后端调用
    #[derive(Debug, Clone, PartialEq)]
    pub enum StoreCall {
        Insert { collection: Collection, record: Map<String, Value> },
        Update { collection: Collection, id: String, fields: Map<String, Value> },
        Delete { collection: Collection, id: String },
    }

    impl StoreCall {
        /// 调用里携带的 `marker` 字段（测试用来区分条目）
        pub fn marker(&self) -> Option<String> {
            let fields = match self {
                StoreCall::Insert { record, .. } => record,
                StoreCall::Update { fields, .. } => fields,
                StoreCall::Delete { id, .. } => return Some(id.clone()),
            };
            fields.get("marker").and_then(|v| v.as_str()).map(str::to_string)
        }
    }

    type Rule = Arc<dyn Fn(&StoreCall) -> Option<ComandaSyncError> + Send + Sync>;

    /// 测试用：记录所有调用的后端存储，可配置失败、panic 与延迟
    #[derive(Default)]
    pub struct RecordingStore {
        calls: Mutex<Vec<StoreCall>>,
        failure_rule: Mutex<Option<Rule>>,
        panic_marker: Mutex<Option<String>>,
        delay: Mutex<Option<Duration>>,
    }

    impl fmt::Debug for RecordingStore {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RecordingStore")
                .field("calls", &self.calls.lock().len())
                .finish()
        }
    }

    impl RecordingStore {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn calls(&self) -> Vec<StoreCall> {
            self.calls.lock().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        pub fn markers(&self) -> Vec<String> {
            self.calls.lock().iter().filter_map(StoreCall::marker).collect()
        }

        /// 携带指定 marker 的调用返回后端错误
        pub fn fail_marker(&self, marker: &str) {
            let marker = marker.to_string();
            *self.failure_rule.lock() = Some(Arc::new(move |call: &StoreCall| {
                if call.marker().as_deref() == Some(marker.as_str()) {
                    Some(ComandaSyncError::Store { status: 500, message: "simulated failure".to_string() })
                } else {
                    None
                }
            }));
        }

        /// 所有调用都返回网络错误
        pub fn fail_all(&self) {
            *self.failure_rule.lock() = Some(Arc::new(|_: &StoreCall| {
                Some(ComandaSyncError::Transport("connection refused".to_string()))
            }));
        }

        pub fn clear_failures(&self) {
            *self.failure_rule.lock() = None;
        }

        /// 携带指定 marker 的调用直接 panic
        pub fn panic_on_marker(&self, marker: &str) {
            *self.panic_marker.lock() = Some(marker.to_string());
        }

        /// 每次调用前等待
        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock() = Some(delay);
        }

        async fn record(&self, call: StoreCall) -> Result<()> {
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let should_panic = {
                let panic_marker = self.panic_marker.lock();
                panic_marker.is_some() && call.marker() == *panic_marker
            };
            if should_panic {
                panic!("simulated panic in backing store");
            }
            let rule = self.failure_rule.lock().clone();
            self.calls.lock().push(call.clone());
            match rule.and_then(|rule| rule(&call)) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl BackingStore for RecordingStore {
        async fn insert(&self, collection: Collection, record: &Map<String, Value>) -> Result<()> {
            self.record(StoreCall::Insert { collection, record: record.clone() }).await
        }

        async fn update(&self, collection: Collection, id: &str, fields: &Map<String, Value>) -> Result<()> {
            self.record(StoreCall::Update {
                collection,
                id: id.to_string(),
                fields: fields.clone(),
            })
            .await
        }

        async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
            self.record(StoreCall::Delete { collection, id: id.to_string() }).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(kind: ActionKind, target: &str, payload: Value) -> QueuedAction {
        QueuedAction::new(1, kind, target, payload.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_collection_allow_list() {
        assert_eq!(Collection::parse("sales"), Some(Collection::Sales));
        assert_eq!(Collection::parse("fixed-costs"), Some(Collection::FixedCosts));
        assert_eq!(Collection::parse("intermediate-recipes"), Some(Collection::IntermediateRecipes));
        assert_eq!(Collection::parse("not_a_real_collection"), None);
        assert_eq!(Collection::parse("Sales"), None);

        for collection in Collection::ALL {
            assert_eq!(Collection::parse(collection.as_str()), Some(collection));
            assert!(!collection.table_name().contains('-'));
        }
        assert_eq!(Collection::StockMovements.table_name(), "stock_movements");
    }

    #[test]
    fn test_from_action_rejects_unknown_collection() {
        let result = ReplayCommand::from_action(&action(ActionKind::Insert, "not_a_real_collection", json!({})));
        assert_eq!(
            result,
            Err(ReplayRejection::UnknownCollection("not_a_real_collection".to_string()))
        );
    }

    #[test]
    fn test_from_action_requires_record_id_for_update_and_delete() {
        for kind in [ActionKind::Update, ActionKind::Delete] {
            let result = ReplayCommand::from_action(&action(kind, "products", json!({"price": 3})));
            assert_eq!(
                result,
                Err(ReplayRejection::MissingRecordId { kind, target: "products".to_string() })
            );
        }

        let insert = ReplayCommand::from_action(&action(ActionKind::Insert, "products", json!({"price": 3})));
        assert!(insert.is_ok());
    }

    #[test]
    fn test_update_strips_record_id_from_fields() {
        let command = ReplayCommand::from_action(&action(
            ActionKind::Update,
            "customers",
            json!({"id": "c-1", "name": "Ana"}),
        ))
        .unwrap();

        match command {
            ReplayCommand::Update { collection, id, fields } => {
                assert_eq!(collection, Collection::Customers);
                assert_eq!(id, "c-1");
                assert!(!fields.contains_key("id"));
                assert_eq!(fields.get("name"), Some(&json!("Ana")));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
