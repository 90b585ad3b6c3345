use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::store::RECORD_ID_FIELD;

/// 离线动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionKind {
    /// 新增记录
    Insert,
    /// 更新记录（payload 必须带记录 ID）
    Update,
    /// 删除记录（payload 必须带记录 ID）
    Delete,
}

impl ActionKind {
    /// 重放时是否需要记录 ID
    pub fn requires_record_id(&self) -> bool {
        matches!(self, ActionKind::Update | ActionKind::Delete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Insert => "INSERT",
            ActionKind::Update => "UPDATE",
            ActionKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 待同步的离线动作
///
/// 写入后不可变；只在重放成功后被删除一次。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    /// 队列分配的自增 ID，永不复用
    pub id: u64,
    pub kind: ActionKind,
    /// 目标集合名，入队时不校验，重放时按白名单校验
    pub target: String,
    /// 记录字段（对队列不透明）
    pub payload: Map<String, Value>,
    /// 入队时间（UTC 毫秒时间戳），决定重放顺序
    pub created_at: i64,
}

impl QueuedAction {
    /// 创建新的离线动作，created_at 取当前时间
    pub fn new(id: u64, kind: ActionKind, target: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            id,
            kind,
            target: target.into(),
            payload,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 覆盖创建时间
    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    /// payload 中的记录 ID（字符串或数字），空字符串视为缺失
    pub fn record_id(&self) -> Option<String> {
        match self.payload.get(RECORD_ID_FIELD)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// 在队列中停留的时长（毫秒）
    pub fn age_ms(&self) -> i64 {
        (chrono::Utc::now().timestamp_millis() - self.created_at).max(0)
    }

    /// 日志摘要
    pub fn describe(&self) -> String {
        format!("#{} {} {}", self.id, self.kind, self.target)
    }
}

/// 按重放顺序排序：created_at 升序，相同时间按 id 升序
pub fn sort_for_replay(actions: &mut [QueuedAction]) {
    actions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}
