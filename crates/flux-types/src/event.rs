use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 物品事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemEventKind {
    /// 状态发生变化
    Changed,
    /// 收到状态更新（可能与旧状态相同）
    Updated,
    /// 收到命令
    Command,
}

/// 物品事件，在总线上广播并驱动规则触发
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemEvent {
    pub id: Uuid,
    pub item: String,
    pub kind: ItemEventKind,
    pub old_state: Option<serde_json::Value>,
    pub state: serde_json::Value,
    pub timestamp: i64,
}

impl ItemEvent {
    #[cfg(not(target_arch = "wasm32"))]
    pub fn new(item: impl Into<String>, kind: ItemEventKind, state: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            item: item.into(),
            kind,
            old_state: None,
            state,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn changed(
        item: impl Into<String>,
        old_state: serde_json::Value,
        state: serde_json::Value,
    ) -> Self {
        Self {
            old_state: Some(old_state),
            ..Self::new(item, ItemEventKind::Changed, state)
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn updated(item: impl Into<String>, state: serde_json::Value) -> Self {
        Self::new(item, ItemEventKind::Updated, state)
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn command(item: impl Into<String>, command: serde_json::Value) -> Self {
        Self::new(item, ItemEventKind::Command, command)
    }
}
