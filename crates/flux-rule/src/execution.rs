use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 规则执行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleExecution {
    pub id: String,
    pub model: String,
    pub rule_name: String,
    /// 触发来源描述，例如 `Switch changed`
    pub trigger: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
}

/// 执行状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Timeout,
}
