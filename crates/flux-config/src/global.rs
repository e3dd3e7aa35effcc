use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 规则运行时全局配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub rules: RulesConfig,
    pub script: ScriptConfig,
    pub logging: LoggingConfig,
    pub bus: BusConfig,
}

/// 规则文件配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RulesConfig {
    /// 规则文件目录
    pub dir: PathBuf,
    /// 规则文件扩展名
    pub extension: String,
    /// 是否监听目录变化并自动重新加载
    pub watch: bool,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./rules"),
            extension: "rules".to_string(),
            watch: true,
        }
    }
}

/// 脚本执行配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// 执行超时（秒）
    pub timeout_seconds: u64,
    /// 最大操作数
    pub max_operations: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_operations: 100_000,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 默认日志级别，RUST_LOG 优先
    pub level: String,
    /// 输出 JSON 格式
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// 事件总线配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}
