use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{0}': {1}")]
    InvalidFilter(String, String),

    #[error("Failed to install subscriber: {0}")]
    InitError(String),
}

/// 构建日志过滤器：`RUST_LOG` 优先，否则使用配置的级别
pub fn build_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_level)
            .map_err(|e| LoggingError::InvalidFilter(default_level.to_string(), e.to_string())),
    }
}

/// 初始化全局日志订阅器
pub fn init_logging(default_level: &str, json: bool) -> Result<(), LoggingError> {
    let filter = build_filter(default_level)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| LoggingError::InitError(e.to_string()))
}
