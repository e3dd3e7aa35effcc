use flux_script::ScriptError;
use std::time::Duration;
use thiserror::Error;

/// 规则运行时错误
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("rule '{0}' is not attached to a loaded rule model")]
    DetachedRule(String),

    #[error("variable '{0}' is not declared in this context")]
    UndeclaredVariable(String),

    #[error("{model}:{line}: {message}")]
    Parse {
        model: String,
        line: usize,
        message: String,
    },

    #[error("rule '{rule}' failed: {source}")]
    Script {
        rule: String,
        #[source]
        source: ScriptError,
    },

    #[error("rule '{0}' timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RuleError>;
