use thiserror::Error;

/// FLUX Core 统一错误类型
#[derive(Error, Debug)]
pub enum FluxError {
    #[error("Channel send error: {0}")]
    ChannelSend(String),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, FluxError>;

impl<T> From<tokio::sync::broadcast::error::SendError<T>> for FluxError {
    fn from(err: tokio::sync::broadcast::error::SendError<T>) -> Self {
        FluxError::ChannelSend(err.to_string())
    }
}
