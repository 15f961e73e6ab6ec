//! 错误处理体系 (Error Handling System)
//!
//! 定义领域相关的错误类型、链接解析失败原因以及全局 Result 别名。

use thiserror::Error;

/// 单条代理链接的解析失败原因 (Per-link Parse Errors)
///
/// 调用方只记录并丢弃该行，绝不向整个批次传播。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("missing host")]
    MissingHost,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<url::ParseError> for LinkError {
    fn from(e: url::ParseError) -> Self {
        LinkError::InvalidUri(e.to_string())
    }
}

/// 全局错误定义 (Pilot Domain Errors)
#[derive(Error, Debug)]
pub enum PilotError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Crypto error: {0}")]
    Crypto(String),

    /// 外部 sing-box 核心返回的错误
    #[error("Core error: {0}")]
    Core(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Other error: {0}")]
    Custom(String),
}

/// 全局 Result 别名
pub type Result<T> = std::result::Result<T, PilotError>;

impl PilotError {
    /// 取消不视为失败，由调用方区分处理
    pub fn is_canceled(&self) -> bool {
        matches!(self, PilotError::Canceled)
    }
}
