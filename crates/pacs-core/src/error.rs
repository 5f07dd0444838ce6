//! 错误定义模块

use thiserror::Error;

/// PACS系统统一错误类型
#[derive(Error, Debug)]
pub enum PacsError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("不允许的操作: {0}")]
    OperationNotPermitted(String),

    #[error("检测到循环合并: {0}")]
    CircularMerge(String),

    #[error("患者不唯一: {0}")]
    NonUniquePatient(String),

    #[error("患者已被合并: {0}")]
    PatientMerged(String),

    #[error("并发冲突: {0}")]
    Conflict(String),

    #[error("删除请求分发失败: {0}")]
    Dispatch(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl PacsError {
    /// 是否可以由调用方重试
    ///
    /// 业务规则错误（未找到、不允许、循环合并、患者歧义）重试也不会成功。
    pub fn is_retryable(&self) -> bool {
        matches!(self, PacsError::Conflict(_) | PacsError::Dispatch(_) | PacsError::Io(_))
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        PacsError::NotFound(what.to_string())
    }

    pub fn not_permitted(why: impl std::fmt::Display) -> Self {
        PacsError::OperationNotPermitted(why.to_string())
    }
}

/// PACS系统统一结果类型
pub type Result<T> = std::result::Result<T, PacsError>;
