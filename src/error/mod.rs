//! 服务发现错误处理模块
//!
//! 统一的错误类型，区分可重试的后端故障、需要重新注册的记录丢失，
//! 以及只需降级为空结果的数据格式错误

pub mod code;
pub mod conversions;

pub use code::ErrorCode;

use thiserror::Error;

/// 服务发现统一错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// 后端不可用（连接失败、超时等传输层错误）
    #[error("后端不可用: {0}")]
    BackendUnavailable(String),

    /// 注册记录已不存在（TTL 过期或被清理），需要重新注册
    #[error("注册记录不存在: {0}")]
    RecordNotFound(String),

    /// 请求的键不存在
    #[error("键不存在: {0}")]
    KeyNotFound(String),

    /// 后端返回了无法解析的数据
    #[error("后端响应格式错误: {0}")]
    MalformedResponse(String),

    /// 可用版本中没有满足版本范围的版本
    #[error("无法解析版本 {requested}")]
    VersionResolution { requested: String },

    /// 经过回退逻辑后仍然找不到任何可用实例
    #[error("服务不存在: {0}")]
    ServiceNotFound(String),

    /// watch 的起始索引已被后端压缩，需要从 `current_index` 重新开始
    #[error("watch 索引已过期，当前索引 {current_index}")]
    IndexCleared { current_index: u64 },

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(String),
}

impl DiscoveryError {
    /// 创建后端不可用错误
    pub fn unavailable(reason: impl Into<String>) -> Self {
        DiscoveryError::BackendUnavailable(reason.into())
    }

    /// 创建注册记录不存在错误
    pub fn record_not_found(reason: impl Into<String>) -> Self {
        DiscoveryError::RecordNotFound(reason.into())
    }

    /// 创建数据格式错误
    pub fn malformed(reason: impl Into<String>) -> Self {
        DiscoveryError::MalformedResponse(reason.into())
    }

    /// 创建服务不存在错误
    pub fn service_not_found(service: impl Into<String>) -> Self {
        DiscoveryError::ServiceNotFound(service.into())
    }

    /// 创建配置错误
    pub fn config(reason: impl Into<String>) -> Self {
        DiscoveryError::Config(reason.into())
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            DiscoveryError::BackendUnavailable(_) => ErrorCode::BackendUnavailable,
            DiscoveryError::RecordNotFound(_) => ErrorCode::RecordNotFound,
            DiscoveryError::KeyNotFound(_) => ErrorCode::KeyNotFound,
            DiscoveryError::MalformedResponse(_) => ErrorCode::MalformedResponse,
            DiscoveryError::VersionResolution { .. } => ErrorCode::VersionResolutionFailure,
            DiscoveryError::ServiceNotFound(_) => ErrorCode::ServiceNotFound,
            DiscoveryError::IndexCleared { .. } => ErrorCode::WatchIndexCleared,
            DiscoveryError::Config(_) => ErrorCode::InvalidConfig,
            DiscoveryError::Io(_) => ErrorCode::IoError,
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, DiscoveryError>;
