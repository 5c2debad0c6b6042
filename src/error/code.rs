//! 错误代码定义
//!
//! 错误代码按类别分组，每个类别占用100个代码范围：
//! - 100-199: 后端连接相关错误
//! - 200-299: 注册记录相关错误
//! - 300-399: 数据格式相关错误
//! - 400-499: 服务解析相关错误
//! - 900-999: 本地配置与 IO 错误

use serde::{Deserialize, Serialize};
use std::fmt;

/// 服务发现错误代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 后端连接相关错误 (100-199)
    // ============================================================
    BackendUnavailable = 100,
    WatchIndexCleared = 101,

    // ============================================================
    // 注册记录相关错误 (200-299)
    // ============================================================
    RecordNotFound = 200,
    KeyNotFound = 201,

    // ============================================================
    // 数据格式相关错误 (300-399)
    // ============================================================
    MalformedResponse = 300,

    // ============================================================
    // 服务解析相关错误 (400-499)
    // ============================================================
    VersionResolutionFailure = 400,
    ServiceNotFound = 401,

    // ============================================================
    // 本地配置与 IO 错误 (900-999)
    // ============================================================
    InvalidConfig = 900,
    IoError = 901,
}

impl ErrorCode {
    /// 获取错误代码的数值
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 获取错误代码的字符串表示
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ErrorCode::WatchIndexCleared => "WATCH_INDEX_CLEARED",
            ErrorCode::RecordNotFound => "RECORD_NOT_FOUND",
            ErrorCode::KeyNotFound => "KEY_NOT_FOUND",
            ErrorCode::MalformedResponse => "MALFORMED_RESPONSE",
            ErrorCode::VersionResolutionFailure => "VERSION_RESOLUTION_FAILURE",
            ErrorCode::ServiceNotFound => "SERVICE_NOT_FOUND",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::IoError => "IO_ERROR",
        }
    }

    /// 判断是否为可重试的错误
    ///
    /// 只有传输层故障值得退避重试，其余错误重试也不会改变结果
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::BackendUnavailable | ErrorCode::IoError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.as_u32())
    }
}
