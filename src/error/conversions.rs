//! 错误类型转换实现
//!
//! 传输层错误统一映射为 `BackendUnavailable`，解码错误映射为 `MalformedResponse`

use super::DiscoveryError;
use std::io;

impl From<io::Error> for DiscoveryError {
    fn from(err: io::Error) -> Self {
        DiscoveryError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        DiscoveryError::malformed(format!("JSON 解析错误: {}", err))
    }
}

impl From<toml::de::Error> for DiscoveryError {
    fn from(err: toml::de::Error) -> Self {
        DiscoveryError::config(format!("TOML 解析错误: {}", err))
    }
}

impl From<std::string::FromUtf8Error> for DiscoveryError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        DiscoveryError::malformed(format!("UTF-8 解码错误: {}", err))
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for DiscoveryError {
    fn from(err: etcd_client::Error) -> Self {
        use etcd_client::Error as E;

        match err {
            E::Utf8Error(e) => DiscoveryError::malformed(format!("etcd 返回非 UTF-8 数据: {}", e)),
            E::InvalidArgs(msg) => DiscoveryError::config(format!("etcd 参数错误: {}", msg)),
            E::GRpcStatus(status) if status.message().contains("lease not found") => {
                DiscoveryError::record_not_found(status.message().to_string())
            }
            other => DiscoveryError::unavailable(other.to_string()),
        }
    }
}

#[cfg(feature = "consul")]
impl From<reqwest::Error> for DiscoveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            DiscoveryError::malformed(format!("Consul 响应解码失败: {}", err))
        } else {
            DiscoveryError::unavailable(format!("Consul 请求失败: {}", err))
        }
    }
}
