//! 服务实例定义

use serde::{Deserialize, Serialize};

/// 服务实例
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInstance {
    /// 实例 ID（唯一标识）
    pub id: String,

    /// 版本
    pub version: String,

    /// 对外访问地址
    pub base_url: String,

    /// 集群内部访问地址
    pub container_url: Option<String>,

    /// 所在集群 ID
    pub cluster_id: Option<String>,

    /// 是否可用（被禁用或过期的实例不会出现在缓存中）
    pub active: bool,
}

impl ServiceInstance {
    /// 创建新的服务实例
    pub fn new(id: impl Into<String>, version: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            base_url: base_url.into(),
            container_url: None,
            cluster_id: None,
            active: true,
        }
    }

    /// 设置集群内部地址
    pub fn with_container_url(mut self, container_url: impl Into<String>) -> Self {
        self.container_url = Some(container_url.into());
        self
    }

    /// 设置集群 ID
    pub fn with_cluster_id(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }

    /// 设置可用状态
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// 调用方应使用的地址
    ///
    /// 本进程与实例处于同一集群且实例有 container URL 时返回 container URL
    pub fn endpoint_for(&self, local_cluster_id: Option<&str>) -> &str {
        match (local_cluster_id, self.cluster_id.as_deref(), self.container_url.as_deref()) {
            (Some(local), Some(remote), Some(container)) if local == remote => container,
            _ => &self.base_url,
        }
    }
}

/// 访问方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    /// 直接访问实例
    #[default]
    Direct,
    /// 通过网关访问
    Gateway,
}

/// 粗略校验 URL：需要 `scheme://host`
pub fn is_valid_url(raw: &str) -> bool {
    match raw.split_once("://") {
        Some((scheme, rest)) => {
            !scheme.is_empty()
                && scheme.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
                && !rest.is_empty()
                && !rest.starts_with('/')
        }
        None => false,
    }
}
