//! 服务键与后端路径

use serde::{Deserialize, Serialize};
use std::fmt;

/// (服务名, 环境)：一个服务部署切片
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub name: String,
    pub environment: String,
}

impl ServiceKey {
    pub fn new(name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            environment: environment.into(),
        }
    }

    /// 追加版本，得到带版本的键
    pub fn with_version(&self, version: impl Into<String>) -> VersionedServiceKey {
        VersionedServiceKey {
            service: self.clone(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.environment)
    }
}

/// (服务名, 环境, 版本)：缓存条目以此为索引
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionedServiceKey {
    pub service: ServiceKey,
    pub version: String,
}

impl VersionedServiceKey {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        ServiceKey::new(name, environment).with_version(version)
    }

    pub fn name(&self) -> &str {
        &self.service.name
    }

    pub fn environment(&self) -> &str {
        &self.service.environment
    }
}

impl fmt::Display for VersionedServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.service.name, self.version, self.service.environment)
    }
}

/// 被 watch 的后端路径
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    /// 服务的所有版本（覆盖下面的单版本 watch）
    AllVersions(ServiceKey),
    /// 单个版本的实例
    Version(VersionedServiceKey),
    /// 单个版本的网关地址
    Gateway(VersionedServiceKey),
}

impl WatchTarget {
    pub fn path(&self) -> String {
        match self {
            WatchTarget::AllVersions(key) => paths::versions(key),
            WatchTarget::Version(key) => paths::instances(key),
            WatchTarget::Gateway(key) => paths::gateway(key),
        }
    }

    /// 后端 watch 使用的键前缀（网关为精确键）
    pub fn watch_prefix(&self) -> String {
        match self {
            WatchTarget::AllVersions(key) => format!("{}/", paths::versions(key)),
            WatchTarget::Version(key) => paths::instances(key),
            WatchTarget::Gateway(key) => paths::gateway(key),
        }
    }

    /// 后端键是否落在该 watch 范围内
    pub fn matches(&self, path: &str) -> bool {
        match self {
            WatchTarget::Gateway(_) => path == self.watch_prefix(),
            _ => path.starts_with(&self.watch_prefix()),
        }
    }

    pub fn service(&self) -> &ServiceKey {
        match self {
            WatchTarget::AllVersions(key) => key,
            WatchTarget::Version(key) | WatchTarget::Gateway(key) => &key.service,
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// KV 后端的键布局
///
/// `/environments/{env}/services/{name}/{version}/instances/{id}/{url|containerUrl|clusterId|status}`
pub mod paths {
    use super::{ServiceKey, VersionedServiceKey};

    pub const URL: &str = "url";
    pub const CONTAINER_URL: &str = "containerUrl";
    pub const CLUSTER_ID: &str = "clusterId";
    pub const STATUS: &str = "status";
    pub const GATEWAY_URL: &str = "gatewayUrl";
    pub const STATUS_DISABLED: &str = "disabled";

    pub fn versions(key: &ServiceKey) -> String {
        format!("/environments/{}/services/{}", key.environment, key.name)
    }

    pub fn version(key: &VersionedServiceKey) -> String {
        format!("{}/{}", versions(&key.service), key.version)
    }

    pub fn instances(key: &VersionedServiceKey) -> String {
        format!("{}/instances/", version(key))
    }

    pub fn instance(key: &VersionedServiceKey, instance_id: &str) -> String {
        format!("{}{}", instances(key), instance_id)
    }

    pub fn instance_field(key: &VersionedServiceKey, instance_id: &str, field: &str) -> String {
        format!("{}/{}", instance(key, instance_id), field)
    }

    pub fn gateway(key: &VersionedServiceKey) -> String {
        format!("{}/{}", version(key), GATEWAY_URL)
    }

    /// 解析后的键
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ParsedKey {
        /// 实例字段：`.../instances/{id}/{field}`，`field` 为空表示实例目录本身
        InstanceField {
            key: VersionedServiceKey,
            instance_id: String,
            field: String,
        },
        /// 网关地址：`.../{version}/gatewayUrl`
        Gateway(VersionedServiceKey),
    }

    /// 把后端键解析为结构化形式，不属于已知布局时返回 `None`
    pub fn parse(raw: &str) -> Option<ParsedKey> {
        let parts: Vec<&str> = raw.trim_end_matches('/').split('/').collect();
        // ["", "environments", env, "services", name, version, ...]
        if parts.len() < 7 || !parts[0].is_empty() || parts[1] != "environments" || parts[3] != "services" {
            return None;
        }
        let key = VersionedServiceKey::new(parts[4], parts[5], parts[2]);

        match &parts[6..] {
            [GATEWAY_URL] => Some(ParsedKey::Gateway(key)),
            ["instances", id] => Some(ParsedKey::InstanceField {
                key,
                instance_id: id.to_string(),
                field: String::new(),
            }),
            ["instances", id, field] => Some(ParsedKey::InstanceField {
                key,
                instance_id: id.to_string(),
                field: field.to_string(),
            }),
            _ => None,
        }
    }
}
