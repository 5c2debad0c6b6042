//! 服务发现后端抽象和实现
//!
//! 核心逻辑只依赖 [`DiscoveryBackend`]，具体的注册中心（etcd、Consul、内存）在组装时选择

#[cfg(feature = "consul")]
pub mod consul;
#[cfg(feature = "etcd")]
pub mod etcd;
pub(crate) mod kv;
pub mod memory;

#[cfg(feature = "consul")]
pub use consul::ConsulBackend;
#[cfg(feature = "etcd")]
pub use etcd::EtcdBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::discovery::instance::ServiceInstance;
use crate::discovery::key::{ServiceKey, VersionedServiceKey, WatchTarget};
use crate::discovery::registration::RegistrationRecord;
use crate::error::Result;

/// 单个版本的实例快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSnapshot {
    /// 可用实例（已过滤禁用和格式错误的条目）
    pub instances: Vec<ServiceInstance>,
    /// 读取时后端的索引，watch 从 `index + 1` 开始
    pub index: u64,
}

/// 服务所有版本的快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSnapshot {
    /// 版本 -> 可用实例
    pub versions: BTreeMap<String, Vec<ServiceInstance>>,
    pub index: u64,
}

/// 变化类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// 实例上线或对外地址变化
    InstanceUp { base_url: String },
    /// 实例被删除或 TTL 过期
    InstanceRemoved,
    /// 实例被标记为禁用
    InstanceDisabled,
    ContainerUrlChanged(Option<String>),
    ClusterIdChanged(Option<String>),
    /// 网关地址新增、修改（`Some`）或删除（`None`）
    GatewayChanged(Option<String>),
}

/// watch 推送的单个变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: VersionedServiceKey,
    /// 网关事件为空字符串
    pub instance_id: String,
    pub kind: ChangeKind,
    /// 事件所在的后端索引
    pub index: u64,
}

impl ChangeEvent {
    pub fn new(key: VersionedServiceKey, instance_id: impl Into<String>, kind: ChangeKind, index: u64) -> Self {
        Self {
            key,
            instance_id: instance_id.into(),
            kind,
            index,
        }
    }
}

/// watch 流中的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchMessage {
    /// 一批按后端顺序排列的事件，`index` 为这批事件的最大索引
    Events { events: Vec<ChangeEvent>, index: u64 },
    /// 请求的起始索引已被压缩，需要从 `current_index` 重新 watch
    IndexCleared { current_index: u64 },
}

/// 服务发现后端 trait
///
/// 由于需要动态分发（dyn），使用 async-trait
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// 后端名称（用于日志）
    fn name(&self) -> &'static str;

    /// 注册实例
    async fn register_instance(&self, record: &RegistrationRecord) -> Result<()>;

    /// 发送心跳/刷新 TTL
    ///
    /// 记录已不存在时必须返回 `DiscoveryError::RecordNotFound`，其他传输错误返回
    /// `BackendUnavailable`
    async fn heartbeat(&self, record: &RegistrationRecord) -> Result<()>;

    /// 列出某个版本的可用实例
    async fn list_instances(&self, key: &VersionedServiceKey) -> Result<InstanceSnapshot>;

    /// 列出服务所有版本的可用实例
    async fn list_service(&self, key: &ServiceKey) -> Result<ServiceSnapshot>;

    /// 从 `from_index` 开始监听变化
    ///
    /// 流结束表示连接断开，调用方负责重新 watch
    async fn watch(&self, target: &WatchTarget, from_index: u64) -> Result<mpsc::Receiver<WatchMessage>>;

    /// 读取单个值，并返回读取时的索引
    async fn get_value(&self, path: &str) -> Result<(Option<String>, u64)>;

    /// 写入单个值
    async fn put_value(&self, path: &str, value: &str) -> Result<()>;

    /// 删除注册记录
    async fn delete_instance(&self, record: &RegistrationRecord) -> Result<()>;

    /// 把地址为 `url` 的实例标记为禁用
    async fn disable_instance(&self, key: &VersionedServiceKey, url: &str) -> Result<()>;

    /// 读取网关地址
    async fn get_gateway(&self, key: &VersionedServiceKey) -> Result<(Option<String>, u64)> {
        self.get_value(&crate::discovery::key::paths::gateway(key)).await
    }
}
