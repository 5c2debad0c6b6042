//! Flare Discovery
//!
//! 客户端侧的服务注册与发现：基于 etcd 或 Consul 注册本实例并保持心跳，
//! 通过 watch 维护本地实例缓存，按版本范围解析并轮询选择实例地址。

pub mod config;
pub mod discovery;
pub mod error;
pub mod retry;
pub mod telemetry;

pub use config::{
    BackendConfig, BackendType, DiscoveryConfig, LogConfig, RetryConfig, RoundRobinScope, ServiceDefaults,
};
pub use discovery::{
    AccessType, DiscoveryBackend, DiscoveryCore, DiscoveryFactory, InstanceCache, MemoryBackend,
    RegistrationManager, RegistrationOptions, ServiceInstance, ServiceKey, VersionedServiceKey,
};
pub use error::{DiscoveryError, ErrorCode, Result};
pub use retry::{RetryPolicies, RetryPolicy};
pub use telemetry::init_tracing;
