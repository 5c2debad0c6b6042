//! 服务发现模块
//!
//! - [`backend`]：后端抽象及 etcd / Consul / 内存实现
//! - [`registration`]：注册与心跳
//! - [`cache`]：实例缓存与 watch
//! - [`core`]：对外门面，组合注册、缓存、版本解析与轮询

pub mod address;
pub mod backend;
pub mod cache;
pub mod core;
pub mod factory;
pub mod failover;
pub mod instance;
pub mod key;
pub mod registration;
pub mod round_robin;
pub mod version;

pub use backend::{
    ChangeEvent, ChangeKind, DiscoveryBackend, InstanceSnapshot, MemoryBackend, ServiceSnapshot, WatchMessage,
};
#[cfg(feature = "consul")]
pub use backend::ConsulBackend;
#[cfg(feature = "etcd")]
pub use backend::EtcdBackend;
pub use cache::InstanceCache;
pub use self::core::{DiscoveryCore, RegistrationOptions};
pub use factory::DiscoveryFactory;
pub use failover::Failover;
pub use instance::{AccessType, ServiceInstance};
pub use key::{ServiceKey, VersionedServiceKey, WatchTarget};
pub use registration::{RegistrationManager, RegistrationRecord, RegistrationState, RegistrationStatus};
pub use round_robin::RoundRobin;
