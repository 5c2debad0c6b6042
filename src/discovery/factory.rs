//! 服务发现工厂
//!
//! 在组装时按配置选择后端

use std::sync::Arc;
use tracing::info;

use crate::config::{BackendType, DiscoveryConfig};
use crate::discovery::backend::{DiscoveryBackend, MemoryBackend};
use crate::error::{DiscoveryError, Result};

/// 服务发现工厂
pub struct DiscoveryFactory;

impl DiscoveryFactory {
    /// 从配置创建服务发现后端
    pub async fn create_backend(config: &DiscoveryConfig) -> Result<Arc<dyn DiscoveryBackend>> {
        let backend: Arc<dyn DiscoveryBackend> = match config.backend.backend_type {
            BackendType::Memory => Arc::new(MemoryBackend::new()),
            #[cfg(feature = "etcd")]
            BackendType::Etcd => Arc::new(crate::discovery::backend::EtcdBackend::new(&config.backend).await?),
            #[cfg(feature = "consul")]
            BackendType::Consul => Arc::new(crate::discovery::backend::ConsulBackend::new(&config.backend)?),
            #[allow(unreachable_patterns)]
            other => {
                return Err(DiscoveryError::config(format!(
                    "backend {:?} is not enabled in this build",
                    other
                )));
            }
        };

        info!(
            backend = backend.name(),
            endpoints = ?config.backend.endpoints,
            "✅ Discovery backend created"
        );
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_memory_backend() {
        let mut config = DiscoveryConfig::default();
        config.backend.backend_type = BackendType::Memory;
        let backend = DiscoveryFactory::create_backend(&config).await.unwrap();
        assert_eq!(backend.name(), "memory");
    }
}
