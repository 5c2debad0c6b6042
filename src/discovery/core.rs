//! 服务发现门面
//!
//! 组合注册管理、实例缓存、版本解析和轮询选择，对外提供注册与解析接口

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::DiscoveryConfig;
use crate::discovery::address::detect_base_url;
use crate::discovery::backend::DiscoveryBackend;
use crate::discovery::cache::InstanceCache;
use crate::discovery::factory::DiscoveryFactory;
use crate::discovery::instance::{AccessType, is_valid_url};
use crate::discovery::key::{ServiceKey, VersionedServiceKey};
use crate::discovery::registration::{RegistrationManager, RegistrationRecord, generate_instance_id};
use crate::discovery::round_robin::RoundRobin;
use crate::discovery::version;
use crate::error::{DiscoveryError, Result};

const DEFAULT_PORT: u16 = 8080;

/// 注册参数，未设置的字段使用配置中的默认值
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    pub name: String,
    pub version: Option<String>,
    pub environment: Option<String>,
    pub ttl: Option<Duration>,
    pub ping_interval: Option<Duration>,
    pub singleton: Option<bool>,
    pub base_url: Option<String>,
    pub instance_id: Option<String>,
    pub container_url: Option<String>,
    pub port: Option<u16>,
}

impl RegistrationOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = Some(ping_interval);
        self
    }

    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = Some(singleton);
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn container_url(mut self, container_url: impl Into<String>) -> Self {
        self.container_url = Some(container_url.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// 服务发现核心
pub struct DiscoveryCore {
    config: DiscoveryConfig,
    backend: Arc<dyn DiscoveryBackend>,
    cache: InstanceCache,
    registrations: RegistrationManager,
    round_robin: RoundRobin,
    started: AtomicBool,
}

impl DiscoveryCore {
    /// 使用给定后端创建
    pub fn new(backend: Arc<dyn DiscoveryBackend>, config: DiscoveryConfig) -> Self {
        Self {
            cache: InstanceCache::new(backend.clone(), &config.retry),
            registrations: RegistrationManager::new(backend.clone(), &config.retry),
            round_robin: RoundRobin::new(config.round_robin),
            started: AtomicBool::new(false),
            backend,
            config,
        }
    }

    /// 按配置创建后端并组装
    pub async fn from_config(config: DiscoveryConfig) -> Result<Self> {
        config.validate()?;
        let backend = DiscoveryFactory::create_backend(&config).await?;
        Ok(Self::new(backend, config))
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn DiscoveryBackend> {
        &self.backend
    }

    pub fn cache(&self) -> &InstanceCache {
        &self.cache
    }

    pub fn registrations(&self) -> &RegistrationManager {
        &self.registrations
    }

    /// 启动；配置了 `service.name` 时注册该服务并返回实例 ID
    pub async fn start(&self) -> Option<String> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        info!(backend = self.backend.name(), cluster_id = ?self.config.cluster_id, "🚀 Discovery started");

        let name = self.config.service.name.clone()?;
        self.register_with(RegistrationOptions::new(name)).await
    }

    /// 注销全部实例并停止所有 watch
    pub async fn shutdown(&self) {
        self.registrations.deregister_all().await;
        self.cache.shutdown().await;
        self.started.store(false, Ordering::SeqCst);
        info!("🛑 Discovery stopped");
    }

    /// 注册服务实例（其余参数取配置默认值）
    pub async fn register(
        &self,
        name: &str,
        version: &str,
        environment: &str,
        ttl: Duration,
        ping_interval: Duration,
        singleton: bool,
    ) -> Option<String> {
        self.register_with(
            RegistrationOptions::new(name)
                .version(version)
                .environment(environment)
                .ttl(ttl)
                .ping_interval(ping_interval)
                .singleton(singleton),
        )
        .await
    }

    /// 注册服务实例，立即返回实例 ID，实际注册由后台任务完成
    ///
    /// 无法确定 base URL 时记录错误并返回 `None`
    pub async fn register_with(&self, options: RegistrationOptions) -> Option<String> {
        let defaults = &self.config.service;
        let key = VersionedServiceKey::new(
            options.name.clone(),
            options.version.unwrap_or_else(|| defaults.version.clone()),
            options.environment.unwrap_or_else(|| defaults.environment.clone()),
        );
        let ttl = options.ttl.unwrap_or(Duration::from_secs(defaults.ttl_secs));
        let ping_interval = options
            .ping_interval
            .unwrap_or(Duration::from_secs(defaults.ping_interval_secs));
        if ping_interval >= ttl {
            warn!(service = %key, ?ping_interval, ?ttl, "⚠️ Ping interval is not shorter than TTL");
        }

        let port = options.port.or(self.config.port).unwrap_or(DEFAULT_PORT);
        let mut detected: Option<Option<String>> = None;
        let mut detect = || detected.get_or_insert_with(|| detect_base_url(port)).clone();

        let mut container_url = options.container_url.or_else(|| self.config.container_url.clone());
        if self.config.cluster_id.is_some() && container_url.is_none() {
            container_url = detect();
        }

        let Some(base_url) = options
            .base_url
            .or_else(|| self.config.base_url.clone())
            .or_else(&mut detect)
        else {
            error!(service = %key, "❌ No base URL configured or detected, service not registered");
            return None;
        };
        if !is_valid_url(&base_url) {
            error!(service = %key, url = %base_url, "❌ Malformed base URL, service not registered");
            return None;
        }

        let instance_id = options.instance_id.unwrap_or_else(generate_instance_id);
        let record = RegistrationRecord::new(key, instance_id.clone(), base_url)
            .with_container_url(container_url)
            .with_cluster_id(self.config.cluster_id.clone())
            .with_ttl(ttl)
            .with_ping_interval(ping_interval)
            .with_singleton(options.singleton.unwrap_or(defaults.singleton));

        self.registrations.register(record).await;
        Some(instance_id)
    }

    /// 注销本进程注册的全部实例
    pub async fn deregister(&self) {
        self.registrations.deregister_all().await;
    }

    /// 注销指定实例
    pub async fn deregister_instance(&self, instance_id: &str) -> bool {
        self.registrations.deregister(instance_id).await
    }

    /// 解析服务实例地址列表
    pub async fn get_service_instances(
        &self,
        name: &str,
        version: &str,
        environment: &str,
        access_type: AccessType,
    ) -> Result<Vec<String>> {
        let (_, endpoints) = self.resolve_endpoints(name, version, environment, access_type).await?;
        Ok(endpoints)
    }

    /// 轮询选出一个实例地址
    pub async fn get_service_instance(
        &self,
        name: &str,
        version: &str,
        environment: &str,
        access_type: AccessType,
    ) -> Result<Option<String>> {
        let (key, endpoints) = self.resolve_endpoints(name, version, environment, access_type).await?;
        Ok(self.round_robin.select(&key, &endpoints).await.cloned())
    }

    /// 与 [`Self::get_service_instance`] 相同，找不到实例时返回 `ServiceNotFound`
    pub async fn require_service_instance(
        &self,
        name: &str,
        version: &str,
        environment: &str,
        access_type: AccessType,
    ) -> Result<String> {
        self.get_service_instance(name, version, environment, access_type)
            .await?
            .ok_or_else(|| DiscoveryError::service_not_found(format!("{}:{}@{}", name, version, environment)))
    }

    /// 服务的已知版本
    pub async fn get_service_versions(&self, name: &str, environment: &str) -> Result<Vec<String>> {
        self.cache.get_versions(&ServiceKey::new(name, environment)).await
    }

    /// 禁用指定地址的实例（对所有共享后端的客户端生效）
    pub async fn disable_service_instance(&self, name: &str, version: &str, environment: &str, url: &str) {
        let key = VersionedServiceKey::new(name, version, environment);
        self.cache.disable(&key, url).await;
    }

    async fn resolve_endpoints(
        &self,
        name: &str,
        requested: &str,
        environment: &str,
        access_type: AccessType,
    ) -> Result<(VersionedServiceKey, Vec<String>)> {
        let service = ServiceKey::new(name, environment);
        let resolved = if version::is_range(requested) {
            let versions = self.cache.get_versions(&service).await?;
            let resolved = version::resolve(requested, &versions);
            debug!(service = %service, requested = %requested, resolved = %resolved, "Version resolved");
            resolved
        } else {
            requested.to_string()
        };

        let key = service.with_version(resolved);
        let instances = self.cache.get_instances(&key).await?;
        if instances.is_empty() {
            return Ok((key, Vec::new()));
        }

        if access_type == AccessType::Gateway {
            if let Some(gateway) = self.cache.get_gateway(&key).await? {
                return Ok((key, vec![gateway]));
            }
        }

        let cluster_id = self.config.cluster_id.as_deref();
        let endpoints = instances
            .iter()
            .map(|instance| instance.endpoint_for(cluster_id).to_string())
            .collect();
        Ok((key, endpoints))
    }
}
