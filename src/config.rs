//! 服务发现配置
//!
//! 支持从 TOML 文件加载，并可通过 `DISCOVERY_*` 环境变量覆盖

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, Result};

/// 服务发现配置
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub backend: BackendConfig,
    pub retry: RetryConfig,
    pub service: ServiceDefaults,
    /// 集群 ID，设置后同集群的实例使用 container URL 互相访问
    pub cluster_id: Option<String>,
    /// 本实例在集群内部的访问地址
    pub container_url: Option<String>,
    /// 本实例对外的访问地址，为空时根据网卡地址推断
    pub base_url: Option<String>,
    /// 服务端口（推断 base URL 时使用）
    pub port: Option<u16>,
    pub round_robin: RoundRobinScope,
    pub log: LogConfig,
}

/// 后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    #[default]
    Etcd,
    Consul,
    Memory,
}

impl std::str::FromStr for BackendType {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "etcd" | "etcd3" => Ok(BackendType::Etcd),
            "consul" => Ok(BackendType::Consul),
            "memory" | "in-memory" => Ok(BackendType::Memory),
            _ => Err(DiscoveryError::config(format!("Unknown backend type: {}", s))),
        }
    }
}

/// 后端连接配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    /// etcd: 集群地址列表；Consul: agent 地址（取第一个）
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Consul: 检查持续失败多久后自动注销
    pub deregister_critical_after_secs: u64,
    /// Consul: 阻塞查询的最长等待时间
    pub watch_wait_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: BackendType::Etcd,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            username: None,
            password: None,
            deregister_critical_after_secs: 60,
            watch_wait_secs: 120,
        }
    }
}

/// 重试配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub start_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 首次读取的重试次数：0 快速失败，N > 0 有界重试，负数或未设置为无界
    pub initial_retry_count: Option<i64>,
    /// 关闭后所有后端操作快速失败，并向调用方返回 `BackendUnavailable`
    pub resilience: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            start_delay_ms: 500,
            max_delay_ms: 900_000,
            initial_retry_count: Some(1),
            resilience: true,
        }
    }
}

/// 服务注册默认值
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceDefaults {
    pub name: Option<String>,
    pub version: String,
    pub environment: String,
    pub ttl_secs: u64,
    pub ping_interval_secs: u64,
    pub singleton: bool,
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            name: None,
            version: "1.0.0".to_string(),
            environment: "dev".to_string(),
            ttl_secs: 30,
            ping_interval_secs: 20,
            singleton: false,
        }
    }
}

/// 轮询计数器的作用域
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoundRobinScope {
    /// 所有服务共享一个计数器（兼容旧行为）
    #[default]
    Shared,
    /// 每个 (服务, 版本, 环境) 单独计数
    PerKey,
}

/// 日志配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl DiscoveryConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DiscoveryConfig = toml::from_str(&content)?;
        let config = config.with_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// 默认配置叠加环境变量
    pub fn from_env() -> Result<Self> {
        let config = Self::default().with_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// 用 `lookup` 提供的变量覆盖配置
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("DISCOVERY_BACKEND") {
            self.backend.backend_type = backend.parse()?;
        }
        if let Some(endpoints) = lookup("DISCOVERY_ENDPOINTS") {
            self.backend.endpoints = endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(cluster_id) = lookup("DISCOVERY_CLUSTER_ID") {
            self.cluster_id = Some(cluster_id).filter(|s| !s.is_empty());
        }
        if let Some(resilience) = lookup("DISCOVERY_RESILIENCE") {
            self.retry.resilience = parse_env("DISCOVERY_RESILIENCE", &resilience)?;
        }
        if let Some(start) = lookup("DISCOVERY_START_RETRY_DELAY_MS") {
            self.retry.start_delay_ms = parse_env("DISCOVERY_START_RETRY_DELAY_MS", &start)?;
        }
        if let Some(max) = lookup("DISCOVERY_MAX_RETRY_DELAY_MS") {
            self.retry.max_delay_ms = parse_env("DISCOVERY_MAX_RETRY_DELAY_MS", &max)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.start_delay_ms == 0 {
            return Err(DiscoveryError::config("retry.start_delay_ms must be positive"));
        }
        if self.retry.max_delay_ms < self.retry.start_delay_ms {
            return Err(DiscoveryError::config(
                "retry.max_delay_ms must not be smaller than retry.start_delay_ms",
            ));
        }
        if self.backend.backend_type != BackendType::Memory && self.backend.endpoints.is_empty() {
            return Err(DiscoveryError::config("backend.endpoints must not be empty"));
        }
        if self.service.ping_interval_secs == 0 {
            return Err(DiscoveryError::config("service.ping_interval_secs must be positive"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DiscoveryError::config(format!("{} has invalid value: {}", key, value)))
}
