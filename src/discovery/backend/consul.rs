//! Consul 服务发现后端
//!
//! 实例注册为 Consul 服务 `{env}-{name}`，版本写在 `version=` 标签中，
//! 访问地址写在 Meta 中；存活依赖 TTL 检查，心跳即 `check/pass`。
//! 网关地址存放在 KV 中，与 etcd 后端使用相同的路径。

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client as HttpClient, Response, StatusCode};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{ChangeEvent, ChangeKind, DiscoveryBackend, InstanceSnapshot, ServiceSnapshot, WatchMessage};
use crate::config::BackendConfig;
use crate::discovery::instance::{ServiceInstance, is_valid_url};
use crate::discovery::key::{ServiceKey, VersionedServiceKey, WatchTarget, paths};
use crate::discovery::registration::RegistrationRecord;
use crate::error::{DiscoveryError, Result};

const INDEX_HEADER: &str = "X-Consul-Index";
const VERSION_TAG: &str = "version=";
const META_URL: &str = "url";
const META_CONTAINER_URL: &str = "containerUrl";
const META_CLUSTER_ID: &str = "clusterId";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const WATCH_BUFFER: usize = 64;

/// Consul 服务发现后端
#[derive(Clone)]
pub struct ConsulBackend {
    http_client: HttpClient,
    consul_url: String,
    deregister_after: Duration,
    wait: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    service: AgentService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    tags: Option<Vec<String>>,
    meta: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    value: Option<String>,
}

/// (版本, 实例 ID) -> 实例
type Snapshot = BTreeMap<(String, String), ServiceInstance>;

impl ConsulBackend {
    /// 使用第一个 endpoint 作为 agent 地址
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let consul_url = config
            .endpoints
            .first()
            .map(|s| s.trim_end_matches('/').to_string())
            .ok_or_else(|| DiscoveryError::config("consul endpoint not configured"))?;

        Ok(Self {
            http_client: HttpClient::new(),
            consul_url,
            deregister_after: Duration::from_secs(config.deregister_critical_after_secs),
            wait: Duration::from_secs(config.watch_wait_secs),
        })
    }

    fn service_name(key: &ServiceKey) -> String {
        format!("{}-{}", key.environment, key.name)
    }

    fn kv_url(&self, path: &str) -> String {
        format!("{}/v1/kv/{}", self.consul_url, path.trim_start_matches('/'))
    }

    /// 查询通过健康检查的实例，`version` 为 `None` 时返回所有版本
    async fn health(&self, service: &ServiceKey, version: Option<&str>, index: u64) -> Result<(Snapshot, u64)> {
        let url = format!("{}/v1/health/service/{}", self.consul_url, Self::service_name(service));
        let mut query = vec![("passing", "true".to_string())];
        if let Some(version) = version {
            query.push(("tag", format!("{}{}", VERSION_TAG, version)));
        }
        let request = if index > 0 {
            query.push(("index", index.to_string()));
            query.push(("wait", format!("{}s", self.wait.as_secs())));
            self.http_client.get(&url).timeout(self.wait + REQUEST_TIMEOUT)
        } else {
            self.http_client.get(&url).timeout(REQUEST_TIMEOUT)
        };

        let resp = check_status(request.query(&query).send().await?).await?;
        let index = consul_index(&resp);
        let entries: Vec<HealthEntry> = resp.json().await?;
        Ok((to_snapshot(entries), index))
    }

    /// 读取 KV，键不存在时值为 `None`
    async fn kv_get(&self, path: &str, index: u64) -> Result<(Option<String>, u64)> {
        let mut request = self.http_client.get(self.kv_url(path));
        request = if index > 0 {
            request
                .query(&[("index", index.to_string()), ("wait", format!("{}s", self.wait.as_secs()))])
                .timeout(self.wait + REQUEST_TIMEOUT)
        } else {
            request.timeout(REQUEST_TIMEOUT)
        };

        let resp = request.send().await?;
        let index = consul_index(&resp);
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok((None, index));
        }
        let resp = check_status(resp).await?;
        let entries: Vec<KvEntry> = resp.json().await?;

        let value = match entries.into_iter().next().and_then(|e| e.value) {
            Some(encoded) => {
                let bytes = BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|e| DiscoveryError::malformed(format!("invalid base64 in kv {}: {}", path, e)))?;
                Some(String::from_utf8(bytes)?)
            }
            None => None,
        };
        Ok((value, index))
    }

    async fn watch_service(
        self,
        target: WatchTarget,
        from_index: u64,
        tx: mpsc::Sender<WatchMessage>,
    ) {
        let version = match &target {
            WatchTarget::Version(key) => Some(key.version.clone()),
            _ => None,
        };
        let service = target.service().clone();

        let (mut previous, mut index) = match self.health(&service, version.as_deref(), 0).await {
            Ok(baseline) => baseline,
            Err(e) => {
                warn!(target = %target, error = %e, "⚠️ Consul watch baseline failed");
                return;
            }
        };
        if changed_since(from_index, index) {
            // Consul 没有事件历史，无法重放删除，交给调用方重新读取
            let _ = tx.send(WatchMessage::IndexCleared { current_index: index }).await;
            return;
        }

        index = index.max(1);
        loop {
            let queried = tokio::select! {
                _ = tx.closed() => return,
                queried = self.health(&service, version.as_deref(), index) => queried,
            };
            let (current, next_index) = match queried {
                Ok(result) => result,
                Err(e) => {
                    warn!(target = %target, error = %e, "⚠️ Consul blocking query failed");
                    return;
                }
            };

            if next_index < index {
                let _ = tx.send(WatchMessage::IndexCleared { current_index: next_index }).await;
                return;
            }
            if next_index == index {
                continue;
            }

            let events = diff(&service, &previous, &current, next_index);
            previous = current;
            index = next_index;
            if events.is_empty() {
                continue;
            }
            if tx.send(WatchMessage::Events { events, index }).await.is_err() {
                return;
            }
        }
    }

    async fn watch_gateway(
        self,
        key: VersionedServiceKey,
        from_index: u64,
        tx: mpsc::Sender<WatchMessage>,
    ) {
        let path = paths::gateway(&key);
        let (mut previous, mut index) = match self.kv_get(&path, 0).await {
            Ok(baseline) => baseline,
            Err(e) => {
                warn!(service = %key, error = %e, "⚠️ Consul gateway watch baseline failed");
                return;
            }
        };
        if changed_since(from_index, index) {
            let _ = tx.send(WatchMessage::IndexCleared { current_index: index }).await;
            return;
        }

        index = index.max(1);
        loop {
            let queried = tokio::select! {
                _ = tx.closed() => return,
                queried = self.kv_get(&path, index) => queried,
            };
            let (value, next_index) = match queried {
                Ok(result) => result,
                Err(e) => {
                    warn!(service = %key, error = %e, "⚠️ Consul gateway blocking query failed");
                    return;
                }
            };

            if next_index < index {
                let _ = tx.send(WatchMessage::IndexCleared { current_index: next_index }).await;
                return;
            }
            index = next_index;
            if value == previous {
                continue;
            }

            previous = value.clone();
            let event = ChangeEvent::new(key.clone(), "", ChangeKind::GatewayChanged(value), index);
            if tx.send(WatchMessage::Events { events: vec![event], index }).await.is_err() {
                return;
            }
        }
    }
}

/// 调用方读取之后路径是否已经变化
fn changed_since(from_index: u64, index: u64) -> bool {
    from_index > 0 && index >= from_index
}

fn consul_index(resp: &Response) -> u64 {
    resp.headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or_default()
}

async fn check_status(resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(DiscoveryError::unavailable(format!("consul returned {}: {}", status, body.trim())))
}

/// TTL 检查不存在说明服务已被 agent 注销
fn is_missing_check(status: StatusCode, body: &str) -> bool {
    let body = body.to_lowercase();
    status == StatusCode::NOT_FOUND
        || (status.is_server_error() && (body.contains("unknown check") || body.contains("does not have associated ttl")))
}

fn to_snapshot(entries: Vec<HealthEntry>) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for HealthEntry { service } in entries {
        let version = service
            .tags
            .unwrap_or_default()
            .into_iter()
            .find_map(|tag| tag.strip_prefix(VERSION_TAG).map(str::to_string));
        let meta = service.meta.unwrap_or_default();

        let (Some(version), Some(url)) = (version, meta.get(META_URL)) else {
            debug!(instance_id = %service.id, "Skipping consul service without version tag or url");
            continue;
        };
        if !is_valid_url(url) {
            error!(instance_id = %service.id, url = %url, "❌ Malformed instance url in consul");
            continue;
        }

        let mut instance = ServiceInstance::new(service.id.clone(), version.clone(), url.clone());
        if let Some(container_url) = meta.get(META_CONTAINER_URL).filter(|u| is_valid_url(u)) {
            instance = instance.with_container_url(container_url.clone());
        }
        if let Some(cluster_id) = meta.get(META_CLUSTER_ID).filter(|c| !c.is_empty()) {
            instance = instance.with_cluster_id(cluster_id.clone());
        }
        snapshot.insert((version, service.id), instance);
    }
    snapshot
}

/// 比较两次快照，生成变化事件
fn diff(service: &ServiceKey, previous: &Snapshot, current: &Snapshot, index: u64) -> Vec<ChangeEvent> {
    let mut events = Vec::new();

    for ((version, id), instance) in current {
        let key = service.with_version(version.clone());
        let old = previous.get(&(version.clone(), id.clone()));

        if old.map(|o| &o.base_url) != Some(&instance.base_url) {
            events.push(ChangeEvent::new(
                key.clone(),
                id.clone(),
                ChangeKind::InstanceUp {
                    base_url: instance.base_url.clone(),
                },
                index,
            ));
        }
        if old.map(|o| &o.container_url) != Some(&instance.container_url)
            && (old.is_some() || instance.container_url.is_some())
        {
            events.push(ChangeEvent::new(
                key.clone(),
                id.clone(),
                ChangeKind::ContainerUrlChanged(instance.container_url.clone()),
                index,
            ));
        }
        if old.map(|o| &o.cluster_id) != Some(&instance.cluster_id) && (old.is_some() || instance.cluster_id.is_some())
        {
            events.push(ChangeEvent::new(
                key,
                id.clone(),
                ChangeKind::ClusterIdChanged(instance.cluster_id.clone()),
                index,
            ));
        }
    }

    for (version, id) in previous.keys() {
        if !current.contains_key(&(version.clone(), id.clone())) {
            events.push(ChangeEvent::new(
                service.with_version(version.clone()),
                id.clone(),
                ChangeKind::InstanceRemoved,
                index,
            ));
        }
    }

    events
}

#[async_trait]
impl DiscoveryBackend for ConsulBackend {
    fn name(&self) -> &'static str {
        "consul"
    }

    async fn register_instance(&self, record: &RegistrationRecord) -> Result<()> {
        let url = format!("{}/v1/agent/service/register", self.consul_url);

        let mut meta = serde_json::Map::new();
        meta.insert(META_URL.into(), record.base_url.clone().into());
        if let Some(container_url) = &record.container_url {
            meta.insert(META_CONTAINER_URL.into(), container_url.clone().into());
        }
        if let Some(cluster_id) = &record.cluster_id {
            meta.insert(META_CLUSTER_ID.into(), cluster_id.clone().into());
        }

        let check_id = format!("service:{}", record.instance_id);
        let payload = serde_json::json!({
            "ID": record.instance_id,
            "Name": Self::service_name(&record.key.service),
            "Tags": [format!("{}{}", VERSION_TAG, record.key.version)],
            "Meta": meta,
            "Check": {
                "CheckID": check_id,
                "TTL": format!("{}s", record.ttl.as_secs().max(1)),
                "DeregisterCriticalServiceAfter": format!("{}s", self.deregister_after.as_secs().max(1)),
            }
        });

        check_status(
            self.http_client
                .put(&url)
                .json(&payload)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await?,
        )
        .await?;

        // 新注册的 TTL 检查处于 critical 状态，立即置为 passing
        self.heartbeat(record).await?;
        info!(instance_id = %record.instance_id, service = %record.key, "✅ Service registered with Consul");
        Ok(())
    }

    async fn heartbeat(&self, record: &RegistrationRecord) -> Result<()> {
        let url = format!("{}/v1/agent/check/pass/service:{}", self.consul_url, record.instance_id);
        let resp = self.http_client.put(&url).timeout(REQUEST_TIMEOUT).send().await?;
        if resp.status().is_success() {
            return Ok(());
        }

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if is_missing_check(status, &body) {
            Err(DiscoveryError::record_not_found(format!(
                "consul check for {} not found",
                record.instance_id
            )))
        } else {
            Err(DiscoveryError::unavailable(format!(
                "consul TTL update failed with {}: {}",
                status,
                body.trim()
            )))
        }
    }

    async fn list_instances(&self, key: &VersionedServiceKey) -> Result<InstanceSnapshot> {
        let (snapshot, index) = self.health(&key.service, Some(&key.version), 0).await?;
        Ok(InstanceSnapshot {
            instances: snapshot.into_values().collect(),
            index,
        })
    }

    async fn list_service(&self, key: &ServiceKey) -> Result<ServiceSnapshot> {
        let (snapshot, index) = self.health(key, None, 0).await?;
        let mut versions: BTreeMap<String, Vec<ServiceInstance>> = BTreeMap::new();
        for ((version, _), instance) in snapshot {
            versions.entry(version).or_default().push(instance);
        }
        Ok(ServiceSnapshot { versions, index })
    }

    async fn watch(&self, target: &WatchTarget, from_index: u64) -> Result<mpsc::Receiver<WatchMessage>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let backend = self.clone();

        match target.clone() {
            WatchTarget::Gateway(key) => {
                tokio::spawn(backend.watch_gateway(key, from_index, tx));
            }
            target => {
                tokio::spawn(backend.watch_service(target, from_index, tx));
            }
        }
        Ok(rx)
    }

    async fn get_value(&self, path: &str) -> Result<(Option<String>, u64)> {
        self.kv_get(path, 0).await
    }

    async fn put_value(&self, path: &str, value: &str) -> Result<()> {
        check_status(
            self.http_client
                .put(self.kv_url(path))
                .body(value.to_string())
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn delete_instance(&self, record: &RegistrationRecord) -> Result<()> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.consul_url, record.instance_id);
        check_status(self.http_client.put(&url).timeout(REQUEST_TIMEOUT).send().await?).await?;
        info!(instance_id = %record.instance_id, "Service deregistered from Consul");
        Ok(())
    }

    async fn disable_instance(&self, key: &VersionedServiceKey, url: &str) -> Result<()> {
        let (snapshot, _) = self.health(&key.service, Some(&key.version), 0).await?;

        for instance in snapshot.values().filter(|i| i.base_url == url) {
            let maintenance = format!("{}/v1/agent/service/maintenance/{}", self.consul_url, instance.id);
            check_status(
                self.http_client
                    .put(&maintenance)
                    .query(&[("enable", "true"), ("reason", "disabled")])
                    .timeout(REQUEST_TIMEOUT)
                    .send()
                    .await?,
            )
            .await?;
            info!(instance_id = %instance.id, url = %url, "🚫 Instance put into maintenance in Consul");
        }
        Ok(())
    }
}
