//! etcd 服务发现后端
//!
//! 实例字段挂在以 TTL 创建的 lease 上，心跳即 lease keep-alive；
//! lease 过期后 keep-alive 返回 TTL 0，映射为 `RecordNotFound`

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, DeleteOptions, EventType, GetOptions, KeyValue, PutOptions, Txn, TxnOp, WatchOptions,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use super::kv::{change_from_kv, collect_instances};
use super::{DiscoveryBackend, InstanceSnapshot, ServiceSnapshot, WatchMessage};
use crate::config::BackendConfig;
use crate::discovery::key::{ServiceKey, VersionedServiceKey, WatchTarget, paths};
use crate::discovery::registration::RegistrationRecord;
use crate::error::{DiscoveryError, Result};

const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(5);
const WATCH_BUFFER: usize = 64;

/// etcd 服务发现后端
pub struct EtcdBackend {
    client: Client,
    /// instance_id -> lease id
    leases: Mutex<HashMap<String, i64>>,
}

impl EtcdBackend {
    /// 连接 etcd 集群
    pub async fn new(config: &BackendConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(DiscoveryError::config("etcd endpoints not configured"));
        }

        let options = match (&config.username, &config.password) {
            (Some(user), Some(password)) => Some(ConnectOptions::new().with_user(user.clone(), password.clone())),
            _ => None,
        };
        let client = Client::connect(&config.endpoints, options).await?;
        info!(endpoints = ?config.endpoints, "✅ Connected to etcd");

        Ok(Self {
            client,
            leases: Mutex::new(HashMap::new()),
        })
    }

    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, u64)> {
        let mut client = self.client.clone();
        let resp = client.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok((resp.kvs().to_vec(), revision.max(0) as u64))
    }
}

fn utf8_entries(kvs: &[KeyValue]) -> Vec<(&str, &str)> {
    kvs.iter()
        .filter_map(|kv| Some((kv.key_str().ok()?, kv.value_str().ok()?)))
        .collect()
}

#[async_trait]
impl DiscoveryBackend for EtcdBackend {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn register_instance(&self, record: &RegistrationRecord) -> Result<()> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(record.ttl.as_secs() as i64, None).await?;
        let lease_id = lease.id();

        let put = |field: &str, value: &str| {
            TxnOp::put(
                paths::instance_field(&record.key, &record.instance_id, field),
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )
        };
        let mut ops = vec![put(paths::URL, &record.base_url)];
        if let Some(container_url) = &record.container_url {
            ops.push(put(paths::CONTAINER_URL, container_url));
        }
        if let Some(cluster_id) = &record.cluster_id {
            ops.push(put(paths::CLUSTER_ID, cluster_id));
        }
        client.txn(Txn::new().and_then(ops)).await?;

        if let Some(previous) = self.leases.lock().await.insert(record.instance_id.clone(), lease_id) {
            // 旧 lease 上的键会随其过期，这里只尽力回收
            let _ = client.lease_revoke(previous).await;
        }
        debug!(instance_id = %record.instance_id, lease_id, "etcd lease granted");
        Ok(())
    }

    async fn heartbeat(&self, record: &RegistrationRecord) -> Result<()> {
        let Some(lease_id) = self.leases.lock().await.get(&record.instance_id).copied() else {
            return Err(DiscoveryError::record_not_found(format!(
                "no lease for instance {}",
                record.instance_id
            )));
        };

        let mut client = self.client.clone();
        let (_keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        let response = tokio::time::timeout(KEEP_ALIVE_TIMEOUT, stream.message())
            .await
            .map_err(|_| DiscoveryError::unavailable("etcd keep-alive timeout"))??;

        match response {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => {
                self.leases.lock().await.remove(&record.instance_id);
                Err(DiscoveryError::record_not_found(format!("lease {} expired", lease_id)))
            }
        }
    }

    async fn list_instances(&self, key: &VersionedServiceKey) -> Result<InstanceSnapshot> {
        let (kvs, index) = self.get_prefix(&paths::instances(key)).await?;
        let instances = collect_instances(utf8_entries(&kvs)).remove(key).unwrap_or_default();
        Ok(InstanceSnapshot { instances, index })
    }

    async fn list_service(&self, key: &ServiceKey) -> Result<ServiceSnapshot> {
        let (kvs, index) = self.get_prefix(&format!("{}/", paths::versions(key))).await?;
        let versions = collect_instances(utf8_entries(&kvs))
            .into_iter()
            .filter(|(_, instances)| !instances.is_empty())
            .map(|(k, instances)| (k.version, instances))
            .collect();
        Ok(ServiceSnapshot { versions, index })
    }

    async fn watch(&self, target: &WatchTarget, from_index: u64) -> Result<mpsc::Receiver<WatchMessage>> {
        let mut options = WatchOptions::new();
        if !matches!(target, WatchTarget::Gateway(_)) {
            options = options.with_prefix();
        }
        if from_index > 0 {
            options = options.with_start_revision(from_index as i64);
        }

        let mut client = self.client.clone();
        let (watcher, mut stream) = client.watch(target.watch_prefix(), Some(options)).await?;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let target = target.clone();

        tokio::spawn(async move {
            // watcher 被 drop 时 etcd 端的 watch 会被取消
            let _watcher = watcher;
            loop {
                let message = tokio::select! {
                    _ = tx.closed() => break,
                    message = stream.message() => message,
                };
                let resp = match message {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(target = %target, error = %e, "⚠️ etcd watch stream failed");
                        break;
                    }
                };

                if resp.compact_revision() > 0 {
                    let _ = tx
                        .send(WatchMessage::IndexCleared {
                            current_index: resp.compact_revision() as u64,
                        })
                        .await;
                    break;
                }
                if resp.canceled() {
                    break;
                }

                let mut index = 0u64;
                let events: Vec<_> = resp
                    .events()
                    .iter()
                    .filter_map(|event| {
                        let kv = event.kv()?;
                        let path = kv.key_str().ok()?;
                        let revision = kv.mod_revision().max(0) as u64;
                        index = index.max(revision);
                        let value = match event.event_type() {
                            EventType::Put => Some(kv.value_str().ok()?),
                            EventType::Delete => None,
                        };
                        change_from_kv(path, value, revision)
                    })
                    .collect();

                if index == 0 {
                    continue;
                }
                if tx.send(WatchMessage::Events { events, index }).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn get_value(&self, path: &str) -> Result<(Option<String>, u64)> {
        let mut client = self.client.clone();
        let resp = client.get(path, None).await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default().max(0) as u64;
        let value = match resp.kvs().first() {
            Some(kv) => Some(kv.value_str()?.to_string()),
            None => None,
        };
        Ok((value, revision))
    }

    async fn put_value(&self, path: &str, value: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.put(path, value, None).await?;
        Ok(())
    }

    async fn delete_instance(&self, record: &RegistrationRecord) -> Result<()> {
        let mut client = self.client.clone();
        if let Some(lease_id) = self.leases.lock().await.remove(&record.instance_id) {
            if let Err(e) = client.lease_revoke(lease_id).await {
                debug!(lease_id, error = %e, "Failed to revoke etcd lease");
            }
        }

        let prefix = format!("{}/", paths::instance(&record.key, &record.instance_id));
        client.delete(prefix, Some(DeleteOptions::new().with_prefix())).await?;
        Ok(())
    }

    async fn disable_instance(&self, key: &VersionedServiceKey, url: &str) -> Result<()> {
        let (kvs, _) = self.get_prefix(&paths::instances(key)).await?;
        let mut client = self.client.clone();

        for kv in &kvs {
            let (Ok(path), Ok(value)) = (kv.key_str(), kv.value_str()) else {
                continue;
            };
            if value != url || !path.ends_with(&format!("/{}", paths::URL)) {
                continue;
            }

            let status_path = format!("{}/{}", path.trim_end_matches(paths::URL).trim_end_matches('/'), paths::STATUS);
            let options = (kv.lease() != 0).then(|| PutOptions::new().with_lease(kv.lease()));
            client.put(status_path, paths::STATUS_DISABLED, options).await?;
            info!(key = %path, "🚫 Instance disabled in etcd");
        }
        Ok(())
    }
}
