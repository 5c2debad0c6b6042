//! 实例缓存
//!
//! 首次访问时从后端冷加载并建立 watch，之后由 watch 事件维护：
//! - 每个 (服务, 版本, 环境) 的实例集合
//! - 每个 (服务, 环境) 的版本集合
//! - 每个键的 "last known" 实例，在实例集合为空时返回
//! - 每个版本的网关地址
//!
//! 每个被 watch 的路径只有一个任务，事件严格按后端顺序应用

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::discovery::backend::{ChangeEvent, ChangeKind, DiscoveryBackend, WatchMessage};
use crate::discovery::instance::{ServiceInstance, is_valid_url};
use crate::discovery::key::{ServiceKey, VersionedServiceKey, WatchTarget};
use crate::error::{DiscoveryError, Result};
use crate::retry::{Backoff, RetryPolicies, retry};

#[derive(Default)]
struct CacheState {
    /// 实例 ID -> 实例；`base_url` 为空的条目只收到了部分字段，不对外返回
    instances: HashMap<VersionedServiceKey, BTreeMap<String, ServiceInstance>>,
    versions: HashMap<ServiceKey, BTreeSet<String>>,
    last_known: HashMap<VersionedServiceKey, ServiceInstance>,
    last_known_versions: HashMap<ServiceKey, String>,
    gateways: HashMap<VersionedServiceKey, Option<String>>,
}

impl CacheState {
    fn live(&self, key: &VersionedServiceKey) -> Option<Vec<ServiceInstance>> {
        self.instances.get(key).map(|entries| {
            entries
                .values()
                .filter(|i| i.active && !i.base_url.is_empty())
                .cloned()
                .collect()
        })
    }

    /// 可用实例，为空时回退到 last known
    fn resolve(&self, key: &VersionedServiceKey) -> Option<Vec<ServiceInstance>> {
        let live = self.live(key)?;
        if live.is_empty() {
            if let Some(last) = self.last_known.get(key) {
                warn!(service = %key, instance_id = %last.id, "⚠️ No live instances, using last known instance");
                return Some(vec![last.clone()]);
            }
        }
        Some(live)
    }

    fn versions_with_fallback(&self, key: &ServiceKey) -> Option<Vec<String>> {
        let mut versions = self.versions.get(key)?.clone();
        if let Some(last) = self.last_known_versions.get(key) {
            versions.insert(last.clone());
        }
        Some(versions.into_iter().collect())
    }

    fn apply(&mut self, event: ChangeEvent) {
        let ChangeEvent {
            key,
            instance_id,
            kind,
            index,
        } = event;

        match kind {
            ChangeKind::GatewayChanged(url) => {
                let url = url.filter(|u| valid_or_log(&key, "", u));
                info!(service = %key, gateway = ?url, index, "🔀 Gateway URL changed");
                self.gateways.insert(key, url);
                return;
            }
            ChangeKind::InstanceUp { base_url } => {
                if !valid_or_log(&key, &instance_id, &base_url) {
                    return;
                }
                info!(service = %key, instance_id = %instance_id, url = %base_url, index, "➕ Service instance added");
                let entry = self.entry(&key, &instance_id);
                entry.base_url = base_url;
                entry.active = true;
                self.last_known.remove(&key);
            }
            ChangeKind::InstanceRemoved => self.remove(&key, &instance_id, false, index),
            ChangeKind::InstanceDisabled => self.remove(&key, &instance_id, true, index),
            ChangeKind::ContainerUrlChanged(url) => {
                let url = url.filter(|u| valid_or_log(&key, &instance_id, u));
                debug!(service = %key, instance_id = %instance_id, container_url = ?url, "Container URL changed");
                let clear = url.is_none();
                self.update_field(&key, &instance_id, clear, |entry| entry.container_url = url);
            }
            ChangeKind::ClusterIdChanged(cluster_id) => {
                debug!(service = %key, instance_id = %instance_id, cluster_id = ?cluster_id, "Cluster id changed");
                let clear = cluster_id.is_none();
                self.update_field(&key, &instance_id, clear, |entry| entry.cluster_id = cluster_id);
            }
        }

        self.sync_version(&key);
    }

    /// 移除实例；被删除（而不是被禁用）的最后一个实例保留为 last known
    fn remove(&mut self, key: &VersionedServiceKey, instance_id: &str, disabled: bool, index: u64) {
        let removed = self
            .instances
            .get_mut(key)
            .and_then(|entries| entries.remove(instance_id))
            .filter(|i| !i.base_url.is_empty());
        let Some(removed) = removed else { return };

        if disabled {
            info!(service = %key, instance_id = %instance_id, index, "🚫 Service instance disabled");
            return;
        }
        info!(service = %key, instance_id = %instance_id, index, "➖ Service instance removed");

        if self.live(key).is_some_and(|live| live.is_empty()) {
            self.last_known_versions.insert(key.service.clone(), key.version.clone());
            self.last_known.insert(key.clone(), removed);
        }
    }

    /// 用后端快照替换一个键的实例集合
    ///
    /// 快照中不存在的实例按删除处理（保留 last known），其余实例整体覆盖
    fn replace(&mut self, key: &VersionedServiceKey, instances: Vec<ServiceInstance>, index: u64) {
        let fresh: BTreeMap<String, ServiceInstance> = instances
            .into_iter()
            .filter(|i| valid_or_log(key, &i.id, &i.base_url))
            .map(|i| (i.id.clone(), i))
            .collect();

        let stale: Vec<String> = self
            .instances
            .get(key)
            .map(|entries| entries.keys().filter(|id| !fresh.contains_key(*id)).cloned().collect())
            .unwrap_or_default();
        for id in stale {
            self.remove(key, &id, false, index);
        }

        let entries = self.instances.entry(key.clone()).or_default();
        for (id, instance) in fresh {
            if !entries.get(&id).is_some_and(|known| !known.base_url.is_empty()) {
                info!(service = %key, instance_id = %id, url = %instance.base_url, index, "➕ Service instance added");
            }
            entries.insert(id, instance);
        }
        if self.live(key).is_some_and(|live| !live.is_empty()) {
            self.last_known.remove(key);
        }

        self.sync_version(key);
    }

    /// 更新单个元数据字段
    ///
    /// 清除事件不会为已移除的实例重建条目；字段全部清空的占位条目随之删除
    fn update_field(
        &mut self,
        key: &VersionedServiceKey,
        instance_id: &str,
        clear: bool,
        update: impl FnOnce(&mut ServiceInstance),
    ) {
        let present = self
            .instances
            .get(key)
            .is_some_and(|entries| entries.contains_key(instance_id));
        if clear && !present {
            return;
        }

        let entry = self.entry(key, instance_id);
        update(entry);
        let empty_placeholder =
            entry.base_url.is_empty() && entry.container_url.is_none() && entry.cluster_id.is_none();
        if empty_placeholder {
            if let Some(entries) = self.instances.get_mut(key) {
                entries.remove(instance_id);
            }
        }
    }

    fn entry(&mut self, key: &VersionedServiceKey, instance_id: &str) -> &mut ServiceInstance {
        self.instances
            .entry(key.clone())
            .or_default()
            .entry(instance_id.to_string())
            .or_insert_with(|| ServiceInstance::new(instance_id, key.version.clone(), ""))
    }

    /// 版本集合随实例增删变化（只维护已加载过版本列表的服务）
    fn sync_version(&mut self, key: &VersionedServiceKey) {
        let has_live = self.live(key).is_some_and(|live| !live.is_empty());
        let Some(versions) = self.versions.get_mut(&key.service) else {
            return;
        };
        if has_live {
            if versions.insert(key.version.clone()) {
                info!(service = %key.service, version = %key.version, "🆕 Service version added");
            }
        } else if versions.remove(&key.version) {
            info!(service = %key.service, version = %key.version, "Service version removed");
        }
    }
}

fn valid_or_log(key: &VersionedServiceKey, instance_id: &str, url: &str) -> bool {
    let valid = is_valid_url(url);
    if !valid {
        error!(service = %key, instance_id = %instance_id, url = %url, "❌ Malformed URL in watch event, ignored");
    }
    valid
}

struct CacheInner {
    backend: Arc<dyn DiscoveryBackend>,
    policies: RetryPolicies,
    resilience: bool,
    start_delay: Duration,
    max_delay: Duration,
    state: RwLock<CacheState>,
    watches: Mutex<HashMap<WatchTarget, JoinHandle<()>>>,
}

impl CacheInner {
    /// 重新读取 watch 路径的完整状态，返回快照所在的索引
    async fn resync(&self, target: &WatchTarget) -> Result<u64> {
        match target {
            WatchTarget::Version(key) => {
                let snapshot = self.backend.list_instances(key).await?;
                self.state.write().await.replace(key, snapshot.instances, snapshot.index);
                Ok(snapshot.index)
            }
            WatchTarget::AllVersions(service) => {
                let snapshot = self.backend.list_service(service).await?;
                let mut state = self.state.write().await;
                let vanished: Vec<VersionedServiceKey> = state
                    .instances
                    .keys()
                    .filter(|k| &k.service == service && !snapshot.versions.contains_key(&k.version))
                    .cloned()
                    .collect();
                for key in vanished {
                    state.replace(&key, Vec::new(), snapshot.index);
                }
                for (version, instances) in snapshot.versions {
                    state.replace(&service.with_version(version), instances, snapshot.index);
                }
                Ok(snapshot.index)
            }
            WatchTarget::Gateway(key) => {
                let (value, index) = self.backend.get_gateway(key).await?;
                let gateway = value.filter(|u| valid_or_log(key, "", u));
                self.state.write().await.gateways.insert(key.clone(), gateway);
                Ok(index)
            }
        }
    }
}

/// 实例缓存
#[derive(Clone)]
pub struct InstanceCache {
    inner: Arc<CacheInner>,
}

impl InstanceCache {
    pub fn new(backend: Arc<dyn DiscoveryBackend>, retry: &RetryConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                policies: RetryPolicies::from_config(retry),
                resilience: retry.resilience,
                start_delay: Duration::from_millis(retry.start_delay_ms),
                max_delay: Duration::from_millis(retry.max_delay_ms),
                state: RwLock::new(CacheState::default()),
                watches: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 获取实例列表，未缓存时冷加载并建立 watch
    ///
    /// 后端失败时返回空列表（或 last known 实例）；关闭 resilience 时返回错误
    pub async fn get_instances(&self, key: &VersionedServiceKey) -> Result<Vec<ServiceInstance>> {
        if let Some(instances) = self.inner.state.read().await.resolve(key) {
            return Ok(instances);
        }

        let backend = &self.inner.backend;
        let loaded = retry(self.inner.policies.initial.as_ref(), "list_instances", || {
            backend.list_instances(key)
        })
        .await;

        let snapshot = match loaded {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.cold_read_failed(key, &e)?;
                let state = self.inner.state.read().await;
                return Ok(state.last_known.get(key).cloned().into_iter().collect());
            }
        };

        {
            let mut state = self.inner.state.write().await;
            state.instances.entry(key.clone()).or_insert_with(|| {
                snapshot
                    .instances
                    .iter()
                    .map(|i| (i.id.clone(), i.clone()))
                    .collect()
            });
        }
        debug!(service = %key, count = snapshot.instances.len(), index = snapshot.index, "Instances loaded");

        self.ensure_watch(WatchTarget::Version(key.clone()), snapshot.index + 1).await;

        let state = self.inner.state.read().await;
        Ok(state.resolve(key).unwrap_or_default())
    }

    /// 获取服务的版本列表，未缓存时冷加载并 watch 全部版本
    pub async fn get_versions(&self, key: &ServiceKey) -> Result<Vec<String>> {
        if let Some(versions) = self.inner.state.read().await.versions_with_fallback(key) {
            return Ok(versions);
        }

        let backend = &self.inner.backend;
        let loaded = retry(self.inner.policies.initial.as_ref(), "list_service", || backend.list_service(key)).await;

        let snapshot = match loaded {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.cold_read_failed(key, &e)?;
                let state = self.inner.state.read().await;
                return Ok(state.last_known_versions.get(key).cloned().into_iter().collect());
            }
        };

        {
            let mut state = self.inner.state.write().await;
            if !state.versions.contains_key(key) {
                for (version, instances) in &snapshot.versions {
                    state.instances.insert(
                        key.with_version(version.clone()),
                        instances.iter().map(|i| (i.id.clone(), i.clone())).collect(),
                    );
                }
                state.versions.insert(key.clone(), snapshot.versions.keys().cloned().collect());
            }
        }
        debug!(service = %key, count = snapshot.versions.len(), index = snapshot.index, "Versions loaded");

        self.ensure_watch(WatchTarget::AllVersions(key.clone()), snapshot.index + 1).await;

        let state = self.inner.state.read().await;
        Ok(state.versions_with_fallback(key).unwrap_or_default())
    }

    /// 获取网关地址，未缓存时读取并 watch
    pub async fn get_gateway(&self, key: &VersionedServiceKey) -> Result<Option<String>> {
        if let Some(gateway) = self.inner.state.read().await.gateways.get(key) {
            return Ok(gateway.clone());
        }

        let backend = &self.inner.backend;
        let loaded = retry(self.inner.policies.initial.as_ref(), "get_gateway", || backend.get_gateway(key)).await;

        let (value, index) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                self.cold_read_failed(key, &e)?;
                return Ok(None);
            }
        };

        let gateway = value.filter(|u| valid_or_log(key, "", u));
        let gateway = self
            .inner
            .state
            .write()
            .await
            .gateways
            .entry(key.clone())
            .or_insert(gateway)
            .clone();

        self.ensure_watch(WatchTarget::Gateway(key.clone()), index + 1).await;
        Ok(gateway)
    }

    /// 在后端禁用实例，失败只记录日志
    pub async fn disable(&self, key: &VersionedServiceKey, url: &str) {
        match self.inner.backend.disable_instance(key, url).await {
            Ok(()) => info!(service = %key, url = %url, "🚫 Service instance disable requested"),
            Err(e) => warn!(service = %key, url = %url, error = %e, "⚠️ Failed to disable service instance"),
        }
    }

    /// 当前是否存在该路径的 watch
    pub async fn is_watching(&self, target: &WatchTarget) -> bool {
        self.inner.watches.lock().await.contains_key(target)
    }

    pub async fn watch_count(&self) -> usize {
        self.inner.watches.lock().await.len()
    }

    /// 停止全部 watch 任务
    pub async fn shutdown(&self) {
        let mut watches = self.inner.watches.lock().await;
        for (target, handle) in watches.drain() {
            handle.abort();
            debug!(target = %target, "Watch stopped");
        }
    }

    fn cold_read_failed(&self, key: &dyn std::fmt::Display, e: &DiscoveryError) -> Result<()> {
        if !self.inner.resilience {
            error!(service = %key, error = %e, "❌ Backend read failed");
            return Err(e.clone());
        }
        match e {
            DiscoveryError::MalformedResponse(_) => {
                error!(service = %key, error = %e, "❌ Malformed backend response, treating as empty")
            }
            _ => warn!(service = %key, error = %e, "⚠️ Backend read failed, treating as empty"),
        }
        Ok(())
    }

    /// 建立 watch；同一路径只建立一次，全版本 watch 覆盖单版本 watch
    async fn ensure_watch(&self, target: WatchTarget, from_index: u64) {
        let mut watches = self.inner.watches.lock().await;
        if watches.contains_key(&target) {
            return;
        }

        match &target {
            WatchTarget::Version(key) => {
                if watches.contains_key(&WatchTarget::AllVersions(key.service.clone())) {
                    return;
                }
            }
            WatchTarget::AllVersions(service) => {
                watches.retain(|existing, handle| match existing {
                    WatchTarget::Version(key) if &key.service == service => {
                        handle.abort();
                        debug!(target = %existing, "Version watch superseded by all-versions watch");
                        false
                    }
                    _ => true,
                });
            }
            WatchTarget::Gateway(_) => {}
        }

        let task = tokio::spawn(run_watch(Arc::downgrade(&self.inner), target.clone(), from_index));
        watches.insert(target, task);
    }
}

/// watch 循环：应用事件后从下一个索引重新 watch
///
/// 流中断或索引被清除后先重新读取完整快照，再从快照之后的索引继续，
/// 中断期间的删除不会丢失
async fn run_watch(cache: Weak<CacheInner>, target: WatchTarget, mut from_index: u64) {
    let mut backoff = match cache.upgrade() {
        Some(inner) => Backoff::new(inner.start_delay, inner.max_delay),
        None => return,
    };
    let mut needs_resync = false;

    loop {
        let Some(inner) = cache.upgrade() else { return };

        if needs_resync {
            let resynced = inner.resync(&target).await;
            match resynced {
                Ok(index) => {
                    info!(target = %target, index, "🔄 Watch path resynchronized");
                    from_index = index + 1;
                    needs_resync = false;
                }
                Err(e) => {
                    drop(inner);
                    let delay = backoff.record_failure();
                    warn!(target = %target, error = %e, delay_ms = delay.as_millis() as u64, "⚠️ Failed to resynchronize watch path");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
        }

        let stream = inner.backend.watch(&target, from_index).await;
        drop(inner);

        let mut rx = match stream {
            Ok(rx) => {
                info!(target = %target, from_index, "👀 Watch armed");
                rx
            }
            Err(e) => {
                needs_resync = true;
                let delay = backoff.record_failure();
                warn!(target = %target, error = %e, delay_ms = delay.as_millis() as u64, "⚠️ Failed to arm watch");
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let mut cleared = false;
        while let Some(message) = rx.recv().await {
            let Some(inner) = cache.upgrade() else { return };
            match message {
                WatchMessage::Events { events, index } => {
                    backoff.reset();
                    let mut state = inner.state.write().await;
                    for event in events {
                        state.apply(event);
                    }
                    from_index = index + 1;
                }
                WatchMessage::IndexCleared { current_index } => {
                    warn!(target = %target, from_index, current_index, "⚠️ Watch index cleared, resynchronizing");
                    from_index = current_index;
                    cleared = true;
                    break;
                }
            }
        }
        needs_resync = true;

        if !cleared {
            let delay = backoff.record_failure();
            debug!(target = %target, delay_ms = delay.as_millis() as u64, "Watch stream closed, re-arming");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> VersionedServiceKey {
        VersionedServiceKey::new("orders", "1.0.0", "dev")
    }

    fn up(id: &str, url: &str) -> ChangeEvent {
        ChangeEvent::new(key(), id, ChangeKind::InstanceUp { base_url: url.into() }, 1)
    }

    fn tracked_state() -> CacheState {
        let mut state = CacheState::default();
        state.instances.insert(key(), BTreeMap::new());
        state.versions.insert(key().service, BTreeSet::new());
        state
    }

    #[test]
    fn removing_last_instance_keeps_fallback() {
        let mut state = tracked_state();
        state.apply(up("a", "http://10.0.0.1:8080"));
        state.apply(ChangeEvent::new(key(), "a", ChangeKind::InstanceRemoved, 2));

        let resolved = state.resolve(&key()).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, "a");
        assert_eq!(state.versions_with_fallback(&key().service).unwrap(), vec!["1.0.0"]);

        state.apply(up("b", "http://10.0.0.2:8080"));
        let resolved = state.resolve(&key()).unwrap();
        assert_eq!(resolved.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), vec!["b"]);
        assert!(state.last_known.is_empty());
    }

    #[test]
    fn disabled_instance_is_not_kept_as_fallback() {
        let mut state = tracked_state();
        state.apply(up("a", "http://10.0.0.1:8080"));
        state.apply(ChangeEvent::new(key(), "a", ChangeKind::InstanceDisabled, 2));
        assert_eq!(state.resolve(&key()), Some(Vec::new()));
    }

    #[test]
    fn metadata_before_url_is_merged() {
        let mut state = tracked_state();
        state.apply(ChangeEvent::new(
            key(),
            "a",
            ChangeKind::ContainerUrlChanged(Some("http://orders.svc:8080".into())),
            1,
        ));
        assert_eq!(state.resolve(&key()), Some(Vec::new()));

        state.apply(up("a", "http://10.0.0.1:8080"));
        let resolved = state.resolve(&key()).unwrap();
        assert_eq!(resolved[0].container_url.as_deref(), Some("http://orders.svc:8080"));
    }

    #[test]
    fn metadata_clear_after_removal_leaves_no_entry() {
        let mut state = tracked_state();
        state.apply(up("a", "http://10.0.0.1:8080"));
        state.apply(up("b", "http://10.0.0.2:8080"));
        state.apply(ChangeEvent::new(key(), "a", ChangeKind::InstanceRemoved, 2));
        state.apply(ChangeEvent::new(key(), "a", ChangeKind::ContainerUrlChanged(None), 3));
        state.apply(ChangeEvent::new(key(), "a", ChangeKind::ClusterIdChanged(None), 4));

        assert!(!state.instances[&key()].contains_key("a"));
        let resolved = state.resolve(&key()).unwrap();
        assert_eq!(resolved.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn clearing_the_only_metadata_drops_the_placeholder() {
        let mut state = tracked_state();
        state.apply(ChangeEvent::new(key(), "a", ChangeKind::ClusterIdChanged(Some("eu-1".into())), 1));
        assert!(state.instances[&key()].contains_key("a"));

        state.apply(ChangeEvent::new(key(), "a", ChangeKind::ClusterIdChanged(None), 2));
        assert!(!state.instances[&key()].contains_key("a"));
    }

    #[test]
    fn replace_drops_instances_missing_from_snapshot() {
        let mut state = tracked_state();
        state.apply(up("a", "http://10.0.0.1:8080"));
        state.apply(up("b", "http://10.0.0.2:8080"));

        let snapshot = vec![
            ServiceInstance::new("a", "1.0.0", "http://10.0.0.1:8080"),
            ServiceInstance::new("c", "1.0.0", "http://10.0.0.3:8080"),
        ];
        state.replace(&key(), snapshot, 7);

        let resolved = state.resolve(&key()).unwrap();
        assert_eq!(resolved.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), vec!["a", "c"]);
        assert!(state.last_known.is_empty());
    }

    #[test]
    fn replace_with_empty_snapshot_keeps_fallback() {
        let mut state = tracked_state();
        state.apply(up("a", "http://10.0.0.1:8080"));
        state.replace(&key(), Vec::new(), 3);

        let resolved = state.resolve(&key()).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, "a");
        assert_eq!(state.versions_with_fallback(&key().service).unwrap(), vec!["1.0.0"]);
    }

    #[test]
    fn malformed_url_event_is_ignored() {
        let mut state = tracked_state();
        state.apply(up("a", "definitely not a url"));
        assert_eq!(state.resolve(&key()), Some(Vec::new()));
    }

    #[test]
    fn versions_follow_instances() {
        let mut state = tracked_state();
        let v2 = VersionedServiceKey::new("orders", "2.0.0", "dev");
        state.apply(ChangeEvent::new(v2.clone(), "x", ChangeKind::InstanceUp { base_url: "http://10.0.0.3:1".into() }, 1));
        assert_eq!(state.versions_with_fallback(&key().service).unwrap(), vec!["2.0.0"]);

        state.apply(ChangeEvent::new(v2, "x", ChangeKind::InstanceDisabled, 2));
        assert!(state.versions_with_fallback(&key().service).unwrap().is_empty());
    }
}
