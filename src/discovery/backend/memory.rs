//! 内存服务发现后端（用于测试和本地开发）
//!
//! 使用与 etcd 相同的键布局，支持 watch 索引续传、历史压缩和故障注入

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify, broadcast, mpsc};
use tracing::{debug, info};

use super::kv::{change_from_kv, collect_instances};
use super::{DiscoveryBackend, InstanceSnapshot, ServiceSnapshot, WatchMessage};
use crate::discovery::instance::ServiceInstance;
use crate::discovery::key::{ServiceKey, VersionedServiceKey, WatchTarget, paths};
use crate::discovery::registration::RegistrationRecord;
use crate::error::{DiscoveryError, Result};

const HISTORY_LIMIT: usize = 1024;
const BROADCAST_CAPACITY: usize = 256;
const WATCH_BUFFER: usize = 64;

#[derive(Debug, Clone)]
struct KvChange {
    path: String,
    value: Option<String>,
    index: u64,
}

#[derive(Default)]
struct State {
    kv: BTreeMap<String, String>,
    /// instance_id -> 实例字段键（模拟 etcd lease）
    leases: HashMap<String, Vec<String>>,
    index: u64,
    history: Vec<KvChange>,
    /// 低于该索引的历史已被压缩
    oldest_index: u64,
}

impl State {
    fn write(&mut self, path: &str, value: Option<&str>) -> KvChange {
        self.index += 1;
        match value {
            Some(v) => {
                self.kv.insert(path.to_string(), v.to_string());
            }
            None => {
                self.kv.remove(path);
            }
        }
        let change = KvChange {
            path: path.to_string(),
            value: value.map(str::to_string),
            index: self.index,
        };
        self.history.push(change.clone());
        if self.history.len() > HISTORY_LIMIT {
            let overflow = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..overflow);
            self.oldest_index = self.history.first().map(|c| c.index).unwrap_or(self.index + 1);
        }
        change
    }

    fn entries_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.kv
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

struct Inner {
    state: Mutex<State>,
    changes: broadcast::Sender<KvChange>,
    disconnect: Arc<Notify>,
    injected_failures: AtomicUsize,
    unavailable: AtomicBool,
    list_calls: AtomicUsize,
    register_calls: AtomicUsize,
    heartbeat_calls: AtomicUsize,
}

/// 内存后端
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    /// 创建新的内存后端
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changes,
                disconnect: Arc::new(Notify::new()),
                injected_failures: AtomicUsize::new(0),
                unavailable: AtomicBool::new(false),
                list_calls: AtomicUsize::new(0),
                register_calls: AtomicUsize::new(0),
                heartbeat_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// 接下来的 `n` 次调用返回 `BackendUnavailable`
    pub fn fail_next(&self, n: usize) {
        self.inner.injected_failures.store(n, Ordering::SeqCst);
    }

    /// 模拟后端整体不可用
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// `list_instances` + `list_service` 的调用次数
    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    pub fn register_calls(&self) -> usize {
        self.inner.register_calls.load(Ordering::SeqCst)
    }

    pub fn heartbeat_calls(&self) -> usize {
        self.inner.heartbeat_calls.load(Ordering::SeqCst)
    }

    pub async fn current_index(&self) -> u64 {
        self.inner.state.lock().await.index
    }

    /// 以其他进程的身份写入一个实例（没有 lease，不会过期）
    pub async fn add_instance(&self, key: &VersionedServiceKey, instance: &ServiceInstance) {
        let mut state = self.inner.state.lock().await;
        self.write(&mut state, &paths::instance_field(key, &instance.id, paths::URL), Some(&instance.base_url));
        if let Some(container_url) = &instance.container_url {
            self.write(&mut state, &paths::instance_field(key, &instance.id, paths::CONTAINER_URL), Some(container_url));
        }
        if let Some(cluster_id) = &instance.cluster_id {
            self.write(&mut state, &paths::instance_field(key, &instance.id, paths::CLUSTER_ID), Some(cluster_id));
        }
    }

    /// 删除一个实例的所有字段
    pub async fn remove_instance(&self, key: &VersionedServiceKey, instance_id: &str) {
        let mut state = self.inner.state.lock().await;
        self.remove_instance_locked(&mut state, key, instance_id);
    }

    /// 模拟 TTL 过期：删除实例字段并丢弃 lease
    pub async fn expire(&self, instance_id: &str) {
        let mut state = self.inner.state.lock().await;
        if let Some(keys) = state.leases.remove(instance_id) {
            for key in keys {
                if state.kv.contains_key(&key) {
                    self.write(&mut state, &key, None);
                }
            }
            info!(instance_id = %instance_id, "Memory backend lease expired");
        }
    }

    /// 压缩全部历史，之后从旧索引开始的 watch 会收到 `IndexCleared`
    pub async fn compact(&self) {
        let mut state = self.inner.state.lock().await;
        state.history.clear();
        state.oldest_index = state.index + 1;
    }

    /// 断开当前所有 watch 流，模拟连接中断
    pub fn disconnect_watches(&self) {
        self.inner.disconnect.notify_waiters();
    }

    /// 仍在运行的 watch 流数量
    pub fn active_watches(&self) -> usize {
        self.inner.changes.receiver_count()
    }

    fn write(&self, state: &mut State, path: &str, value: Option<&str>) {
        let change = state.write(path, value);
        // 没有订阅者时发送失败，忽略即可
        let _ = self.inner.changes.send(change);
    }

    fn remove_instance_locked(&self, state: &mut State, key: &VersionedServiceKey, instance_id: &str) {
        let prefix = format!("{}/", paths::instance(key, instance_id));
        let keys: Vec<String> = state.entries_with_prefix(&prefix).map(|(k, _)| k.to_string()).collect();
        for path in keys {
            self.write(state, &path, None);
        }
        state.leases.remove(instance_id);
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(DiscoveryError::unavailable("memory backend is down"));
        }
        let injected = self
            .inner
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(DiscoveryError::unavailable("injected failure"));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoveryBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn register_instance(&self, record: &RegistrationRecord) -> Result<()> {
        self.inner.register_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut state = self.inner.state.lock().await;
        let mut fields = vec![(paths::URL, record.base_url.as_str())];
        if let Some(container_url) = &record.container_url {
            fields.push((paths::CONTAINER_URL, container_url.as_str()));
        }
        if let Some(cluster_id) = &record.cluster_id {
            fields.push((paths::CLUSTER_ID, cluster_id.as_str()));
        }

        let mut keys = Vec::with_capacity(fields.len());
        for (field, value) in fields {
            let path = paths::instance_field(&record.key, &record.instance_id, field);
            self.write(&mut state, &path, Some(value));
            keys.push(path);
        }
        state.leases.insert(record.instance_id.clone(), keys);
        Ok(())
    }

    async fn heartbeat(&self, record: &RegistrationRecord) -> Result<()> {
        self.inner.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let state = self.inner.state.lock().await;
        if state.leases.contains_key(&record.instance_id) {
            Ok(())
        } else {
            Err(DiscoveryError::record_not_found(record.instance_id.clone()))
        }
    }

    async fn list_instances(&self, key: &VersionedServiceKey) -> Result<InstanceSnapshot> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let state = self.inner.state.lock().await;
        let prefix = paths::instances(key);
        let instances = collect_instances(state.entries_with_prefix(&prefix))
            .remove(key)
            .unwrap_or_default();
        Ok(InstanceSnapshot {
            instances,
            index: state.index,
        })
    }

    async fn list_service(&self, key: &ServiceKey) -> Result<ServiceSnapshot> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let state = self.inner.state.lock().await;
        let prefix = format!("{}/", paths::versions(key));
        let versions = collect_instances(state.entries_with_prefix(&prefix))
            .into_iter()
            .filter(|(_, instances)| !instances.is_empty())
            .map(|(k, instances)| (k.version, instances))
            .collect();
        Ok(ServiceSnapshot {
            versions,
            index: state.index,
        })
    }

    async fn watch(&self, target: &WatchTarget, from_index: u64) -> Result<mpsc::Receiver<WatchMessage>> {
        self.check_available()?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let state = self.inner.state.lock().await;

        if from_index > 0 && from_index < state.oldest_index {
            let _ = tx.try_send(WatchMessage::IndexCleared {
                current_index: state.oldest_index,
            });
            return Ok(rx);
        }

        // 持锁订阅，保证历史回放和实时推送之间没有缺口
        let mut live = self.inner.changes.subscribe();
        let replay: Vec<KvChange> = state
            .history
            .iter()
            .filter(|c| from_index > 0 && c.index >= from_index && target.matches(&c.path))
            .cloned()
            .collect();
        let last_replayed = state.index;
        drop(state);

        let target = target.clone();
        let disconnect = self.inner.disconnect.clone();
        tokio::spawn(async move {
            for change in replay {
                if !forward(&tx, &change).await {
                    return;
                }
            }

            let mut delivered = last_replayed;
            loop {
                let received = tokio::select! {
                    received = live.recv() => received,
                    _ = disconnect.notified() => return,
                    _ = tx.closed() => return,
                };
                match received {
                    Ok(change) => {
                        if change.index <= last_replayed || !target.matches(&change.path) {
                            continue;
                        }
                        if !forward(&tx, &change).await {
                            return;
                        }
                        delivered = change.index;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(target = %target, skipped, "Memory watch lagged");
                        let _ = tx
                            .send(WatchMessage::IndexCleared {
                                current_index: delivered + 1,
                            })
                            .await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }

    async fn get_value(&self, path: &str) -> Result<(Option<String>, u64)> {
        self.check_available()?;
        let state = self.inner.state.lock().await;
        Ok((state.kv.get(path).cloned(), state.index))
    }

    async fn put_value(&self, path: &str, value: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.inner.state.lock().await;
        self.write(&mut state, path, Some(value));
        Ok(())
    }

    async fn delete_instance(&self, record: &RegistrationRecord) -> Result<()> {
        self.check_available()?;
        let mut state = self.inner.state.lock().await;
        self.remove_instance_locked(&mut state, &record.key, &record.instance_id);
        Ok(())
    }

    async fn disable_instance(&self, key: &VersionedServiceKey, url: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.inner.state.lock().await;
        let prefix = paths::instances(key);
        let matching: Vec<String> = collect_instances(state.entries_with_prefix(&prefix))
            .remove(key)
            .unwrap_or_default()
            .into_iter()
            .filter(|i| i.base_url == url)
            .map(|i| i.id)
            .collect();

        for instance_id in matching {
            let path = paths::instance_field(key, &instance_id, paths::STATUS);
            self.write(&mut state, &path, Some(paths::STATUS_DISABLED));
        }
        Ok(())
    }
}

/// 把一次键变化转发给 watch 接收方，接收方已关闭时返回 `false`
async fn forward(tx: &mpsc::Sender<WatchMessage>, change: &KvChange) -> bool {
    let Some(event) = change_from_kv(&change.path, change.value.as_deref(), change.index) else {
        return true;
    };
    tx.send(WatchMessage::Events {
        events: vec![event],
        index: change.index,
    })
    .await
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::backend::ChangeKind;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn orders() -> VersionedServiceKey {
        VersionedServiceKey::new("orders", "1.0.0", "dev")
    }

    fn record(id: &str, url: &str) -> RegistrationRecord {
        RegistrationRecord::new(orders(), id, url)
    }

    #[tokio::test]
    async fn register_then_list() {
        let backend = MemoryBackend::new();
        backend.register_instance(&record("a", "http://10.0.0.1:8080")).await.unwrap();

        let snapshot = backend.list_instances(&orders()).await.unwrap();
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.instances[0].base_url, "http://10.0.0.1:8080");
        assert!(snapshot.index > 0);
    }

    #[tokio::test]
    async fn heartbeat_after_expiry_is_record_not_found() {
        let backend = MemoryBackend::new();
        let rec = record("a", "http://10.0.0.1:8080");
        assert_ok!(backend.register_instance(&rec).await);
        assert_ok!(backend.heartbeat(&rec).await);

        backend.expire("a").await;
        assert!(matches!(backend.heartbeat(&rec).await, Err(DiscoveryError::RecordNotFound(_))));
        assert!(backend.list_instances(&orders()).await.unwrap().instances.is_empty());
    }

    #[tokio::test]
    async fn disable_hides_instance() {
        let backend = MemoryBackend::new();
        backend.register_instance(&record("a", "http://10.0.0.1:8080")).await.unwrap();
        backend.register_instance(&record("b", "http://10.0.0.2:8080")).await.unwrap();

        backend.disable_instance(&orders(), "http://10.0.0.1:8080").await.unwrap();

        let ids: Vec<String> = backend
            .list_instances(&orders())
            .await
            .unwrap()
            .instances
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.fail_next(2);
        assert_err!(backend.list_instances(&orders()).await);
        assert_err!(backend.list_instances(&orders()).await);
        assert_ok!(backend.list_instances(&orders()).await);
    }

    #[tokio::test]
    async fn watch_resumes_from_index() {
        let backend = MemoryBackend::new();
        backend.register_instance(&record("a", "http://10.0.0.1:8080")).await.unwrap();
        let resume_from = backend.current_index().await + 1;
        backend.register_instance(&record("b", "http://10.0.0.2:8080")).await.unwrap();

        let mut rx = backend
            .watch(&WatchTarget::Version(orders()), resume_from)
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        match message {
            WatchMessage::Events { events, .. } => {
                assert_eq!(events[0].instance_id, "b");
                assert!(matches!(events[0].kind, ChangeKind::InstanceUp { .. }));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn watch_from_compacted_index_reports_index_cleared() {
        let backend = MemoryBackend::new();
        backend.register_instance(&record("a", "http://10.0.0.1:8080")).await.unwrap();
        backend.compact().await;

        let mut rx = backend.watch(&WatchTarget::Version(orders()), 1).await.unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(
            message,
            WatchMessage::IndexCleared {
                current_index: backend.current_index().await + 1
            }
        );
    }

    #[tokio::test]
    async fn dropping_the_receiver_stops_the_watch() {
        let backend = MemoryBackend::new();
        let rx = backend.watch(&WatchTarget::Version(orders()), 0).await.unwrap();
        assert_eq!(backend.active_watches(), 1);

        // 没有任何写入，任务只能通过通道关闭感知接收端已释放
        drop(rx);
        for _ in 0..100 {
            if backend.active_watches() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.active_watches(), 0);
    }
}
