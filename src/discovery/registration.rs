//! 服务注册管理
//!
//! 每条注册记录由一个独立的后台任务驱动：
//! `Unregistered → Registering → Registered → (心跳循环)`，注销时取消任务并删除后端记录

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::discovery::backend::DiscoveryBackend;
use crate::discovery::key::VersionedServiceKey;
use crate::error::DiscoveryError;
use crate::retry::Backoff;

/// 一次 `register` 调用对应的注册记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub key: VersionedServiceKey,
    pub instance_id: String,
    pub base_url: String,
    pub container_url: Option<String>,
    pub cluster_id: Option<String>,
    pub ttl: Duration,
    pub ping_interval: Duration,
    pub singleton: bool,
}

impl RegistrationRecord {
    pub fn new(key: VersionedServiceKey, instance_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            key,
            instance_id: instance_id.into(),
            base_url: base_url.into(),
            container_url: None,
            cluster_id: None,
            ttl: Duration::from_secs(30),
            ping_interval: Duration::from_secs(20),
            singleton: false,
        }
    }

    pub fn with_container_url(mut self, container_url: Option<String>) -> Self {
        self.container_url = container_url;
        self
    }

    pub fn with_cluster_id(mut self, cluster_id: Option<String>) -> Self {
        self.cluster_id = cluster_id;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    pub fn with_singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }
}

/// 生成实例 ID：时间戳 + UUID，进程重启后也不会冲突
pub fn generate_instance_id() -> String {
    format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), Uuid::new_v4())
}

/// 注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
}

/// 注册记录的运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationStatus {
    pub state: RegistrationState,
    /// 下一次失败后的等待时长
    pub current_backoff: Duration,
}

struct RegistrationHandle {
    record: RegistrationRecord,
    status: watch::Receiver<RegistrationStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// 注册管理器
pub struct RegistrationManager {
    backend: Arc<dyn DiscoveryBackend>,
    start_delay: Duration,
    max_delay: Duration,
    resilience: bool,
    registrations: Mutex<HashMap<String, RegistrationHandle>>,
}

impl RegistrationManager {
    pub fn new(backend: Arc<dyn DiscoveryBackend>, retry: &RetryConfig) -> Self {
        Self {
            backend,
            start_delay: Duration::from_millis(retry.start_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
            resilience: retry.resilience,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// 开始维护一条注册记录
    ///
    /// 同一个 instance_id 重复注册时不做任何事，返回 `false`
    pub async fn register(&self, record: RegistrationRecord) -> bool {
        let mut registrations = self.registrations.lock().await;
        if registrations.contains_key(&record.instance_id) {
            debug!(instance_id = %record.instance_id, "Instance already managed, skipping");
            return false;
        }

        let backoff = Backoff::new(self.start_delay, self.max_delay);
        let (status_tx, status_rx) = watch::channel(RegistrationStatus {
            state: RegistrationState::Unregistered,
            current_backoff: backoff.current(),
        });
        let cancel = CancellationToken::new();

        let worker = RegistrationWorker {
            backend: self.backend.clone(),
            record: record.clone(),
            backoff,
            resilience: self.resilience,
            state: RegistrationState::Unregistered,
            status: status_tx,
        };
        let task = tokio::spawn(worker.run(cancel.clone()));

        info!(
            service = %record.key,
            instance_id = %record.instance_id,
            ping_interval_secs = record.ping_interval.as_secs(),
            "📝 Registration scheduled"
        );

        registrations.insert(
            record.instance_id.clone(),
            RegistrationHandle {
                record,
                status: status_rx,
                cancel,
                task,
            },
        );
        true
    }

    /// 注销一条注册记录，不存在时返回 `false`
    pub async fn deregister(&self, instance_id: &str) -> bool {
        let handle = self.registrations.lock().await.remove(instance_id);
        match handle {
            Some(handle) => {
                self.stop(handle).await;
                true
            }
            None => false,
        }
    }

    /// 注销本进程的全部注册记录
    pub async fn deregister_all(&self) {
        let handles: Vec<RegistrationHandle> = self.registrations.lock().await.drain().map(|(_, h)| h).collect();
        join_all(handles.into_iter().map(|handle| self.stop(handle))).await;
    }

    /// 当前管理的注册记录
    pub async fn records(&self) -> Vec<RegistrationRecord> {
        self.registrations
            .lock()
            .await
            .values()
            .map(|h| h.record.clone())
            .collect()
    }

    pub async fn status(&self, instance_id: &str) -> Option<RegistrationStatus> {
        self.registrations
            .lock()
            .await
            .get(instance_id)
            .map(|h| *h.status.borrow())
    }

    /// 订阅一条注册记录的状态变化
    pub async fn subscribe(&self, instance_id: &str) -> Option<watch::Receiver<RegistrationStatus>> {
        self.registrations
            .lock()
            .await
            .get(instance_id)
            .map(|h| h.status.clone())
    }

    async fn stop(&self, handle: RegistrationHandle) {
        handle.cancel.cancel();
        // 等待正在执行的 tick 结束，之后才能删除后端记录
        if let Err(e) = handle.task.await {
            if !e.is_cancelled() {
                error!(instance_id = %handle.record.instance_id, error = %e, "❌ Registration task panicked");
            }
        }

        match self.backend.delete_instance(&handle.record).await {
            Ok(()) => info!(
                service = %handle.record.key,
                instance_id = %handle.record.instance_id,
                "🗑️ Service deregistered"
            ),
            Err(e) => warn!(
                service = %handle.record.key,
                instance_id = %handle.record.instance_id,
                error = %e,
                "⚠️ Failed to delete registration"
            ),
        }
    }
}

/// 单条注册记录的后台任务，独占该记录的状态
struct RegistrationWorker {
    backend: Arc<dyn DiscoveryBackend>,
    record: RegistrationRecord,
    backoff: Backoff,
    resilience: bool,
    state: RegistrationState,
    status: watch::Sender<RegistrationStatus>,
}

impl RegistrationWorker {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.record.ping_interval) => {}
            }
        }
        self.set_state(RegistrationState::Unregistered);
        debug!(instance_id = %self.record.instance_id, "🛑 Registration task stopped");
    }

    async fn tick(&mut self) {
        match self.state {
            RegistrationState::Unregistered | RegistrationState::Registering => self.register().await,
            RegistrationState::Registered => self.heartbeat().await,
        }
    }

    async fn register(&mut self) {
        self.set_state(RegistrationState::Registering);

        if self.record.singleton {
            match self.backend.list_instances(&self.record.key).await {
                Ok(snapshot) if snapshot.instances.iter().any(|i| i.id != self.record.instance_id) => {
                    warn!(
                        service = %self.record.key,
                        instance_id = %self.record.instance_id,
                        "⚠️ Singleton service already registered, skipping"
                    );
                    self.set_state(RegistrationState::Unregistered);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    self.set_state(RegistrationState::Unregistered);
                    self.fail("singleton check", e).await;
                    return;
                }
            }
        }

        match self.backend.register_instance(&self.record).await {
            Ok(()) => {
                self.backoff.reset();
                self.set_state(RegistrationState::Registered);
                info!(
                    service = %self.record.key,
                    instance_id = %self.record.instance_id,
                    url = %self.record.base_url,
                    backend = self.backend.name(),
                    "✅ Service registered"
                );
            }
            Err(e) => {
                self.set_state(RegistrationState::Unregistered);
                self.fail("register", e).await;
            }
        }
    }

    async fn heartbeat(&mut self) {
        match self.backend.heartbeat(&self.record).await {
            Ok(()) => {
                self.backoff.reset();
                self.publish();
                debug!(instance_id = %self.record.instance_id, "💓 Heartbeat sent");
            }
            Err(DiscoveryError::RecordNotFound(_)) => {
                warn!(
                    service = %self.record.key,
                    instance_id = %self.record.instance_id,
                    "⚠️ Registration lost on backend, re-registering"
                );
                self.register().await;
            }
            Err(e) => self.fail("heartbeat", e).await,
        }
    }

    /// 记录一次失败，并在当前 tick 内等待退避时长
    async fn fail(&mut self, operation: &str, e: DiscoveryError) {
        let delay = self.backoff.record_failure();
        self.publish();

        if !self.resilience {
            error!(
                instance_id = %self.record.instance_id,
                operation = %operation,
                error = %e,
                "❌ Backend call failed"
            );
            return;
        }

        warn!(
            instance_id = %self.record.instance_id,
            operation = %operation,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "⚠️ Backend call failed, backing off"
        );
        tokio::time::sleep(delay).await;
    }

    fn set_state(&mut self, state: RegistrationState) {
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(RegistrationStatus {
            state: self.state,
            current_backoff: self.backoff.current(),
        });
    }
}
