//! DiscoveryCore 集成测试（内存后端）
//!
//! 覆盖注册心跳、缓存与 watch、版本解析、网关与集群地址替换、轮询选择

use flare_discovery::discovery::key::{WatchTarget, paths};
use flare_discovery::{
    AccessType, DiscoveryBackend, DiscoveryConfig, DiscoveryCore, DiscoveryError, MemoryBackend, RegistrationOptions,
    RoundRobinScope, ServiceInstance, ServiceKey, VersionedServiceKey,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn test_config() -> DiscoveryConfig {
    let mut config = DiscoveryConfig::default();
    config.retry.start_delay_ms = 10;
    config.retry.max_delay_ms = 100;
    config.retry.initial_retry_count = Some(0);
    config
}

fn core_with(backend: &MemoryBackend, config: DiscoveryConfig) -> DiscoveryCore {
    DiscoveryCore::new(Arc::new(backend.clone()), config)
}

fn orders(version: &str) -> VersionedServiceKey {
    VersionedServiceKey::new("orders", version, "dev")
}

fn instance(id: &str, version: &str, url: &str) -> ServiceInstance {
    ServiceInstance::new(id, version, url)
}

/// 等待 watch 把变化同步进缓存
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn registered_count(backend: &MemoryBackend) -> usize {
    backend.list_instances(&orders("1.0.0")).await.unwrap().instances.len()
}

async fn seed_three(backend: &MemoryBackend) {
    let key = &orders("1.0.0");
    backend.add_instance(&key, &instance("a", "1.0.0", "http://10.0.0.1:8080")).await;
    backend.add_instance(&key, &instance("b", "1.0.0", "http://10.0.0.2:8080")).await;
    backend.add_instance(&key, &instance("c", "1.0.0", "http://10.0.0.3:8080")).await;
}

#[tokio::test]
async fn round_robin_cycles_through_instances() {
    let backend = &MemoryBackend::new();
    seed_three(&backend).await;
    let core = &core_with(&backend, test_config());

    let mut picked = Vec::new();
    for _ in 0..4 {
        picked.push(
            core.get_service_instance("orders", "1.0.0", "dev", AccessType::Direct)
                .await
                .unwrap()
                .unwrap(),
        );
    }

    assert_eq!(
        picked,
        vec![
            "http://10.0.0.1:8080",
            "http://10.0.0.2:8080",
            "http://10.0.0.3:8080",
            "http://10.0.0.1:8080",
        ]
    );
}

#[tokio::test]
async fn per_key_round_robin_is_independent_across_services() {
    let backend = &MemoryBackend::new();
    seed_three(&backend).await;
    let billing = VersionedServiceKey::new("billing", "1.0.0", "dev");
    backend.add_instance(&billing, &instance("x", "1.0.0", "http://10.1.0.1:8080")).await;
    backend.add_instance(&billing, &instance("y", "1.0.0", "http://10.1.0.2:8080")).await;

    let mut config = test_config();
    config.round_robin = RoundRobinScope::PerKey;
    let core = &core_with(&backend, config);

    let first = core.get_service_instance("orders", "1.0.0", "dev", AccessType::Direct).await.unwrap();
    let _ = core.get_service_instance("billing", "1.0.0", "dev", AccessType::Direct).await.unwrap();
    let second = core.get_service_instance("orders", "1.0.0", "dev", AccessType::Direct).await.unwrap();

    assert_eq!(first.as_deref(), Some("http://10.0.0.1:8080"));
    assert_eq!(second.as_deref(), Some("http://10.0.0.2:8080"));
}

#[tokio::test]
async fn repeated_lookups_hit_the_cache() {
    let backend = &MemoryBackend::new();
    seed_three(&backend).await;
    let core = &core_with(&backend, test_config());

    for _ in 0..5 {
        let urls = core
            .get_service_instances("orders", "1.0.0", "dev", AccessType::Direct)
            .await
            .unwrap();
        assert_eq!(urls.len(), 3);
    }

    assert_eq!(backend.list_calls(), 1);
    assert!(core.cache().is_watching(&WatchTarget::Version(orders("1.0.0"))).await);
    assert_eq!(core.cache().watch_count().await, 1);
}

#[tokio::test]
async fn watch_applies_added_and_removed_instances() {
    let backend = &MemoryBackend::new();
    seed_three(&backend).await;
    let core = &core_with(&backend, test_config());
    let key = &orders("1.0.0");

    core.get_service_instances("orders", "1.0.0", "dev", AccessType::Direct)
        .await
        .unwrap();

    backend.add_instance(&key, &instance("d", "1.0.0", "http://10.0.0.4:8080")).await;
    backend.remove_instance(&key, "a").await;

    eventually(|| async move {
        let urls = core.cache().get_instances(&key).await.unwrap();
        urls.len() == 3 && urls.iter().any(|i| i.id == "d") && urls.iter().all(|i| i.id != "a")
    })
    .await;
    assert_eq!(backend.list_calls(), 1);
}

#[tokio::test]
async fn last_known_instance_survives_removal_until_replaced() {
    let backend = &MemoryBackend::new();
    let key = &orders("1.0.0");
    backend.add_instance(&key, &instance("a", "1.0.0", "http://10.0.0.1:8080")).await;
    let core = &core_with(&backend, test_config());

    core.get_service_instances("orders", "1.0.0", "dev", AccessType::Direct)
        .await
        .unwrap();
    backend.remove_instance(&key, "a").await;

    // 实例被删除后仍返回最后一个已知实例
    sleep(Duration::from_millis(100)).await;
    let urls = core
        .get_service_instances("orders", "1.0.0", "dev", AccessType::Direct)
        .await
        .unwrap();
    assert_eq!(urls, vec!["http://10.0.0.1:8080"]);

    backend.add_instance(&key, &instance("b", "1.0.0", "http://10.0.0.2:8080")).await;
    eventually(|| async move {
        core.get_service_instances("orders", "1.0.0", "dev", AccessType::Direct)
            .await
            .unwrap()
            == vec!["http://10.0.0.2:8080".to_string()]
    })
    .await;
}

#[tokio::test]
async fn disabled_instance_is_hidden_without_fallback() {
    let backend = &MemoryBackend::new();
    let key = &orders("1.0.0");
    backend.add_instance(&key, &instance("a", "1.0.0", "http://10.0.0.1:8080")).await;
    let core = &core_with(&backend, test_config());

    core.get_service_instances("orders", "1.0.0", "dev", AccessType::Direct)
        .await
        .unwrap();
    core.disable_service_instance("orders", "1.0.0", "dev", "http://10.0.0.1:8080")
        .await;

    eventually(|| async move {
        core.get_service_instances("orders", "1.0.0", "dev", AccessType::Direct)
            .await
            .unwrap()
            .is_empty()
    })
    .await;
}

#[tokio::test]
async fn version_range_resolves_to_highest_match() {
    let backend = &MemoryBackend::new();
    backend.add_instance(&orders("1.2.0"), &instance("a", "1.2.0", "http://10.0.0.1:8080")).await;
    backend.add_instance(&orders("1.5.3"), &instance("b", "1.5.3", "http://10.0.0.2:8080")).await;
    backend.add_instance(&orders("2.0.0"), &instance("c", "2.0.0", "http://10.0.0.3:8080")).await;
    let core = &core_with(&backend, test_config());

    let urls = core
        .get_service_instances("orders", "^1.0.0", "dev", AccessType::Direct)
        .await
        .unwrap();
    assert_eq!(urls, vec!["http://10.0.0.2:8080"]);

    let versions = core.get_service_versions("orders", "dev").await.unwrap();
    assert_eq!(versions.len(), 3);

    // 全版本 watch 覆盖单版本 watch
    let service = ServiceKey::new("orders", "dev");
    assert!(core.cache().is_watching(&WatchTarget::AllVersions(service)).await);
    assert!(!core.cache().is_watching(&WatchTarget::Version(orders("1.5.3"))).await);
}

#[tokio::test]
async fn new_version_becomes_resolvable_through_watch() {
    let backend = &MemoryBackend::new();
    backend.add_instance(&orders("1.0.0"), &instance("a", "1.0.0", "http://10.0.0.1:8080")).await;
    let core = &core_with(&backend, test_config());

    let urls = core
        .get_service_instances("orders", "1.x", "dev", AccessType::Direct)
        .await
        .unwrap();
    assert_eq!(urls, vec!["http://10.0.0.1:8080"]);

    backend.add_instance(&orders("1.1.0"), &instance("b", "1.1.0", "http://10.0.0.2:8080")).await;
    eventually(|| async move {
        core.get_service_instances("orders", "1.x", "dev", AccessType::Direct)
            .await
            .unwrap()
            == vec!["http://10.0.0.2:8080".to_string()]
    })
    .await;
}

#[tokio::test]
async fn gateway_access_returns_gateway_url() {
    let backend = &MemoryBackend::new();
    seed_three(&backend).await;
    backend
        .put_value(&paths::gateway(&orders("1.0.0")), "https://gw.example.com")
        .await
        .unwrap();
    let core = &core_with(&backend, test_config());

    let urls = core
        .get_service_instances("orders", "1.0.0", "dev", AccessType::Gateway)
        .await
        .unwrap();
    assert_eq!(urls, vec!["https://gw.example.com"]);

    let direct = core
        .get_service_instances("orders", "1.0.0", "dev", AccessType::Direct)
        .await
        .unwrap();
    assert_eq!(direct.len(), 3);

    backend
        .put_value(&paths::gateway(&orders("1.0.0")), "https://gw2.example.com")
        .await
        .unwrap();
    eventually(|| async move {
        core.get_service_instances("orders", "1.0.0", "dev", AccessType::Gateway)
            .await
            .unwrap()
            == vec!["https://gw2.example.com".to_string()]
    })
    .await;
}

#[tokio::test]
async fn gateway_access_without_gateway_falls_back_to_instances() {
    let backend = &MemoryBackend::new();
    seed_three(&backend).await;
    let core = &core_with(&backend, test_config());

    let urls = core
        .get_service_instances("orders", "1.0.0", "dev", AccessType::Gateway)
        .await
        .unwrap();
    assert_eq!(urls.len(), 3);
    assert!(core.cache().is_watching(&WatchTarget::Gateway(orders("1.0.0"))).await);
}

#[tokio::test]
async fn same_cluster_uses_container_url() {
    let backend = &MemoryBackend::new();
    let key = &orders("1.0.0");
    backend
        .add_instance(
            &key,
            &instance("a", "1.0.0", "http://10.0.0.1:8080")
                .with_container_url("http://orders.svc:8080")
                .with_cluster_id("k8s-eu"),
        )
        .await;
    backend
        .add_instance(
            &key,
            &instance("b", "1.0.0", "http://10.0.0.2:8080")
                .with_container_url("http://orders-b.svc:8080")
                .with_cluster_id("k8s-us"),
        )
        .await;

    let mut config = test_config();
    config.cluster_id = Some("k8s-eu".to_string());
    let core = &core_with(&backend, config);

    let urls = core
        .get_service_instances("orders", "1.0.0", "dev", AccessType::Direct)
        .await
        .unwrap();
    assert_eq!(urls, vec!["http://orders.svc:8080", "http://10.0.0.2:8080"]);
}

#[tokio::test]
async fn backend_failure_without_resilience_surfaces_error() {
    let backend = &MemoryBackend::new();
    backend.set_available(false);
    let mut config = test_config();
    config.retry.resilience = false;
    let core = &core_with(&backend, config);

    let result = core
        .get_service_instances("orders", "1.0.0", "dev", AccessType::Direct)
        .await;
    assert!(matches!(result, Err(DiscoveryError::BackendUnavailable(_))));
}

#[tokio::test]
async fn backend_failure_with_resilience_is_empty() {
    let backend = &MemoryBackend::new();
    backend.set_available(false);
    let core = &core_with(&backend, test_config());

    let urls = core
        .get_service_instances("orders", "1.0.0", "dev", AccessType::Direct)
        .await
        .unwrap();
    assert!(urls.is_empty());
    assert!(matches!(
        core.require_service_instance("orders", "1.0.0", "dev", AccessType::Direct)
            .await,
        Err(DiscoveryError::ServiceNotFound(_))
    ));
}

#[tokio::test]
async fn initial_read_retries_transient_failures() {
    let backend = &MemoryBackend::new();
    seed_three(&backend).await;
    backend.fail_next(1);
    let mut config = test_config();
    config.retry.initial_retry_count = Some(2);
    let core = &core_with(&backend, config);

    let urls = core
        .get_service_instances("orders", "1.0.0", "dev", AccessType::Direct)
        .await
        .unwrap();
    assert_eq!(urls.len(), 3);
    assert_eq!(backend.list_calls(), 2);
}

#[tokio::test]
async fn watch_recovers_after_history_compaction() {
    let backend = &MemoryBackend::new();
    seed_three(&backend).await;
    let core = &core_with(&backend, test_config());
    let key = &orders("1.0.0");

    core.get_service_instances("orders", "1.0.0", "dev", AccessType::Direct)
        .await
        .unwrap();
    backend.add_instance(&key, &instance("d", "1.0.0", "http://10.0.0.4:8080")).await;
    eventually(|| async move { core.cache().get_instances(&key).await.unwrap().len() == 4 }).await;

    // 连接中断期间历史被压缩，重新 watch 时旧索引已失效
    backend.set_available(false);
    backend.disconnect_watches();
    backend.add_instance(&key, &instance("e", "1.0.0", "http://10.0.0.5:8080")).await;
    backend.compact().await;
    backend.set_available(true);

    backend.add_instance(&key, &instance("f", "1.0.0", "http://10.0.0.6:8080")).await;
    eventually(|| async move {
        let ids: Vec<String> = core
            .cache()
            .get_instances(&key)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        ids == ["a", "b", "c", "d", "e", "f"]
    })
    .await;
    // 冷加载一次，重新 watch 前至少重新读取一次
    assert!(backend.list_calls() >= 2);
}

#[tokio::test]
async fn removal_during_disconnect_is_reflected_after_reconnect() {
    let backend = &MemoryBackend::new();
    seed_three(&backend).await;
    let core = &core_with(&backend, test_config());
    let key = &orders("1.0.0");

    let initial = core.cache().get_instances(&key).await.unwrap();
    assert_eq!(initial.len(), 3);
    eventually(|| async move { backend.active_watches() == 1 }).await;

    backend.set_available(false);
    backend.disconnect_watches();
    backend.remove_instance(&key, "b").await;
    backend.compact().await;
    backend.set_available(true);

    eventually(|| async move {
        let ids: Vec<String> = core
            .cache()
            .get_instances(&key)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        ids == ["a", "c"]
    })
    .await;

    // 恢复后的 watch 继续接收新事件
    backend.remove_instance(&key, "c").await;
    eventually(|| async move { core.cache().get_instances(&key).await.unwrap().len() == 1 }).await;
}

#[tokio::test]
async fn dropped_and_superseded_watches_release_backend_streams() {
    let backend = &MemoryBackend::new();
    seed_three(&backend).await;
    let core = &core_with(&backend, test_config());

    core.cache().get_instances(&orders("1.0.0")).await.unwrap();
    eventually(|| async move { backend.active_watches() == 1 }).await;

    // 全版本 watch 取代单版本 watch，旧的后端流随之结束
    core.cache().get_versions(&ServiceKey::new("orders", "dev")).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    eventually(|| async move { backend.active_watches() == 1 }).await;
    assert_eq!(core.cache().watch_count().await, 1);

    core.cache().shutdown().await;
    eventually(|| async move { backend.active_watches() == 0 }).await;
}

#[tokio::test]
async fn registered_instance_is_discoverable_and_removed_on_deregister() {
    let backend = &MemoryBackend::new();
    let core = &core_with(&backend, test_config());

    let instance_id = core
        .register_with(
            RegistrationOptions::new("orders")
                .version("1.0.0")
                .environment("dev")
                .base_url("http://10.0.0.9:8080")
                .ping_interval(Duration::from_millis(50))
                .ttl(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    eventually(|| async move { registered_count(backend).await == 1 }).await;
    let urls = core
        .get_service_instances("orders", "1.0.0", "dev", AccessType::Direct)
        .await
        .unwrap();
    assert_eq!(urls, vec!["http://10.0.0.9:8080"]);

    eventually(|| async move { backend.heartbeat_calls() >= 2 }).await;

    assert!(core.deregister_instance(&instance_id).await);
    assert!(!core.deregister_instance(&instance_id).await);
    let snapshot = backend.list_instances(&orders("1.0.0")).await.unwrap();
    assert!(snapshot.instances.is_empty());
}

#[tokio::test]
async fn expired_registration_is_restored() {
    let backend = &MemoryBackend::new();
    let core = &core_with(&backend, test_config());

    let instance_id = core
        .register_with(
            RegistrationOptions::new("orders")
                .version("1.0.0")
                .environment("dev")
                .base_url("http://10.0.0.9:8080")
                .ping_interval(Duration::from_millis(20)),
        )
        .await
        .unwrap();

    eventually(|| async move { registered_count(backend).await == 1 }).await;
    backend.expire(&instance_id).await;
    eventually(|| async move { backend.register_calls() >= 2 && registered_count(backend).await == 1 }).await;

    let snapshot = backend.list_instances(&orders("1.0.0")).await.unwrap();
    assert_eq!(snapshot.instances.len(), 1);
    assert_eq!(snapshot.instances[0].id, instance_id);

    core.shutdown().await;
}

#[tokio::test]
async fn malformed_base_url_is_not_registered() {
    let backend = &MemoryBackend::new();
    let core = &core_with(&backend, test_config());

    let registered = core
        .register_with(RegistrationOptions::new("orders").base_url("10.0.0.9:8080"))
        .await;
    assert!(registered.is_none());
    assert!(core.registrations().records().await.is_empty());
}

#[tokio::test]
async fn start_registers_configured_service() {
    let backend = &MemoryBackend::new();
    let mut config = test_config();
    config.service.name = Some("orders".to_string());
    config.base_url = Some("http://10.0.0.9:8080".to_string());
    let core = &core_with(&backend, config);

    let instance_id = core.start().await.unwrap();
    assert!(core.start().await.is_none());

    eventually(|| async move { registered_count(backend).await == 1 }).await;
    let snapshot = backend.list_instances(&orders("1.0.0")).await.unwrap();
    assert_eq!(snapshot.instances[0].id, instance_id);

    core.shutdown().await;
    assert!(backend.list_instances(&orders("1.0.0")).await.unwrap().instances.is_empty());
}
