//! KV 布局的后端（etcd、内存）共用的解析逻辑

use std::collections::BTreeMap;
use tracing::error;

use super::{ChangeEvent, ChangeKind};
use crate::discovery::instance::{ServiceInstance, is_valid_url};
use crate::discovery::key::VersionedServiceKey;
use crate::discovery::key::paths::{self, ParsedKey};

/// 把一次键变化翻译为变化事件，`value` 为 `None` 表示删除
pub(crate) fn change_from_kv(path: &str, value: Option<&str>, index: u64) -> Option<ChangeEvent> {
    let non_empty = |v: Option<&str>| v.filter(|s| !s.is_empty()).map(str::to_string);

    match paths::parse(path)? {
        ParsedKey::Gateway(key) => Some(ChangeEvent::new(
            key,
            "",
            ChangeKind::GatewayChanged(non_empty(value)),
            index,
        )),
        ParsedKey::InstanceField {
            key,
            instance_id,
            field,
        } => {
            let kind = match (field.as_str(), value) {
                (paths::URL, Some(url)) => ChangeKind::InstanceUp {
                    base_url: url.to_string(),
                },
                (paths::URL, None) | ("", None) => ChangeKind::InstanceRemoved,
                (paths::CONTAINER_URL, v) => ChangeKind::ContainerUrlChanged(non_empty(v)),
                (paths::CLUSTER_ID, v) => ChangeKind::ClusterIdChanged(non_empty(v)),
                (paths::STATUS, Some(paths::STATUS_DISABLED)) => ChangeKind::InstanceDisabled,
                _ => return None,
            };
            Some(ChangeEvent::new(key, instance_id, kind, index))
        }
    }
}

#[derive(Default)]
struct PartialInstance {
    url: Option<String>,
    container_url: Option<String>,
    cluster_id: Option<String>,
    disabled: bool,
}

/// 从一组 (键, 值) 中组装出各版本的可用实例
///
/// 禁用、缺少 url 或 url 格式错误的实例被丢弃
pub(crate) fn collect_instances<'a, I>(entries: I) -> BTreeMap<VersionedServiceKey, Vec<ServiceInstance>>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut partial: BTreeMap<(VersionedServiceKey, String), PartialInstance> = BTreeMap::new();

    for (path, value) in entries {
        let Some(ParsedKey::InstanceField {
            key,
            instance_id,
            field,
        }) = paths::parse(path)
        else {
            continue;
        };

        let entry = partial.entry((key, instance_id)).or_default();
        match field.as_str() {
            paths::URL => entry.url = Some(value.to_string()),
            paths::CONTAINER_URL if !value.is_empty() => entry.container_url = Some(value.to_string()),
            paths::CLUSTER_ID if !value.is_empty() => entry.cluster_id = Some(value.to_string()),
            paths::STATUS => entry.disabled = value == paths::STATUS_DISABLED,
            _ => {}
        }
    }

    let mut result: BTreeMap<VersionedServiceKey, Vec<ServiceInstance>> = BTreeMap::new();
    for ((key, instance_id), p) in partial {
        let versions = result.entry(key.clone()).or_default();
        if p.disabled {
            continue;
        }
        let Some(url) = p.url else { continue };
        if !is_valid_url(&url) {
            error!(key = %key, instance_id = %instance_id, url = %url, "❌ Malformed instance URL, skipped");
            continue;
        }
        let container_url = p.container_url.filter(|u| {
            let valid = is_valid_url(u);
            if !valid {
                error!(key = %key, instance_id = %instance_id, url = %u, "❌ Malformed container URL, ignored");
            }
            valid
        });

        versions.push(ServiceInstance {
            id: instance_id,
            version: key.version.clone(),
            base_url: url,
            container_url,
            cluster_id: p.cluster_id,
            active: true,
        });
    }
    result
}
