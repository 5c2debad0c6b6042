//! 轮询选择
//!
//! 默认所有服务共享一个计数器：列表长度足够时前进一位，否则回到 0。
//! 不同服务交替解析时各自看到的序列并不公平，需要公平轮询时使用
//! [`RoundRobinScope::PerKey`]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::config::RoundRobinScope;
use crate::discovery::key::VersionedServiceKey;

/// 轮询选择器
pub struct RoundRobin {
    scope: RoundRobinScope,
    /// 下一次候选下标（= 上次下标 + 1，初始为 0）
    shared: AtomicUsize,
    per_key: Mutex<HashMap<VersionedServiceKey, Arc<AtomicUsize>>>,
}

impl RoundRobin {
    pub fn new(scope: RoundRobinScope) -> Self {
        Self {
            scope,
            shared: AtomicUsize::new(0),
            per_key: Mutex::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> RoundRobinScope {
        self.scope
    }

    /// 从 `items` 中选出下一个元素，列表为空时返回 `None`
    pub async fn select<'a, T>(&self, key: &VersionedServiceKey, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }

        let index = match self.scope {
            RoundRobinScope::Shared => advance(&self.shared, items.len()),
            RoundRobinScope::PerKey => {
                let counter = self.per_key.lock().await.entry(key.clone()).or_default().clone();
                advance(&counter, items.len())
            }
        };
        items.get(index)
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new(RoundRobinScope::default())
    }
}

/// `index = len >= last + 2 ? last + 1 : 0`
fn advance(next: &AtomicUsize, len: usize) -> usize {
    let pick = |candidate: usize| if candidate < len { candidate } else { 0 };
    let previous = match next.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(pick(c) + 1)) {
        Ok(p) | Err(p) => p,
    };
    pick(previous)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> VersionedServiceKey {
        VersionedServiceKey::new(name, "1.0.0", "dev")
    }

    #[tokio::test]
    async fn fresh_selector_visits_0_1_2_0() {
        let rr = RoundRobin::default();
        let urls = ["a", "b", "c"];
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(*rr.select(&key("orders"), &urls).await.unwrap());
        }
        assert_eq!(seen, vec!["a", "b", "c", "a"]);
    }

    #[tokio::test]
    async fn shared_counter_resets_on_shorter_list() {
        let rr = RoundRobin::new(RoundRobinScope::Shared);
        let three = [0, 1, 2];
        let two = [10, 11];

        assert_eq!(rr.select(&key("a"), &three).await, Some(&0));
        assert_eq!(rr.select(&key("a"), &three).await, Some(&1));
        assert_eq!(rr.select(&key("a"), &three).await, Some(&2));
        // last = 2，长度 2 < 4，回到 0
        assert_eq!(rr.select(&key("b"), &two).await, Some(&10));
        assert_eq!(rr.select(&key("a"), &three).await, Some(&1));
    }

    #[tokio::test]
    async fn per_key_counters_are_independent() {
        let rr = RoundRobin::new(RoundRobinScope::PerKey);
        let urls = [0, 1, 2];

        assert_eq!(rr.select(&key("a"), &urls).await, Some(&0));
        assert_eq!(rr.select(&key("b"), &urls).await, Some(&0));
        assert_eq!(rr.select(&key("a"), &urls).await, Some(&1));
        assert_eq!(rr.select(&key("b"), &urls).await, Some(&1));
    }

    #[tokio::test]
    async fn empty_list_selects_nothing() {
        let rr = RoundRobin::default();
        let empty: [&str; 0] = [];
        assert_eq!(rr.select(&key("a"), &empty).await, None);
    }
}
