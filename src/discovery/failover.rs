//! 多实例故障转移
//!
//! 请求先发往轮询选中的实例，返回 5xx 时依次改写到其余实例，轮转一圈后放弃

use std::future::Future;
use tracing::warn;

/// 一次请求可用的实例地址及首个实例的下标
#[derive(Debug, Clone)]
pub struct Failover {
    urls: Vec<String>,
    first_index: usize,
}

impl Failover {
    pub fn new(urls: Vec<String>, first_index: usize) -> Self {
        let first_index = if urls.is_empty() { 0 } else { first_index % urls.len() };
        Self { urls, first_index }
    }

    pub fn first(&self) -> Option<&str> {
        self.urls.get(self.first_index).map(String::as_str)
    }

    /// 首个实例之后的其余实例，按轮转顺序，不包括首个实例
    pub fn remaining(&self) -> impl Iterator<Item = &str> + '_ {
        let len = self.urls.len();
        (1..len).map(move |offset| self.urls[(self.first_index + offset) % len].as_str())
    }

    /// 把 `uri` 的 `from` 前缀替换为 `to`，前缀不匹配时返回 `None`
    pub fn rebase(uri: &str, from: &str, to: &str) -> Option<String> {
        let from = from.trim_end_matches('/');
        let to = to.trim_end_matches('/');
        uri.strip_prefix(from).map(|rest| format!("{}{}", to, rest))
    }

    /// 执行请求，结果为服务端错误时改写到下一个实例重试
    ///
    /// 返回最后一次请求的结果
    pub async fn call_with_failover<T, F, Fut, E>(&self, uri: &str, mut call: F, is_server_error: E) -> Option<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = T>,
        E: Fn(&T) -> bool,
    {
        let first = self.first()?;
        let mut response = call(uri.to_string()).await;
        let mut previous = first;

        for next in self.remaining() {
            if !is_server_error(&response) {
                break;
            }
            let Some(next_uri) = Self::rebase(uri, first, next) else {
                break;
            };
            warn!(from = %previous, to = %next_uri, "⚠️ Server error, retrying on next instance");
            response = call(next_uri).await;
            previous = next;
        }
        Some(response)
    }
}

/// HTTP 5xx
pub fn is_server_error_status(status: u16) -> bool {
    (500..600).contains(&status)
}
