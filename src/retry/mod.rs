//! 重试策略模块
//!
//! 注册心跳使用无界指数退避（最终必须成功），首次读取可以配置为有界重试或快速失败

pub mod backoff;
pub mod exponential;
pub mod fixed;

pub use backoff::Backoff;
pub use exponential::ExponentialBackoffPolicy;
pub use fixed::FixedRetryPolicy;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{DiscoveryError, Result};

/// 重试策略 trait
pub trait RetryPolicy: Send + Sync {
    /// 第 `attempt` 次（从 0 开始）失败后是否继续重试
    fn should_retry(&self, attempt: usize, error: &DiscoveryError) -> bool;
    /// 第 `attempt` 次失败后的等待时长
    fn backoff_duration(&self, attempt: usize) -> Duration;
    /// 最大重试次数，`None` 表示无界
    fn max_attempts(&self) -> Option<usize>;
}

/// 调用方发起的首次读取使用的重试策略
///
/// 注册心跳和 watch 重建由 [`Backoff`] 驱动，不经过这里
#[derive(Clone)]
pub struct RetryPolicies {
    pub initial: Arc<dyn RetryPolicy>,
}

impl RetryPolicies {
    /// 根据配置构建重试策略
    ///
    /// - `resilience = false`：快速失败
    /// - `initial_retry_count = 0`：快速失败
    /// - `initial_retry_count = N > 0`：最多重试 N 次
    /// - 未设置或为负数：无界重试
    pub fn from_config(config: &RetryConfig) -> Self {
        let start = Duration::from_millis(config.start_delay_ms);
        let max = Duration::from_millis(config.max_delay_ms);

        let initial: Arc<dyn RetryPolicy> = match config.initial_retry_count {
            _ if !config.resilience => Arc::new(FixedRetryPolicy::no_retry()),
            Some(0) => Arc::new(FixedRetryPolicy::no_retry()),
            Some(n) if n > 0 => Arc::new(ExponentialBackoffPolicy::new(n as usize, start, max)),
            _ => Arc::new(ExponentialBackoffPolicy::unbounded(start, max)),
        };

        Self { initial }
    }
}

/// 按策略执行异步操作，直到成功、遇到不可重试错误或重试次数耗尽
pub async fn retry<T, F, Fut>(policy: &dyn RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if policy.should_retry(attempt, &e) => {
                let delay = policy.backoff_duration(attempt);
                tracing::warn!(
                    operation = %operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "backend call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// 只对传输层错误重试
pub(crate) fn is_retryable_error(error: &DiscoveryError) -> bool {
    error.is_retryable()
}
