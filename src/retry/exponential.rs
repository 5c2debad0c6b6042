use super::{RetryPolicy, is_retryable_error};
use crate::error::DiscoveryError;
use std::time::Duration;

/// 指数退避重试策略
///
/// 连续失败 n 次后等待 `min(base_delay * 2^n, max_delay)`，与 [`super::Backoff`] 一致
pub struct ExponentialBackoffPolicy {
    max_attempts: Option<usize>,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoffPolicy {
    /// 有界重试
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            base_delay,
            max_delay,
        }
    }

    /// 无界重试，用于必须最终成功的后台操作
    pub fn unbounded(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: None,
            base_delay,
            max_delay,
        }
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn should_retry(&self, attempt: usize, error: &DiscoveryError) -> bool {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return false;
            }
        }

        is_retryable_error(error)
    }

    fn backoff_duration(&self, attempt: usize) -> Duration {
        let factor = 2u32.saturating_pow((attempt + 1).min(31) as u32);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }
}
