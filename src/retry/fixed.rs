use super::{RetryPolicy, is_retryable_error};
use crate::error::DiscoveryError;
use std::time::Duration;

/// 固定延迟重试策略
pub struct FixedRetryPolicy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedRetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// 快速失败：第一次失败即返回
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn should_retry(&self, attempt: usize, error: &DiscoveryError) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        is_retryable_error(error)
    }

    fn backoff_duration(&self, _attempt: usize) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> Option<usize> {
        Some(self.max_attempts)
    }
}
