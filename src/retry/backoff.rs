//! 注册记录上的退避状态

use std::time::Duration;

/// 可变退避状态
///
/// 每次失败翻倍（不超过上限），每次成功重置为起始值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    start: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(start: Duration, max: Duration) -> Self {
        Self {
            start,
            max,
            current: start,
        }
    }

    /// `min(current * 2, max)`
    pub fn next_delay(current: Duration, max: Duration) -> Duration {
        current.saturating_mul(2).min(max)
    }

    /// 当前退避时长
    pub fn current(&self) -> Duration {
        self.current
    }

    /// 记录一次失败，返回下一次尝试前应等待的时长
    pub fn record_failure(&mut self) -> Duration {
        self.current = Self::next_delay(self.current, self.max);
        self.current
    }

    /// 记录一次成功，退避回到起始值
    pub fn reset(&mut self) -> Duration {
        self.current = self.start;
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_after_n_failures_is_start_times_two_pow_n() {
        let start = Duration::from_millis(100);
        let max = Duration::from_millis(1_000);
        let mut backoff = Backoff::new(start, max);

        for n in 1..=6u32 {
            let delay = backoff.record_failure();
            let expected = (start * 2u32.pow(n)).min(max);
            assert_eq!(delay, expected, "after {} failures", n);
        }
    }

    #[test]
    fn success_resets_to_start() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1_000));
        backoff.record_failure();
        backoff.record_failure();
        assert_eq!(backoff.reset(), Duration::from_millis(100));
        assert_eq!(backoff.current(), Duration::from_millis(100));
    }
}
