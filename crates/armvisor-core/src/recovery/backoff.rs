//! 指数退避
//!
//! 第 `n` 次重试（从 0 开始）的等待时间为 `first × factor^n`，上限为 `max`。
//! 每次的延迟只由重试次数决定，互不影响。

use std::time::Duration;

/// 退避策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// 第一次重试前的等待
    pub first: Duration,
    /// 等待上限
    pub max: Duration,
    /// 增长倍数（`>= 1.0`）
    pub factor: f64,
    /// 最多重试次数
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// 只重试一次、不等待
    pub const fn single_retry() -> Self {
        Self {
            first: Duration::ZERO,
            max: Duration::ZERO,
            factor: 1.0,
            max_attempts: 1,
        }
    }

    /// 第 `attempt` 次重试前的等待时间；超过 `max_attempts` 返回 `None`
    pub fn next(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let delay = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let policy = BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(30),
            factor: 2.0,
            max_attempts: 5,
        };
        assert_eq!(policy.next(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.next(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.next(3), Some(Duration::from_millis(800)));
        assert_eq!(policy.next(5), None);
    }

    #[test]
    fn test_capped_at_max() {
        let policy = BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 10.0,
            max_attempts: u32::MAX,
        };
        assert_eq!(policy.next(2), Some(Duration::from_secs(1)));
        assert_eq!(policy.next(10_000), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_single_retry() {
        let policy = BackoffPolicy::single_retry();
        assert_eq!(policy.next(0), Some(Duration::ZERO));
        assert_eq!(policy.next(1), None);
    }
}
