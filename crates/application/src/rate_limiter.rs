use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// 令牌桶状态
#[derive(Debug, Clone)]
struct Bucket {
    /// 当前令牌数，预约后可以为负
    tokens: f64,
    last_refill: Instant,
}

/// 限流等待结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    /// 已拿到令牌（可能等待过）
    Acquired,
    /// 在最长等待时间内拿不到令牌，调用方照常继续
    TimedOut,
}

/// 发送限流器
///
/// 令牌桶，按 `rate_per_second` 恢复，最多积攒 `burst` 个。
/// `wait_n` 采用预约语义：先扣减令牌再睡到预约时刻，因此并发调用者自然排队；
/// 预计等待超过上限时不扣减、立即返回 [`Throttle::TimedOut`]。
pub struct SendRateLimiter {
    rate_per_second: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl SendRateLimiter {
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_second: rate_per_second.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// 每隔 `interval` 放行一次
    pub fn every(interval: Duration, burst: u32) -> Self {
        Self::new(1.0 / interval.as_secs_f64().max(f64::MIN_POSITIVE), burst)
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(self.burst);
        bucket.last_refill = now;
    }

    /// 非阻塞：有令牌就消耗一个并返回 `true`
    pub fn allow(&self) -> bool {
        let Ok(mut bucket) = self.bucket.lock() else {
            return false;
        };
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// 预约 `n` 个令牌，最多等待 `max_wait`
    pub async fn wait_n(&self, n: u32, max_wait: Duration) -> Throttle {
        let delay = {
            let Ok(mut bucket) = self.bucket.lock() else {
                return Throttle::TimedOut;
            };
            self.refill(&mut bucket, Instant::now());
            let cost = f64::from(n);
            let deficit = cost - bucket.tokens;
            if deficit <= 0.0 {
                bucket.tokens -= cost;
                return Throttle::Acquired;
            }
            let delay = Duration::from_secs_f64(deficit / self.rate_per_second);
            if delay > max_wait {
                return Throttle::TimedOut;
            }
            bucket.tokens -= cost;
            delay
        };

        tokio::time::sleep(delay).await;
        Throttle::Acquired
    }

    pub async fn wait(&self, max_wait: Duration) -> Throttle {
        self.wait_n(1, max_wait).await
    }
}
