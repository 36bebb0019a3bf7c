//! 滑动窗口限流器
//!
//! 窗口内保存时间戳；满额时可选排队（有界），后台泵在空位出现时放行。
//! 拒绝以 Agent 错误浮出，派发点把它当作普通任务失败处理。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};

use crate::core::HiveError;

/// 限流配置
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimiterConfig {
    /// 窗口长度（毫秒）
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// 窗口内最大请求数
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    /// 超额请求是否排队（否则直接拒绝）
    #[serde(default)]
    pub queue_excess: bool,
    /// 排队上限
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

fn default_window_ms() -> u64 {
    1000
}

fn default_max_requests() -> usize {
    10
}

fn default_max_queue_size() -> usize {
    100
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            queue_excess: false,
            max_queue_size: default_max_queue_size(),
        }
    }
}

/// 统计快照
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub allowed: u64,
    pub throttled: u64,
    pub queued: u64,
    pub rejected: u64,
    pub queue_size: usize,
    pub remaining: usize,
}

type Waiter = oneshot::Sender<Result<(), HiveError>>;

struct LimiterState {
    timestamps: VecDeque<Instant>,
    queue: VecDeque<Waiter>,
    drainer_running: bool,
    allowed: u64,
    throttled: u64,
    queued: u64,
    rejected: u64,
}

/// 滑动窗口限流器
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Arc<Mutex<LimiterState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(LimiterState {
                timestamps: VecDeque::new(),
                queue: VecDeque::new(),
                drainer_running: false,
                allowed: 0,
                throttled: 0,
                queued: 0,
                rejected: 0,
            })),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_ms)
    }

    /// 获取一个配额：有空位立即返回；满额时按配置排队或拒绝
    pub async fn acquire(&self) -> Result<(), HiveError> {
        let rx = {
            let mut state = self.state.lock().await;
            prune(&mut state.timestamps, self.window());

            if state.timestamps.len() < self.config.max_requests {
                state.timestamps.push_back(Instant::now());
                state.allowed += 1;
                return Ok(());
            }

            if !self.config.queue_excess {
                state.rejected += 1;
                return Err(HiveError::Agent("Rate limit exceeded".to_string()));
            }
            if state.queue.len() >= self.config.max_queue_size {
                state.rejected += 1;
                return Err(HiveError::Agent("Rate limit queue full".to_string()));
            }

            state.throttled += 1;
            state.queued += 1;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);

            if !state.drainer_running {
                state.drainer_running = true;
                self.spawn_drainer();
            }
            rx
        };

        rx.await
            .map_err(|_| HiveError::Agent("Rate limiter dropped".to_string()))?
    }

    /// 后台泵：有空位时按序放行排队者
    fn spawn_drainer(&self) {
        let state = Arc::clone(&self.state);
        let window = self.window();
        let max_requests = self.config.max_requests;

        tokio::spawn(async move {
            loop {
                let sleep_for = {
                    let mut st = state.lock().await;
                    prune(&mut st.timestamps, window);

                    while st.timestamps.len() < max_requests && !st.queue.is_empty() {
                        if let Some(tx) = st.queue.pop_front() {
                            st.timestamps.push_back(Instant::now());
                            st.allowed += 1;
                            let _ = tx.send(Ok(()));
                        }
                    }

                    if st.queue.is_empty() {
                        st.drainer_running = false;
                        return;
                    }

                    let next_available = st
                        .timestamps
                        .front()
                        .map(|t| *t + window)
                        .unwrap_or_else(Instant::now);
                    let wait = next_available
                        .saturating_duration_since(Instant::now())
                        + Duration::from_millis(10);
                    wait.min(Duration::from_millis(100))
                };
                tokio::time::sleep(sleep_for).await;
            }
        });
    }

    /// 清空窗口并拒绝所有排队者
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.timestamps.clear();
        while let Some(tx) = state.queue.pop_front() {
            let _ = tx.send(Err(HiveError::Agent("Rate limiter reset".to_string())));
        }
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let mut state = self.state.lock().await;
        prune(&mut state.timestamps, self.window());
        RateLimiterStats {
            allowed: state.allowed,
            throttled: state.throttled,
            queued: state.queued,
            rejected: state.rejected,
            queue_size: state.queue.len(),
            remaining: self.config.max_requests.saturating_sub(state.timestamps.len()),
        }
    }
}

/// 剔除窗口外的时间戳
fn prune(timestamps: &mut VecDeque<Instant>, window: Duration) {
    let Some(cutoff) = Instant::now().checked_sub(window) else {
        return;
    };
    while let Some(front) = timestamps.front() {
        if *front <= cutoff {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: usize, queue: bool) -> RateLimiterConfig {
        RateLimiterConfig {
            window_ms: 100,
            max_requests: max,
            queue_excess: queue,
            max_queue_size: 2,
        }
    }

    #[tokio::test]
    async fn test_rejects_over_limit_without_queue() {
        let limiter = RateLimiter::new(config(2, false));
        assert!(limiter.acquire().await.is_ok());
        assert!(limiter.acquire().await.is_ok());
        let err = limiter.acquire().await.unwrap_err();
        assert!(err.to_string().contains("Rate limit exceeded"));

        let stats = limiter.stats().await;
        assert_eq!(stats.allowed, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.remaining, 0);
    }

    #[tokio::test]
    async fn test_window_invariant_holds() {
        let limiter = RateLimiter::new(config(3, false));
        for _ in 0..3 {
            limiter.acquire().await.unwrap();
        }
        // 窗口内计数已到上限
        assert_eq!(limiter.stats().await.remaining, 0);

        // 窗口滑过后配额恢复
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(limiter.stats().await.remaining, 3);
        assert!(limiter.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_drains_when_slots_free() {
        let limiter = RateLimiter::new(config(1, true));
        limiter.acquire().await.unwrap();

        let started = Instant::now();
        limiter.acquire().await.unwrap();
        // 排队者必须等到窗口滑出才放行
        assert!(started.elapsed() >= Duration::from_millis(50));

        let stats = limiter.stats().await;
        assert_eq!(stats.allowed, 2);
        assert_eq!(stats.queued, 1);
    }

    #[tokio::test]
    async fn test_queue_overflow_rejected() {
        let limiter = Arc::new(RateLimiter::new(config(1, true)));
        limiter.acquire().await.unwrap();

        // 占满队列（容量 2）
        let l1 = Arc::clone(&limiter);
        let h1 = tokio::spawn(async move { l1.acquire().await });
        let l2 = Arc::clone(&limiter);
        let h2 = tokio::spawn(async move { l2.acquire().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = limiter.acquire().await.unwrap_err();
        assert!(err.to_string().contains("Rate limit queue full"));

        assert!(h1.await.unwrap().is_ok());
        assert!(h2.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_reset_rejects_queued_waiters() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            window_ms: 10_000,
            max_requests: 1,
            queue_excess: true,
            max_queue_size: 10,
        }));
        limiter.acquire().await.unwrap();

        let l = Arc::clone(&limiter);
        let waiting = tokio::spawn(async move { l.acquire().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        limiter.reset().await;
        let err = waiting.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("Rate limiter reset"));
    }
}
