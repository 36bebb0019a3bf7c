//! 支撑设施：限流与任务缓存

pub mod cache;
pub mod rate_limiter;

pub use cache::{task_key, TaskCache, TaskCacheConfig, TaskCacheStats};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};
