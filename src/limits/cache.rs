//! 任务结果缓存：TTL + LRU
//!
//! 命中时可选滑动过期（顺延 ttl 并移到 MRU 端）；写入后从 LRU 端逐出直到
//! 容量达标。task_key 对 `[agent ":"] task` 做 sha-256，取前 16 位十六进制。

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// 缓存配置
#[derive(Debug, Clone, Deserialize)]
pub struct TaskCacheConfig {
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// 命中时是否顺延过期时间
    #[serde(default = "default_sliding")]
    pub sliding_expiration: bool,
}

fn default_ttl_ms() -> u64 {
    300_000
}

fn default_max_entries() -> usize {
    500
}

fn default_sliding() -> bool {
    true
}

impl Default for TaskCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            max_entries: default_max_entries(),
            sliding_expiration: default_sliding(),
        }
    }
}

/// 统计快照
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub hit_rate: f64,
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// LRU 顺序：front 最旧，back 最新
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// 任务结果缓存
pub struct TaskCache {
    config: TaskCacheConfig,
    state: Mutex<CacheState>,
}

impl TaskCache {
    pub fn new(config: TaskCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.config.ttl_ms)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.expires_at <= now,
        };

        if expired {
            state.entries.remove(key);
            state.order.retain(|k| k != key);
            state.misses += 1;
            return None;
        }

        state.hits += 1;
        if self.config.sliding_expiration {
            let ttl = self.ttl();
            if let Some(entry) = state.entries.get_mut(key) {
                entry.expires_at = now + ttl;
            }
        }
        // 移到 MRU 端
        state.order.retain(|k| k != key);
        state.order.push_back(key.to_string());

        state.entries.get(key).map(|e| e.value.clone())
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let mut state = self.state.lock().await;

        if state.entries.contains_key(&key) {
            state.order.retain(|k| k != &key);
        }
        state.entries.insert(
            key.clone(),
            CacheEntry {
                value: value.into(),
                expires_at: Instant::now() + self.ttl(),
            },
        );
        state.order.push_back(key);

        // 从 LRU 端逐出
        while state.entries.len() > self.config.max_entries {
            if let Some(oldest) = state.order.pop_front() {
                state.entries.remove(&oldest);
                state.evictions += 1;
            } else {
                break;
            }
        }
    }

    pub async fn stats(&self) -> TaskCacheStats {
        let state = self.state.lock().await;
        let lookups = state.hits + state.misses;
        TaskCacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            size: state.entries.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }
}

/// 确定性缓存键：sha-256(`[agent ":"] task`) 前 16 位十六进制
pub fn task_key(task: &str, agent: Option<&str>) -> String {
    let input = match agent {
        Some(agent) => format!("{}:{}", agent, task),
        None => task.to_string(),
    };
    let digest = Sha256::digest(input.as_bytes());
    digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()[..16]
        .to_string()
}
