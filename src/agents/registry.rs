//! 智能体注册表：名字/能力路由与健康快照
//!
//! pick 解析顺序：名字精确匹配 → 按注册顺序第一个能力匹配 → 无。
//! check_all_health 并行调用各适配器的 health_check 并缓存结果。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::agents::adapter::{AgentAdapter, AgentInfo};
use crate::core::HiveError;

/// 缓存的健康快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub name: String,
    pub healthy: bool,
    /// 毫秒时间戳
    pub last_check: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 注册表：保持插入顺序
#[derive(Default)]
pub struct AgentRegistry {
    adapters: RwLock<Vec<Arc<dyn AgentAdapter>>>,
    health: RwLock<HashMap<String, AgentHealth>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册适配器；重名拒绝
    pub async fn add(&self, adapter: Arc<dyn AgentAdapter>) -> Result<(), HiveError> {
        let mut adapters = self.adapters.write().await;
        if adapters.iter().any(|a| a.name() == adapter.name()) {
            return Err(HiveError::Validation(format!(
                "Agent '{}' already registered",
                adapter.name()
            )));
        }
        adapters.push(adapter);
        Ok(())
    }

    /// 按名字或能力解析适配器
    pub async fn pick(&self, key: &str) -> Option<Arc<dyn AgentAdapter>> {
        let adapters = self.adapters.read().await;
        if let Some(by_name) = adapters.iter().find(|a| a.name() == key) {
            return Some(Arc::clone(by_name));
        }
        adapters
            .iter()
            .find(|a| a.capabilities().iter().any(|c| c == key))
            .map(Arc::clone)
    }

    /// 第一个注册的适配器（pick 失败时的兜底）
    pub async fn first(&self) -> Option<Arc<dyn AgentAdapter>> {
        self.adapters.read().await.first().map(Arc::clone)
    }

    pub async fn is_empty(&self) -> bool {
        self.adapters.read().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.adapters.read().await.len()
    }

    /// 花名册（供上下文组装与 /api/health）
    pub async fn roster(&self) -> Vec<AgentInfo> {
        self.adapters
            .read()
            .await
            .iter()
            .map(|a| AgentInfo::of(a.as_ref()))
            .collect()
    }

    /// 并行健康检查并缓存结果
    pub async fn check_all_health(&self) -> Vec<AgentHealth> {
        let adapters: Vec<Arc<dyn AgentAdapter>> =
            self.adapters.read().await.iter().map(Arc::clone).collect();

        let checks = adapters.iter().map(|adapter| {
            let adapter = Arc::clone(adapter);
            async move {
                let started = Instant::now();
                let outcome = adapter.health_check().await;
                let response_time_ms = started.elapsed().as_millis() as u64;
                match outcome {
                    Ok(healthy) => AgentHealth {
                        name: adapter.name().to_string(),
                        healthy,
                        last_check: chrono::Utc::now().timestamp_millis(),
                        response_time_ms: Some(response_time_ms),
                        error: None,
                    },
                    Err(e) => AgentHealth {
                        name: adapter.name().to_string(),
                        healthy: false,
                        last_check: chrono::Utc::now().timestamp_millis(),
                        response_time_ms: Some(response_time_ms),
                        error: Some(e.to_string()),
                    },
                }
            }
        });

        let results = futures_util::future::join_all(checks).await;

        let mut cache = self.health.write().await;
        for health in &results {
            cache.insert(health.name.clone(), health.clone());
        }
        results
    }

    /// 最近一次健康快照（未检查过的智能体不在其中）
    pub async fn health_snapshot(&self) -> HashMap<String, AgentHealth> {
        self.health.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::function::FunctionAdapter;

    fn adapter(name: &str, caps: &[&str]) -> Arc<dyn AgentAdapter> {
        Arc::new(
            FunctionAdapter::new(name, |t: String| async move { Ok(t) })
                .with_capabilities(caps.iter().map(|s| s.to_string()).collect()),
        )
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = AgentRegistry::new();
        registry.add(adapter("a", &[])).await.unwrap();
        let err = registry.add(adapter("a", &[])).await.unwrap_err();
        assert!(matches!(err, HiveError::Validation(_)));
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_pick_by_name_then_capability() {
        let registry = AgentRegistry::new();
        registry.add(adapter("coder", &["code"])).await.unwrap();
        registry.add(adapter("tester", &["code", "test"])).await.unwrap();

        assert_eq!(registry.pick("coder").await.unwrap().name(), "coder");
        // 能力匹配按注册顺序取第一个
        assert_eq!(registry.pick("code").await.unwrap().name(), "coder");
        assert_eq!(registry.pick("test").await.unwrap().name(), "tester");
        assert!(registry.pick("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_check_all_health_defaults_healthy() {
        let registry = AgentRegistry::new();
        registry.add(adapter("a", &[])).await.unwrap();
        registry.add(adapter("b", &[])).await.unwrap();

        let results = registry.check_all_health().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|h| h.healthy));

        let snapshot = registry.health_snapshot().await;
        assert!(snapshot.contains_key("a"));
        assert!(snapshot.contains_key("b"));
    }
}
