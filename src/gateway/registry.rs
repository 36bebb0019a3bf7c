//! 网关注册表：命名池与带重试的兜底选择
//!
//! pick 优先选中指定名字，否则按插入顺序轮询；每个候选最多尝试连接 3 次、
//! 间隔 2 秒；全部失败时抛出最后一个错误。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::core::HiveError;
use crate::gateway::client::GatewayClient;

/// 每个候选的连接尝试次数
const CONNECT_ATTEMPTS: usize = 3;
/// 尝试间隔
const CONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// 网关池
#[derive(Default)]
pub struct GatewayRegistry {
    clients: RwLock<Vec<Arc<GatewayClient>>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册网关；重名拒绝
    pub async fn add(&self, client: Arc<GatewayClient>) -> Result<(), HiveError> {
        let mut clients = self.clients.write().await;
        if clients.iter().any(|c| c.name() == client.name()) {
            return Err(HiveError::Validation(format!(
                "Gateway '{}' already registered",
                client.name()
            )));
        }
        clients.push(client);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<GatewayClient>> {
        self.clients
            .read()
            .await
            .iter()
            .find(|c| c.name() == name)
            .map(Arc::clone)
    }

    pub async fn names(&self) -> Vec<String> {
        self.clients
            .read()
            .await
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// 选择并连接一个网关
    pub async fn pick(&self, preferred: Option<&str>) -> Result<Arc<GatewayClient>, HiveError> {
        let clients = self.clients.read().await;
        if clients.is_empty() {
            return Err(HiveError::Config("No gateways configured".to_string()));
        }

        let candidates: Vec<Arc<GatewayClient>> = match preferred {
            Some(name) if clients.iter().any(|c| c.name() == name) => clients
                .iter()
                .filter(|c| c.name() == name)
                .map(Arc::clone)
                .collect(),
            _ => clients.iter().map(Arc::clone).collect(),
        };
        drop(clients);

        let mut last_error: Option<HiveError> = None;
        for client in candidates {
            for attempt in 1..=CONNECT_ATTEMPTS {
                match client.connect().await {
                    Ok(()) => return Ok(client),
                    Err(e) => {
                        tracing::warn!(
                            gateway = %client.name(),
                            attempt,
                            "Gateway connect failed: {}",
                            e
                        );
                        last_error = Some(e);
                        if attempt < CONNECT_ATTEMPTS {
                            tokio::time::sleep(CONNECT_BACKOFF).await;
                        }
                    }
                }
            }
        }

        Err(HiveError::Gateway(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no gateway reachable".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::client::GatewayConfig;
    use crate::gateway::identity::DeviceIdentity;

    fn client(name: &str) -> Arc<GatewayClient> {
        let dir = tempfile::tempdir().unwrap();
        let identity =
            Arc::new(DeviceIdentity::load_or_create(&dir.path().join("d.json")).unwrap());
        Arc::new(GatewayClient::new(
            GatewayConfig {
                name: name.to_string(),
                url: "ws://127.0.0.1:1/ws".to_string(),
                token: None,
            },
            identity,
        ))
    }

    #[tokio::test]
    async fn test_empty_registry_pick_fails() {
        let registry = GatewayRegistry::new();
        let err = registry.pick(None).await.unwrap_err();
        assert!(err.to_string().contains("No gateways configured"));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = GatewayRegistry::new();
        registry.add(client("gw")).await.unwrap();
        assert!(registry.add(client("gw")).await.is_err());
    }

    #[tokio::test]
    async fn test_get_and_names() {
        let registry = GatewayRegistry::new();
        registry.add(client("a")).await.unwrap();
        registry.add(client("b")).await.unwrap();
        assert_eq!(registry.names().await, vec!["a", "b"]);
        assert!(registry.get("a").await.is_some());
        assert!(registry.get("c").await.is_none());
    }
}
