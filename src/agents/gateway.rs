//! 网关聊天适配器
//!
//! 把一个 GatewayClient 包装为智能体：任务前缀角色提示（SOUL.md 全文），
//! sessionKey 标记会话以便网关按会话路由。

use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::adapter::AgentAdapter;
use crate::core::HiveError;
use crate::gateway::{DiscoveredAgent, GatewayClient};
use crate::run::TaskResult;

/// 网关智能体适配器
pub struct GatewayAgent {
    name: String,
    agent_id: String,
    description: Option<String>,
    capabilities: Vec<String>,
    role_prompt: Option<String>,
    session_key: String,
    client: Arc<GatewayClient>,
}

impl GatewayAgent {
    pub fn new(client: Arc<GatewayClient>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            agent_id: name.clone(),
            session_key: format!("hive-{}-{}", name, uuid::Uuid::new_v4()),
            name,
            description: None,
            capabilities: Vec::new(),
            role_prompt: None,
            client,
        }
    }

    /// 从发现结果构建：描述、能力与角色提示取自 SOUL.md
    pub fn from_discovered(client: Arc<GatewayClient>, discovered: &DiscoveredAgent) -> Self {
        let mut agent = Self::new(client, &discovered.name);
        agent.agent_id = discovered.id.clone();
        if let Some(soul) = &discovered.soul {
            agent.description = soul.description.clone();
            agent.capabilities = soul.capabilities.clone();
            if !soul.role_prompt.is_empty() {
                agent.role_prompt = Some(soul.role_prompt.clone());
            }
        }
        agent
    }

    pub fn with_role_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.role_prompt = Some(prompt.into());
        self
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    fn compose_prompt(&self, task: &str) -> String {
        match &self.role_prompt {
            Some(role) => format!("{}\n\n{}", role, task),
            None => task.to_string(),
        }
    }
}

#[async_trait]
impl AgentAdapter for GatewayAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "gateway"
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn execute(&self, task: &str) -> Result<TaskResult, HiveError> {
        let started = std::time::Instant::now();
        let prompt = self.compose_prompt(task);
        match self
            .client
            .chat(&prompt, &self.session_key, Some(&self.agent_id))
            .await
        {
            Ok(output) => Ok(TaskResult::ok(output, started.elapsed().as_millis() as u64)),
            Err(HiveError::Timeout(msg)) => Ok(TaskResult::timeout(
                msg,
                started.elapsed().as_millis() as u64,
            )),
            Err(e) => Ok(TaskResult::error(
                e.to_string(),
                started.elapsed().as_millis() as u64,
            )),
        }
    }

    /// 健康检查：向网关发 health 请求
    async fn health_check(&self) -> Result<bool, HiveError> {
        match self.client.call("health", None, Some(10_000)).await {
            Ok(_) => Ok(true),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{DeviceIdentity, GatewayConfig};

    fn client() -> Arc<GatewayClient> {
        let dir = tempfile::tempdir().unwrap();
        let identity =
            Arc::new(DeviceIdentity::load_or_create(&dir.path().join("d.json")).unwrap());
        Arc::new(GatewayClient::new(
            GatewayConfig {
                name: "gw".into(),
                url: "ws://127.0.0.1:1/ws".into(),
                token: None,
            },
            identity,
        ))
    }

    #[test]
    fn test_role_prompt_prefixes_task() {
        let agent = GatewayAgent::new(client(), "scout").with_role_prompt("# Scout\n\nBe brief.");
        assert_eq!(
            agent.compose_prompt("find facts"),
            "# Scout\n\nBe brief.\n\nfind facts"
        );
    }

    #[test]
    fn test_session_key_tags_agent_name() {
        let agent = GatewayAgent::new(client(), "scout");
        assert!(agent.session_key().starts_with("hive-scout-"));
    }

    #[test]
    fn test_from_discovered_takes_soul_fields() {
        let discovered = DiscoveredAgent {
            id: "a-1".into(),
            name: "scout".into(),
            soul: Some(crate::gateway::parse_soul(
                "# Scout\n\nA research agent.\n\n## What You're Good At\n\n- Web Research\n",
            )),
        };
        let agent = GatewayAgent::from_discovered(client(), &discovered);
        assert_eq!(agent.description(), Some("A research agent."));
        assert_eq!(agent.capabilities(), &["web-research".to_string()]);
    }
}
