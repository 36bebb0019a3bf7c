//! 智能体适配器契约
//!
//! 统一的执行面：name / kind / capabilities / execute，可选 execute_stream 与
//! health_check。三种具体实现（进程内函数、HTTP 端点、网关聊天）为平行实现，
//! 不共享基类。

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::HiveError;
use crate::run::TaskResult;

/// 适配器默认执行超时（秒）
pub const DEFAULT_EXECUTE_TIMEOUT_SECS: u64 = 60;

/// 智能体适配器：所有执行器实现此接口
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// 注册名（Registry 内唯一）
    fn name(&self) -> &str;

    /// 类型标签：function / http / gateway
    fn kind(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    /// 能力标签，用于无名字路由
    fn capabilities(&self) -> &[String] {
        &[]
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    /// 执行任务。适配器内部失败应尽量收敛为非 ok 的 TaskResult；
    /// 返回 Err 的情形由派发方转换为 error 结果，不会中止兄弟任务。
    async fn execute(&self, task: &str) -> Result<TaskResult, HiveError>;

    /// 流式执行：经 chunk_tx 推送增量内容，返回最终结果。默认退化为 execute。
    async fn execute_stream(
        &self,
        task: &str,
        chunk_tx: mpsc::UnboundedSender<String>,
    ) -> Result<TaskResult, HiveError> {
        let _ = chunk_tx;
        self.execute(task).await
    }

    /// 健康检查；未实现视为健康
    async fn health_check(&self) -> Result<bool, HiveError> {
        Ok(true)
    }
}

/// 花名册条目：供上下文组装与 /api/health 使用
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub capabilities: Vec<String>,
}

impl AgentInfo {
    pub fn of(adapter: &dyn AgentAdapter) -> Self {
        Self {
            name: adapter.name().to_string(),
            kind: adapter.kind().to_string(),
            description: adapter.description().map(String::from),
            capabilities: adapter.capabilities().to_vec(),
        }
    }
}
