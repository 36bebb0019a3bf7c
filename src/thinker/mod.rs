//! 思考者抽象
//!
//! 所有后端（网关聊天 / 注入闭包 / 测试脚本）实现 Thinker：接收完整上下文，返回原始文本，
//! 由指令解析器提取 execute / finish 指令。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::HiveError;
use crate::gateway::GatewayClient;

/// 思考者：对上下文做一次补全
#[async_trait]
pub trait Thinker: Send + Sync {
    async fn think(&self, context: &str) -> Result<String, HiveError>;
}

/// 网关聊天思考者：通过 GatewayClient.chat 调用远端模型，sessionKey 固定以复用会话
pub struct GatewayThinker {
    client: Arc<GatewayClient>,
    session_key: String,
}

impl GatewayThinker {
    pub fn new(client: Arc<GatewayClient>) -> Self {
        Self {
            client,
            session_key: format!("hive-thinker-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn with_session_key(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = session_key.into();
        self
    }
}

#[async_trait]
impl Thinker for GatewayThinker {
    async fn think(&self, context: &str) -> Result<String, HiveError> {
        self.client.chat(context, &self.session_key, None).await
    }
}

type BoxThinkFn = Box<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String, HiveError>> + Send>>
        + Send
        + Sync,
>;

/// 闭包思考者：包装注入的异步回调（供嵌入方与 plan 使用）
pub struct FnThinker {
    f: BoxThinkFn,
}

impl FnThinker {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, HiveError>> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

#[async_trait]
impl Thinker for FnThinker {
    async fn think(&self, context: &str) -> Result<String, HiveError> {
        (self.f)(context.to_string()).await
    }
}

/// 脚本思考者（用于测试，无需网关）：按顺序弹出预置输出，耗尽后重复最后一条
pub struct ScriptedThinker {
    outputs: Mutex<Vec<String>>,
    last: Mutex<Option<String>>,
}

impl ScriptedThinker {
    pub fn new(outputs: Vec<&str>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into_iter().rev().map(String::from).collect()),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Thinker for ScriptedThinker {
    async fn think(&self, _context: &str) -> Result<String, HiveError> {
        let mut outputs = self.outputs.lock().await;
        match outputs.pop() {
            Some(next) => {
                *self.last.lock().await = Some(next.clone());
                Ok(next)
            }
            None => self
                .last
                .lock()
                .await
                .clone()
                .ok_or_else(|| HiveError::Config("ScriptedThinker has no outputs".to_string())),
        }
    }
}
