//! 进程内函数适配器
//!
//! 包装一个异步闭包为智能体；超时通过与拒绝计时器竞速实现。

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::agents::adapter::{AgentAdapter, DEFAULT_EXECUTE_TIMEOUT_SECS};
use crate::core::HiveError;
use crate::run::TaskResult;

type BoxExecFn =
    Box<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> + Send + Sync>;

/// 函数适配器：进程内可调用执行器
pub struct FunctionAdapter {
    name: String,
    description: Option<String>,
    capabilities: Vec<String>,
    timeout: Duration,
    f: BoxExecFn,
}

impl FunctionAdapter {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            capabilities: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_EXECUTE_TIMEOUT_SECS),
            f: Box::new(move |task| Box::pin(f(task))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AgentAdapter for FunctionAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "function"
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn execute(&self, task: &str) -> Result<TaskResult, HiveError> {
        let started = Instant::now();
        let fut = (self.f)(task.to_string());
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(output)) => TaskResult::ok(output, started.elapsed().as_millis() as u64),
            Ok(Err(e)) => TaskResult::error(e, started.elapsed().as_millis() as u64),
            Err(_) => TaskResult::timeout(
                format!("Task timed out after {}s", self.timeout.as_secs()),
                started.elapsed().as_millis() as u64,
            ),
        };
        Ok(result)
    }
}
