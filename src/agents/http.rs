//! HTTP 端点适配器
//!
//! POST {"task": ...} 到远端执行器；响应取 JSON 的 output 字段，否则用原始文本。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use crate::agents::adapter::{AgentAdapter, DEFAULT_EXECUTE_TIMEOUT_SECS};
use crate::core::HiveError;
use crate::run::TaskResult;

#[derive(Debug, Deserialize)]
struct HttpTaskResponse {
    output: Option<String>,
}

/// HTTP 适配器：远端 POST 执行器
pub struct HttpAdapter {
    name: String,
    url: String,
    description: Option<String>,
    capabilities: Vec<String>,
    bearer_token: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let timeout = Duration::from_secs(DEFAULT_EXECUTE_TIMEOUT_SECS);
        Self {
            name: name.into(),
            url: url.into(),
            description: None,
            capabilities: Vec::new(),
            bearer_token: None,
            timeout,
            client: reqwest::Client::new(),
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

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AgentAdapter for HttpAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "http"
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn execute(&self, task: &str) -> Result<TaskResult, HiveError> {
        let started = Instant::now();

        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "task": task }));
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Ok(TaskResult::timeout(
                    format!("HTTP task timed out after {}s", self.timeout.as_secs()),
                    started.elapsed().as_millis() as u64,
                ))
            }
            Err(e) => {
                return Ok(TaskResult::error(
                    format!("HTTP request failed: {}", e),
                    started.elapsed().as_millis() as u64,
                ))
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let duration_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            return Ok(TaskResult::error(
                format!("HTTP {}: {}", status.as_u16(), body),
                duration_ms,
            ));
        }

        let output = serde_json::from_str::<HttpTaskResponse>(&body)
            .ok()
            .and_then(|r| r.output)
            .unwrap_or(body);
        Ok(TaskResult::ok(output, duration_ms))
    }

    /// 健康检查：GET 同一 URL，可达（任意状态码）即视为健康
    async fn health_check(&self) -> Result<bool, HiveError> {
        let result = self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        Ok(result.is_ok())
    }
}
