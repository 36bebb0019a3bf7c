//! 编排核心错误类型
//!
//! 与传播策略配合：Parse / Validation 中止当前 Run；Agent 错误收敛为该任务的
//! TaskResult，循环继续；Think 阶段的 Gateway 错误中止 Run，任务阶段的则记入任务结果。

use thiserror::Error;

/// 编排运行过程中可能出现的错误（解析、校验、网关、智能体、配置等）
#[derive(Error, Debug)]
pub enum HiveError {
    /// 思考者输出在补救与一次重试后仍无法解析为有效指令
    #[error("Parse error: {0}")]
    Parse(String),

    /// 指令 JSON 合法但违反 schema 或枚举（未知 action、空任务、空答案、重复注册等）
    #[error("Validation error: {0}")]
    Validation(String),

    /// 协议级失败：网关错误帧（code: message）、连接关闭或单请求超时
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// 适配器 execute 抛错或返回非 ok 的 TaskResult
    #[error("Agent error: {0}")]
    Agent(String),

    /// 缺少必需配置（无网关、身份文件不可写等）
    #[error("Config error: {0}")]
    Config(String),

    /// Run 持久化读写失败
    #[error("Store error: {0}")]
    Store(String),

    /// 等待超时（网关请求、聊天、适配器执行）
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl HiveError {
    /// 网关错误帧统一格式化为 `code: message`
    pub fn gateway_frame(code: &str, message: &str) -> Self {
        Self::Gateway(format!("{}: {}", code, message))
    }
}
