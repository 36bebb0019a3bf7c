//! Hive - Rust 自适应多智能体编排核心
//!
//! 模块划分：
//! - **agents**: 适配器契约与三种执行器（函数 / HTTP / 网关聊天）+ 注册表
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与传播策略
//! - **dashboard**: HTTP 面 + SSE 扇出 + 有界内存 Run 表
//! - **gateway**: 线协议、设备身份、WebSocket 客户端与命名池
//! - **limits**: 滑动窗口限流与 TTL+LRU 任务缓存
//! - **observability**: 日志初始化与进程指标
//! - **orchestrator**: 指令解析、Step 派发、Think↔Execute 主循环
//! - **run**: Run/Step/Task 数据模型与持久化
//! - **thinker**: 思考者抽象（网关聊天 / 注入闭包 / 测试脚本）

pub mod agents;
pub mod config;
pub mod core;
pub mod dashboard;
pub mod gateway;
pub mod limits;
pub mod observability;
pub mod orchestrator;
pub mod run;
pub mod thinker;
