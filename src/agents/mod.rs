//! 智能体层：适配器契约、三种执行器实现与注册表

pub mod adapter;
pub mod function;
pub mod gateway;
pub mod http;
pub mod registry;

pub use adapter::{AgentAdapter, AgentInfo};
pub use function::FunctionAdapter;
pub use gateway::GatewayAgent;
pub use http::HttpAdapter;
pub use registry::{AgentHealth, AgentRegistry};
