//! 网关层：线协议、设备身份、WebSocket 客户端、命名池与 SOUL.md 解析

pub mod client;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod soul;

pub use client::{DiscoveredAgent, GatewayClient, GatewayConfig};
pub use identity::DeviceIdentity;
pub use registry::GatewayRegistry;
pub use soul::{parse_soul, SoulProfile};
