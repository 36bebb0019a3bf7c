//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，
//! 如 `HIVE__DASHBOARD__PORT=9090`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::gateway::GatewayConfig;
use crate::limits::{RateLimiterConfig, TaskCacheConfig};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub dashboard: DashboardSection,
    /// [[gateways]]：命名网关池
    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub limits: RateLimiterConfig,
    #[serde(default)]
    pub cache: TaskCacheConfig,
}

/// [orchestrator] 段：循环预算与并发
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// 上下文中单条任务输出截断长度（字符）
    #[serde(default = "default_output_truncation")]
    pub output_truncation: usize,
}

fn default_max_steps() -> usize {
    10
}

fn default_max_concurrency() -> usize {
    8
}

fn default_output_truncation() -> usize {
    3000
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_concurrency: default_max_concurrency(),
            output_truncation: default_output_truncation(),
        }
    }
}

/// [dashboard] 段：监听端口与内存 Run 上限
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardSection {
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
    #[serde(default = "default_max_runs")]
    pub max_runs: usize,
}

fn default_dashboard_port() -> u16 {
    8080
}

fn default_max_runs() -> usize {
    50
}

impl Default for DashboardSection {
    fn default() -> Self {
        Self {
            port: default_dashboard_port(),
            max_runs: default_max_runs(),
        }
    }
}

/// [identity] 段：设备身份文件位置（未设置时用用户配置目录）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IdentitySection {
    pub path: Option<PathBuf>,
}

/// [store] 段：Run 持久化数据库（未设置时用内存存储）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    pub db_path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_app_config() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestrator.max_steps, 10);
        assert_eq!(cfg.orchestrator.max_concurrency, 8);
        assert_eq!(cfg.orchestrator.output_truncation, 3000);
        assert_eq!(cfg.dashboard.port, 8080);
        assert_eq!(cfg.dashboard.max_runs, 50);
        assert!(cfg.gateways.is_empty());
        assert!(cfg.store.db_path.is_none());
    }

    #[test]
    fn test_gateways_deserialize_from_toml() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [[gateways]]
            name = "main"
            url = "ws://127.0.0.1:9100/ws"
            token = "secret"

            [orchestrator]
            max_steps = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.gateways.len(), 1);
        assert_eq!(cfg.gateways[0].name, "main");
        assert_eq!(cfg.gateways[0].token.as_deref(), Some("secret"));
        assert_eq!(cfg.orchestrator.max_steps, 3);
    }
}
