//! Hive - 自适应多智能体编排服务
//!
//! 入口：初始化日志、加载配置、装配网关池与智能体注册表，启动仪表盘。

use std::sync::Arc;

use anyhow::Context;

use hive::agents::{AgentRegistry, GatewayAgent};
use hive::config::load_config;
use hive::dashboard::{self, DashboardState};
use hive::gateway::{DeviceIdentity, GatewayClient, GatewayRegistry};
use hive::limits::{RateLimiter, TaskCache};
use hive::orchestrator::{RunOptions, StepLimits};
use hive::run::create_run_store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cfg = load_config(None).unwrap_or_default();

    let identity_path = cfg
        .identity
        .path
        .clone()
        .unwrap_or_else(DeviceIdentity::default_path);
    let identity = Arc::new(
        DeviceIdentity::load_or_create(&identity_path)
            .context("Failed to load device identity")?,
    );

    let gateways = Arc::new(GatewayRegistry::new());
    for gateway_cfg in &cfg.gateways {
        let client = Arc::new(GatewayClient::new(gateway_cfg.clone(), Arc::clone(&identity)));
        gateways
            .add(client)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    }

    // 网关可达时做一次智能体发现并注册
    let agents = Arc::new(AgentRegistry::new());
    if !gateways.is_empty().await {
        match gateways.pick(None).await {
            Ok(client) => match client.list_agents().await {
                Ok(discovered) => {
                    for agent in &discovered {
                        let adapter = GatewayAgent::from_discovered(Arc::clone(&client), agent);
                        if let Err(e) = agents.add(Arc::new(adapter)).await {
                            tracing::warn!(agent = %agent.name, "Agent registration failed: {}", e);
                        }
                    }
                    tracing::info!("Discovered {} gateway agents", discovered.len());
                }
                Err(e) => tracing::warn!("Agent discovery failed: {}", e),
            },
            Err(e) => tracing::warn!("No reachable gateway at startup: {}", e),
        }
    }

    let store = create_run_store(cfg.store.db_path.as_deref()).await;

    let run_options = RunOptions {
        max_concurrency: cfg.orchestrator.max_concurrency,
        max_steps: cfg.orchestrator.max_steps,
        output_truncation: cfg.orchestrator.output_truncation,
    };
    let limits = StepLimits {
        rate_limiter: Some(Arc::new(RateLimiter::new(cfg.limits.clone()))),
        cache: Some(Arc::new(TaskCache::new(cfg.cache.clone()))),
    };
    let state = DashboardState::with_limits(
        agents,
        gateways,
        store,
        run_options,
        cfg.dashboard.max_runs,
        limits,
    );

    dashboard::serve(state, cfg.dashboard.port)
        .await
        .context("Dashboard server failed")?;
    Ok(())
}
