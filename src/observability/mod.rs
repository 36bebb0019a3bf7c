//! 可观测性
//!
//! 结构化日志初始化与进程级指标：Think 调用、任务执行、网关请求的计数与耗时。

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化日志：默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}

/// 进程级指标收集器
#[derive(Debug, Default)]
pub struct Metrics {
    pub runs_started: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_failed: AtomicU64,
    pub think_calls: AtomicU64,
    pub tasks_executed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub gateway_calls: AtomicU64,
    pub gateway_errors: AtomicU64,
    pub task_time_ms_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 进程级单例（便捷入口；组件也可持有自己的实例）
    pub fn global() -> &'static Metrics {
        static INSTANCE: std::sync::OnceLock<Metrics> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(Metrics::new)
    }

    pub fn record_task(&self, duration_ms: u64, failed: bool) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        self.task_time_ms_total.fetch_add(duration_ms, Ordering::Relaxed);
        if failed {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn average_task_time_ms(&self) -> u64 {
        let total = self.tasks_executed.load(Ordering::Relaxed);
        if total == 0 {
            0
        } else {
            self.task_time_ms_total.load(Ordering::Relaxed) / total
        }
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "runs": {
                "started": self.runs_started.load(Ordering::Relaxed),
                "completed": self.runs_completed.load(Ordering::Relaxed),
                "failed": self.runs_failed.load(Ordering::Relaxed),
            },
            "think": {
                "calls": self.think_calls.load(Ordering::Relaxed),
            },
            "tasks": {
                "executed": self.tasks_executed.load(Ordering::Relaxed),
                "failed": self.tasks_failed.load(Ordering::Relaxed),
                "average_time_ms": self.average_task_time_ms(),
            },
            "gateway": {
                "calls": self.gateway_calls.load(Ordering::Relaxed),
                "errors": self.gateway_errors.load(Ordering::Relaxed),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_task_updates_counters() {
        let metrics = Metrics::new();
        metrics.record_task(100, false);
        metrics.record_task(200, true);

        assert_eq!(metrics.tasks_executed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.tasks_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.average_task_time_ms(), 150);

        let json = metrics.to_json();
        assert_eq!(json["tasks"]["executed"], 2);
        assert_eq!(json["tasks"]["failed"], 1);
    }
}
