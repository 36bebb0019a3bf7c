//! Step 派发引擎
//!
//! 按插入顺序以 max_concurrency 为窗口分批派发：每个窗口内的任务并发执行，
//! 窗口全部终态后才开始下一窗口（固定窗口而非滑动池，保持既有行为）。
//! 单任务异常收敛为 error 结果，绝不取消兄弟任务。

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::agents::{AgentAdapter, AgentRegistry};
use crate::limits::{task_key, RateLimiter, TaskCache};
use crate::orchestrator::events::{send_event, EventSender, RunEvent};
use crate::run::{Step, StepTask, TaskResult, TaskState};

/// 派发点的限流与缓存（均可缺省）
#[derive(Clone, Default)]
pub struct StepLimits {
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub cache: Option<Arc<TaskCache>>,
}

/// 执行一个 Step：返回时所有任务均已终态
pub async fn execute_step(
    run_id: &str,
    step: &mut Step,
    registry: &AgentRegistry,
    max_concurrency: usize,
    limits: &StepLimits,
    event_tx: &Option<EventSender>,
) {
    let window = max_concurrency.max(1);
    let step_number = step.step_number;
    let total = step.tasks.len();

    let mut index = 0;
    while index < total {
        let end = (index + window).min(total);
        let batch = step.tasks[index..end].to_vec();

        let futures = batch.into_iter().map(|task| {
            let run_id = run_id.to_string();
            let event_tx = event_tx.clone();
            async move {
                run_task(&run_id, step_number, task, registry, limits, &event_tx).await
            }
        });
        let finished = futures_util::future::join_all(futures).await;

        for (offset, task) in finished.into_iter().enumerate() {
            step.tasks[index + offset] = task;
        }
        index = end;
    }
}

/// 执行单个任务：task:started → 限流 → 缓存 → 解析适配器 → 执行（可选流式）→ task:ended
async fn run_task(
    run_id: &str,
    step_number: usize,
    mut task: StepTask,
    registry: &AgentRegistry,
    limits: &StepLimits,
    event_tx: &Option<EventSender>,
) -> StepTask {
    task.status = TaskState::Running;
    send_event(
        event_tx,
        RunEvent::TaskStarted {
            run_id: run_id.to_string(),
            step_number,
            task_id: task.id.clone(),
        },
    );

    let started = std::time::Instant::now();
    let result = execute_with_limits(run_id, step_number, &task, registry, limits, event_tx, started).await;

    task.finish(result.clone());
    send_event(
        event_tx,
        RunEvent::TaskEnded {
            run_id: run_id.to_string(),
            step_number,
            task_id: task.id.clone(),
            result,
            status: task.status,
        },
    );
    task
}

/// 限流（拒绝即任务失败）→ 缓存命中直接返回 → 适配器执行 → 成功结果写缓存
async fn execute_with_limits(
    run_id: &str,
    step_number: usize,
    task: &StepTask,
    registry: &AgentRegistry,
    limits: &StepLimits,
    event_tx: &Option<EventSender>,
    started: std::time::Instant,
) -> TaskResult {
    if let Some(limiter) = &limits.rate_limiter {
        if let Err(e) = limiter.acquire().await {
            return TaskResult::error(e.to_string(), started.elapsed().as_millis() as u64);
        }
    }

    let cache_key = limits
        .cache
        .as_ref()
        .map(|_| task_key(&task.task, task.agent.as_deref()));
    if let (Some(cache), Some(key)) = (&limits.cache, &cache_key) {
        if let Some(output) = cache.get(key).await {
            return TaskResult::ok(output, started.elapsed().as_millis() as u64);
        }
    }

    let adapter = resolve_adapter(registry, task.agent.as_deref()).await;
    let result = match adapter {
        None => TaskResult::error(
            format!("No agent available for task '{}'", task.id),
            started.elapsed().as_millis() as u64,
        ),
        Some(adapter) => {
            let outcome = if adapter.supports_streaming() && event_tx.is_some() {
                execute_streaming(run_id, step_number, task, adapter.as_ref(), event_tx).await
            } else {
                adapter.execute(&task.task).await
            };
            match outcome {
                Ok(result) => result,
                Err(e) => {
                    TaskResult::error(e.to_string(), started.elapsed().as_millis() as u64)
                }
            }
        }
    };

    if result.is_ok() {
        if let (Some(cache), Some(key)) = (&limits.cache, &cache_key) {
            cache.set(key.clone(), result.output.clone()).await;
        }
    }
    result
}

/// 适配器解析：pick（名字/能力）→ 第一个注册的适配器 → 无
async fn resolve_adapter(
    registry: &AgentRegistry,
    hint: Option<&str>,
) -> Option<Arc<dyn AgentAdapter>> {
    if let Some(key) = hint {
        if let Some(adapter) = registry.pick(key).await {
            return Some(adapter);
        }
    }
    registry.first().await
}

/// 流式执行：chunk 转发为 task:chunk(done=false) 事件
async fn execute_streaming(
    run_id: &str,
    step_number: usize,
    task: &StepTask,
    adapter: &dyn AgentAdapter,
    event_tx: &Option<EventSender>,
) -> Result<TaskResult, crate::core::HiveError> {
    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();

    let forward_tx = event_tx.clone();
    let forward_run_id = run_id.to_string();
    let forward_task_id = task.id.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(content) = chunk_rx.recv().await {
            send_event(
                &forward_tx,
                RunEvent::TaskChunk {
                    run_id: forward_run_id.clone(),
                    step_number,
                    task_id: forward_task_id.clone(),
                    content,
                    done: false,
                },
            );
        }
    });

    let result = adapter.execute_stream(&task.task, chunk_tx).await;
    let _ = forwarder.await;
    result
}
