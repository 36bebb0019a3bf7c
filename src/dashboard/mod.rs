//! 仪表盘服务
//!
//! HTTP 面（health、runs 增删查、目标提交、指标）+ SSE 扇出。
//! 服务端持有一张有界的近期 Run 内存表（超限逐出最旧），并在每次 step 结束
//! 与终态转移时写入 RunStore。所有响应带 `Access-Control-Allow-Origin: *`。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_stream::wrappers::BroadcastStream;

use crate::agents::AgentRegistry;
use crate::gateway::GatewayRegistry;
use crate::observability::Metrics;
use crate::orchestrator::{Orchestrator, RunEvent, RunOptions, StepLimits};
use crate::run::{Run, RunState, RunStore, Step, StepTask};
use crate::thinker::GatewayThinker;

/// SSE 广播缓冲
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 内存 Run 表：插入顺序即提交顺序，逐出最旧
struct RunMap {
    runs: HashMap<String, Run>,
    order: VecDeque<String>,
}

/// 仪表盘共享状态
pub struct DashboardState {
    max_runs: usize,
    run_options: RunOptions,
    limits: StepLimits,
    runs: RwLock<RunMap>,
    events_tx: broadcast::Sender<String>,
    store: Arc<dyn RunStore>,
    agents: Arc<AgentRegistry>,
    gateways: Arc<GatewayRegistry>,
}

impl DashboardState {
    pub fn new(
        agents: Arc<AgentRegistry>,
        gateways: Arc<GatewayRegistry>,
        store: Arc<dyn RunStore>,
        run_options: RunOptions,
        max_runs: usize,
    ) -> Arc<Self> {
        Self::with_limits(agents, gateways, store, run_options, max_runs, StepLimits::default())
    }

    pub fn with_limits(
        agents: Arc<AgentRegistry>,
        gateways: Arc<GatewayRegistry>,
        store: Arc<dyn RunStore>,
        run_options: RunOptions,
        max_runs: usize,
        limits: StepLimits,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            max_runs,
            run_options,
            limits,
            runs: RwLock::new(RunMap {
                runs: HashMap::new(),
                order: VecDeque::new(),
            }),
            events_tx,
            store,
            agents,
            gateways,
        })
    }

    /// 序列化后广播给所有 SSE 订阅者；慢订阅者由 broadcast 缓冲兜底
    fn broadcast(&self, event: &RunEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = self.events_tx.send(json);
        }
    }

    async fn insert_run(&self, run: Run) {
        let mut map = self.runs.write().await;
        if !map.runs.contains_key(&run.run_id) {
            map.order.push_back(run.run_id.clone());
        }
        map.runs.insert(run.run_id.clone(), run);
        while map.order.len() > self.max_runs {
            if let Some(oldest) = map.order.pop_front() {
                map.runs.remove(&oldest);
            }
        }
    }

    async fn persist(&self, run_id: &str) {
        let snapshot = self.runs.read().await.runs.get(run_id).cloned();
        if let Some(run) = snapshot {
            if let Err(e) = self.store.upsert(&run).await {
                tracing::warn!(run_id, "Run persist failed: {}", e);
            }
        }
    }

    /// 由事件流更新内存 Run 表；step 结束与终态时落盘
    async fn apply_event(&self, event: &RunEvent) {
        match event {
            RunEvent::StepThinking { run_id, .. } => {
                if let Some(run) = self.runs.write().await.runs.get_mut(run_id) {
                    run.state = RunState::Thinking;
                }
            }
            RunEvent::StepStarted {
                run_id,
                step_number,
                task_ids,
                tasks,
            } => {
                if let Some(run) = self.runs.write().await.runs.get_mut(run_id) {
                    run.state = RunState::Executing;
                    let prompts = tasks.clone().unwrap_or_default();
                    let step_tasks = task_ids
                        .iter()
                        .enumerate()
                        .map(|(i, id)| {
                            StepTask::new(
                                id.clone(),
                                prompts.get(i).cloned().unwrap_or_default(),
                                None,
                            )
                        })
                        .collect();
                    run.steps.push(Step {
                        step_number: *step_number,
                        tasks: step_tasks,
                    });
                }
            }
            RunEvent::TaskStarted {
                run_id,
                step_number,
                task_id,
            } => {
                if let Some(run) = self.runs.write().await.runs.get_mut(run_id) {
                    if let Some(task) = find_task(run, *step_number, task_id) {
                        task.status = crate::run::TaskState::Running;
                    }
                }
            }
            RunEvent::TaskEnded {
                run_id,
                step_number,
                task_id,
                result,
                ..
            } => {
                if let Some(run) = self.runs.write().await.runs.get_mut(run_id) {
                    if let Some(task) = find_task(run, *step_number, task_id) {
                        task.finish(result.clone());
                    }
                }
                Metrics::global().record_task(
                    result
                        .metadata
                        .get("durationMs")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0),
                    !result.is_ok(),
                );
            }
            RunEvent::StepEnded { run_id, .. } => {
                self.persist(run_id).await;
            }
            RunEvent::RunComplete { run_id, answer, .. } => {
                if let Some(run) = self.runs.write().await.runs.get_mut(run_id) {
                    run.complete(answer.clone().unwrap_or_default());
                }
                Metrics::global()
                    .runs_completed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.persist(run_id).await;
            }
            RunEvent::RunError { run_id, error } => {
                if let Some(run) = self.runs.write().await.runs.get_mut(run_id) {
                    run.fail(error.clone());
                }
                Metrics::global()
                    .runs_failed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.persist(run_id).await;
            }
            RunEvent::RunStarted { .. } | RunEvent::TaskChunk { .. } | RunEvent::RunDeleted { .. } => {}
        }
    }

    /// 提交目标：分配 Run、后台执行、事件同时进内存表与 SSE
    pub async fn submit_goal(
        self: Arc<Self>,
        goal: String,
        options: RunOptions,
    ) -> String {
        let run = Run::new(goal);
        let run_id = run.run_id.clone();
        self.insert_run(run.clone()).await;
        Metrics::global()
            .runs_started
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<RunEvent>();

        // 事件泵：更新内存表 + SSE 广播
        let pump_state = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                pump_state.apply_event(&event).await;
                pump_state.broadcast(&event);
            }
        });

        // 执行泵：选网关建思考者，跑编排循环，终态覆盖内存副本
        let exec_state = Arc::clone(&self);
        tokio::spawn(async move {
            let thinker = match exec_state.gateways.pick(None).await {
                Ok(client) => Arc::new(GatewayThinker::new(client)),
                Err(e) => {
                    let error = e.to_string();
                    tracing::warn!(run_id = %run.run_id, "Run aborted: {}", error);
                    let event = RunEvent::RunError {
                        run_id: run.run_id.clone(),
                        error,
                    };
                    let _ = event_tx.send(event);
                    return;
                }
            };

            let orchestrator = Orchestrator::new(thinker, Arc::clone(&exec_state.agents))
                .with_limits(exec_state.limits.clone());
            let final_run = orchestrator
                .run_prepared(run, options, Some(event_tx))
                .await;
            // 终态的权威副本覆盖事件重建的近似副本
            let run_id = final_run.run_id.clone();
            exec_state.insert_run(final_run).await;
            exec_state.persist(&run_id).await;
        });

        run_id
    }
}

impl DashboardState {
    /// 读取 Run 快照：先查内存表，再查存储
    pub async fn get_run(&self, run_id: &str) -> Option<Run> {
        if let Some(run) = self.runs.read().await.runs.get(run_id) {
            return Some(run.clone());
        }
        self.store.get(run_id).await.ok().flatten()
    }
}

fn find_task<'a>(run: &'a mut Run, step_number: usize, task_id: &str) -> Option<&'a mut StepTask> {
    run.steps
        .iter_mut()
        .find(|s| s.step_number == step_number)?
        .tasks
        .iter_mut()
        .find(|t| t.id == task_id)
}

/// 组装路由
pub fn router(state: Arc<DashboardState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/health", get(api_health))
        .route("/api/agents/health", get(api_agents_health))
        .route("/api/events", get(api_events))
        .route("/api/runs", get(api_list_runs).post(api_create_run))
        .route("/api/runs/:id", get(api_get_run).delete(api_delete_run))
        .route("/api/metrics", get(api_metrics))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// 启动服务
pub async fn serve(state: Arc<DashboardState>, port: u16) -> std::io::Result<()> {
    let app = router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Dashboard listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

/// CORS：所有响应加 `*`，OPTIONS 直接 204
async fn cors(req: axum::extract::Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return with_cors(StatusCode::NO_CONTENT.into_response());
    }
    with_cors(next.run(req).await)
}

fn with_cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        header::HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        header::HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        header::HeaderValue::from_static("Content-Type, Authorization"),
    );
    response
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../../static/index.html"))
}

async fn api_health(State(state): State<Arc<DashboardState>>) -> Json<serde_json::Value> {
    let roster = state.agents.roster().await;
    let health = state.agents.health_snapshot().await;
    let agents: Vec<serde_json::Value> = roster
        .iter()
        .map(|info| {
            let mut value = serde_json::to_value(info).unwrap_or_default();
            if let Some(h) = health.get(&info.name) {
                value["health"] = serde_json::to_value(h).unwrap_or_default();
            }
            value
        })
        .collect();

    Json(serde_json::json!({
        "ok": true,
        "agents": agents,
        "gateways": state.gateways.names().await,
    }))
}

async fn api_agents_health(State(state): State<Arc<DashboardState>>) -> Json<serde_json::Value> {
    let agents = state.agents.check_all_health().await;
    Json(serde_json::json!({ "agents": agents }))
}

async fn api_metrics() -> Json<serde_json::Value> {
    Json(Metrics::global().to_json())
}

/// SSE：注册订阅并先写一行保活注释，之后每个事件一帧 `data: <json>\n\n`
async fn api_events(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    let rx = state.events_tx.subscribe();
    let events = BroadcastStream::new(rx)
        .filter_map(|msg| futures_util::future::ready(msg.ok()))
        .map(|json| {
            Ok::<_, std::convert::Infallible>(Bytes::from(format!("data: {}\n\n", json)))
        });
    let keepalive = futures_util::stream::once(async {
        Ok::<_, std::convert::Infallible>(Bytes::from_static(b":\n\n"))
    });

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(keepalive.chain(events)),
    )
}

async fn api_list_runs(State(state): State<Arc<DashboardState>>) -> Json<Vec<Run>> {
    let map = state.runs.read().await;
    let mut runs: Vec<Run> = map.runs.values().cloned().collect();
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Json(runs)
}

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    #[serde(default)]
    goal: String,
    #[serde(rename = "maxConcurrency")]
    max_concurrency: Option<usize>,
    #[serde(rename = "maxSteps")]
    max_steps: Option<usize>,
}

async fn api_create_run(
    State(state): State<Arc<DashboardState>>,
    body: Result<Json<CreateRunRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(json) => json,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("invalid JSON body: {}", e) })),
            )
                .into_response()
        }
    };

    let goal = request.goal.trim().to_string();
    if goal.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "goal is required" })),
        )
            .into_response();
    }

    let mut options = state.run_options.clone();
    if let Some(c) = request.max_concurrency {
        options.max_concurrency = c;
    }
    if let Some(s) = request.max_steps {
        options.max_steps = s;
    }

    let run_id = state.submit_goal(goal.clone(), options).await;
    (
        StatusCode::CREATED,
        Json(serde_json::json!({ "runId": run_id, "goal": goal })),
    )
        .into_response()
}

async fn api_get_run(
    State(state): State<Arc<DashboardState>>,
    Path(id): Path<String>,
) -> Response {
    if let Some(run) = state.get_run(&id).await {
        return Json(run).into_response();
    }
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Run not found" })),
    )
        .into_response()
}

async fn api_delete_run(
    State(state): State<Arc<DashboardState>>,
    Path(id): Path<String>,
) -> Response {
    let in_memory = {
        let mut map = state.runs.write().await;
        let removed = map.runs.remove(&id).is_some();
        if removed {
            map.order.retain(|r| r != &id);
        }
        removed
    };
    let in_store = state.store.delete(&id).await.unwrap_or(false);

    if in_memory || in_store {
        state.broadcast(&RunEvent::RunDeleted { run_id: id.clone() });
        Json(serde_json::json!({ "deleted": true, "runId": id })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Run not found" })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::MemoryRunStore;

    fn state() -> Arc<DashboardState> {
        DashboardState::new(
            Arc::new(AgentRegistry::new()),
            Arc::new(GatewayRegistry::new()),
            Arc::new(MemoryRunStore::new()),
            RunOptions::default(),
            2,
        )
    }

    #[tokio::test]
    async fn test_run_map_evicts_oldest() {
        let state = state();
        let a = Run::new("a");
        let b = Run::new("b");
        let c = Run::new("c");
        let a_id = a.run_id.clone();
        state.insert_run(a).await;
        state.insert_run(b).await;
        state.insert_run(c).await;

        let map = state.runs.read().await;
        assert_eq!(map.runs.len(), 2);
        assert!(!map.runs.contains_key(&a_id));
    }

    #[tokio::test]
    async fn test_apply_events_rebuilds_run() {
        let state = state();
        let run = Run::new("goal");
        let run_id = run.run_id.clone();
        state.insert_run(run).await;

        state
            .apply_event(&RunEvent::StepStarted {
                run_id: run_id.clone(),
                step_number: 1,
                task_ids: vec!["t1".into()],
                tasks: Some(vec!["do x".into()]),
            })
            .await;
        state
            .apply_event(&RunEvent::TaskEnded {
                run_id: run_id.clone(),
                step_number: 1,
                task_id: "t1".into(),
                result: crate::run::TaskResult::ok("out", 5),
                status: crate::run::TaskState::Done,
            })
            .await;

        let map = state.runs.read().await;
        let run = map.runs.get(&run_id).unwrap();
        assert_eq!(run.state, RunState::Executing);
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].tasks[0].status, crate::run::TaskState::Done);
    }

    #[tokio::test]
    async fn test_submit_goal_without_gateways_errors_run() {
        let state = state();
        let run_id = Arc::clone(&state)
            .submit_goal("x".to_string(), RunOptions::default())
            .await;

        // 后台任务：pick 失败 → run:error
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let map = state.runs.read().await;
        let run = map.runs.get(&run_id).unwrap();
        assert_eq!(run.state, RunState::Error);
        assert!(run.error.as_deref().unwrap().contains("No gateways configured"));
    }
}
