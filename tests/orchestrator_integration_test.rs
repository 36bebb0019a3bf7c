//! 编排端到端测试
//!
//! 思考者用脚本或进程内 mock 网关代替真实模型；网关用 tokio-tungstenite
//! 起一个最小服务端验证握手、req/res 与 chat 按 runId 的关联。

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use hive::agents::{AgentRegistry, FunctionAdapter};
use hive::gateway::{DeviceIdentity, GatewayClient, GatewayConfig};
use hive::orchestrator::{Orchestrator, RunOptions};
use hive::run::{RunState, TaskState};
use hive::thinker::ScriptedThinker;

fn identity() -> Arc<DeviceIdentity> {
    let dir = tempfile::tempdir().unwrap();
    Arc::new(DeviceIdentity::load_or_create(&dir.path().join("device.json")).unwrap())
}

/// 最小 mock 网关：应答 connect / chat.send，chat 回 final 事件。
/// reply_fn 决定每条消息的回复文本；delay_ms_fn 决定 final 事件的延迟。
async fn spawn_mock_gateway<F>(reply: F) -> u16
where
    F: Fn(usize, &str) -> (String, u64) + Send + Sync + 'static,
{
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let reply = Arc::new(reply);

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            let reply = Arc::clone(&reply);
            tokio::spawn(async move {
                // 非 WebSocket 连接（如客户端的 best-effort 登录 POST）直接丢弃
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(w) => w,
                    Err(_) => return,
                };
                let (tx, mut rx) = ws.split();
                let tx = Arc::new(Mutex::new(tx));
                let mut chat_count = 0usize;

                while let Some(Ok(msg)) = rx.next().await {
                    let text = match msg {
                        WsMessage::Text(t) => t,
                        _ => continue,
                    };
                    let frame: serde_json::Value = match serde_json::from_str(&text) {
                        Ok(f) => f,
                        Err(_) => continue,
                    };
                    if frame["type"] != "req" {
                        continue;
                    }
                    let id = frame["id"].as_str().unwrap_or_default().to_string();

                    match frame["method"].as_str().unwrap_or_default() {
                        "connect" => {
                            // 设备段必须带签名
                            assert!(frame["params"]["device"]["signature"].is_string());
                            let res = serde_json::json!({
                                "type": "res", "id": id, "ok": true,
                                "payload": {
                                    "server": {"version": "mock"},
                                    "methods": ["chat.send", "agents.list"],
                                    "events": ["chat"],
                                    "policy": {},
                                },
                            });
                            let _ = tx.lock().await.send(WsMessage::Text(res.to_string())).await;
                        }
                        "chat.send" => {
                            let message =
                                frame["params"]["message"].as_str().unwrap_or_default();
                            let run_id = format!("run-{}", uuid::Uuid::new_v4());
                            let res = serde_json::json!({
                                "type": "res", "id": id, "ok": true,
                                "payload": { "runId": run_id },
                            });
                            let _ = tx.lock().await.send(WsMessage::Text(res.to_string())).await;

                            let (answer, delay_ms) = reply(chat_count, message);
                            chat_count += 1;
                            let tx = Arc::clone(&tx);
                            tokio::spawn(async move {
                                tokio::time::sleep(std::time::Duration::from_millis(delay_ms))
                                    .await;
                                let ev = serde_json::json!({
                                    "type": "event", "event": "chat",
                                    "payload": {
                                        "runId": run_id,
                                        "state": "final",
                                        "message": { "content": [ {"type": "text", "text": answer} ] },
                                    },
                                });
                                let _ =
                                    tx.lock().await.send(WsMessage::Text(ev.to_string())).await;
                            });
                        }
                        _ => {
                            let res = serde_json::json!({
                                "type": "res", "id": id, "ok": false,
                                "error": {"code": "UNKNOWN_METHOD", "message": "unknown"},
                            });
                            let _ = tx.lock().await.send(WsMessage::Text(res.to_string())).await;
                        }
                    }
                }
            });
        }
    });
    port
}

fn gateway_client(port: u16) -> Arc<GatewayClient> {
    Arc::new(GatewayClient::new(
        GatewayConfig {
            name: "mock".to_string(),
            url: format!("ws://127.0.0.1:{}/ws", port),
            token: Some("test-token".to_string()),
        },
        identity(),
    ))
}

#[tokio::test]
async fn test_finish_immediately_yields_zero_step_run() {
    let thinker = Arc::new(ScriptedThinker::new(vec![
        r#"{"action":"finish","answer":"42"}"#,
    ]));
    let orchestrator = Orchestrator::new(thinker, Arc::new(AgentRegistry::new()));
    let run = orchestrator.run("what is it", RunOptions::default(), None).await;

    assert_eq!(run.state, RunState::Done);
    assert!(run.steps.is_empty());
    assert_eq!(run.final_answer.as_deref(), Some("42"));
}

#[tokio::test]
async fn test_one_step_then_finish() {
    let thinker = Arc::new(ScriptedThinker::new(vec![
        r#"{"action":"execute","tasks":[{"id":"t1","task":"gather"}]}"#,
        r#"{"action":"finish","answer":"synthesized from step one"}"#,
    ]));
    let registry = Arc::new(AgentRegistry::new());
    registry
        .add(Arc::new(FunctionAdapter::new("echo", |t: String| async move {
            Ok(format!("Done: {}", t))
        })))
        .await
        .unwrap();

    let orchestrator = Orchestrator::new(thinker, registry);
    let run = orchestrator.run("goal", RunOptions::default(), None).await;

    assert_eq!(run.state, RunState::Done);
    assert_eq!(run.steps.len(), 1);
    assert_eq!(run.steps[0].tasks[0].status, TaskState::Done);
    assert_eq!(
        run.steps[0].tasks[0].result.as_ref().unwrap().output,
        "Done: gather"
    );
    assert_eq!(run.final_answer.as_deref(), Some("synthesized from step one"));
}

#[tokio::test]
async fn test_routing_by_name_to_independent_adapters() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let registry = Arc::new(AgentRegistry::new());
    let l = Arc::clone(&log);
    registry
        .add(Arc::new(FunctionAdapter::new("researcher", move |t: String| {
            let l = Arc::clone(&l);
            async move {
                l.lock().await.push(format!("researcher:{}", t));
                Ok(format!("research on {}", t))
            }
        })))
        .await
        .unwrap();
    let l = Arc::clone(&log);
    registry
        .add(Arc::new(FunctionAdapter::new("coder", move |t: String| {
            let l = Arc::clone(&l);
            async move {
                l.lock().await.push(format!("coder:{}", t));
                Ok(format!("code for {}", t))
            }
        })))
        .await
        .unwrap();

    let thinker = Arc::new(ScriptedThinker::new(vec![
        r#"{"action":"execute","tasks":[
            {"id":"r","task":"find info","agent":"researcher"},
            {"id":"c","task":"write code","agent":"coder"}
        ]}"#,
        r#"{"action":"finish","answer":"both are in"}"#,
    ]));
    let orchestrator = Orchestrator::new(thinker, registry);
    let run = orchestrator.run("build it", RunOptions::default(), None).await;

    assert_eq!(run.state, RunState::Done);
    assert!(run.steps[0].tasks.iter().all(|t| t.status == TaskState::Done));

    let mut entries = log.lock().await.clone();
    entries.sort();
    assert_eq!(entries, vec!["coder:write code", "researcher:find info"]);
}

#[tokio::test]
async fn test_max_steps_budget_forces_finish() {
    // 思考者永远 execute：2 步后进入强制 finish，仍然 execute → 应急合成
    let thinker = Arc::new(ScriptedThinker::new(vec![
        r#"{"action":"execute","tasks":[{"id":"a","task":"one"}]}"#,
        r#"{"action":"execute","tasks":[{"id":"b","task":"two"}]}"#,
        r#"{"action":"execute","tasks":[{"id":"c","task":"three"}]}"#,
    ]));
    let registry = Arc::new(AgentRegistry::new());
    registry
        .add(Arc::new(FunctionAdapter::new("echo", |t: String| async move { Ok(t) })))
        .await
        .unwrap();

    let options = RunOptions {
        max_steps: 2,
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(thinker, registry);
    let run = orchestrator.run("forever", options, None).await;

    assert_eq!(run.state, RunState::Done);
    assert_eq!(run.steps.len(), 2);
    let answer = run.final_answer.unwrap();
    assert!(answer.contains("## Task a"));
    assert!(answer.contains("## Task b"));
}

#[tokio::test]
async fn test_gateway_chat_round_trip() {
    let port = spawn_mock_gateway(|_, message: &str| {
        (format!("echo: {}", message), 5)
    })
    .await;
    let client = gateway_client(port);

    let reply = client.chat("hello gateway", "session-1", None).await.unwrap();
    assert_eq!(reply, "echo: hello gateway");
}

#[tokio::test]
async fn test_concurrent_chats_resolve_independently() {
    // 第一条 chat 延迟更久：后发的先回，关联只看 runId
    let port = spawn_mock_gateway(|index, message: &str| {
        let delay = if index == 0 { 120 } else { 5 };
        (format!("answer: {}", message), delay)
    })
    .await;
    let client = gateway_client(port);
    client.connect().await.unwrap();

    let (a, b) = tokio::join!(
        client.chat("first", "session-a", None),
        client.chat("second", "session-b", None),
    );
    assert_eq!(a.unwrap(), "answer: first");
    assert_eq!(b.unwrap(), "answer: second");
}

#[tokio::test]
async fn test_gateway_thinker_drives_run_to_completion() {
    // 网关侧模型直接给 finish 指令
    let port = spawn_mock_gateway(|_, _| {
        (r#"{"action":"finish","answer":"gateway says done"}"#.to_string(), 5)
    })
    .await;
    let client = gateway_client(port);

    let thinker = Arc::new(hive::thinker::GatewayThinker::new(client));
    let orchestrator = Orchestrator::new(thinker, Arc::new(AgentRegistry::new()));
    let run = orchestrator.run("goal", RunOptions::default(), None).await;

    assert_eq!(run.state, RunState::Done);
    assert_eq!(run.final_answer.as_deref(), Some("gateway says done"));
}

#[tokio::test]
async fn test_dashboard_end_to_end() {
    use hive::dashboard::{self, DashboardState};
    use hive::gateway::GatewayRegistry;
    use hive::run::MemoryRunStore;

    let gw_port = spawn_mock_gateway(|_, _| {
        (r#"{"action":"finish","answer":"served"}"#.to_string(), 5)
    })
    .await;

    let gateways = Arc::new(GatewayRegistry::new());
    gateways.add(gateway_client(gw_port)).await.unwrap();

    let state = DashboardState::new(
        Arc::new(AgentRegistry::new()),
        gateways,
        Arc::new(MemoryRunStore::new()),
        RunOptions::default(),
        50,
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = dashboard::router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let base = format!("http://127.0.0.1:{}", port);
    let http = reqwest::Client::new();

    // 先挂 SSE 订阅
    let sse = http
        .get(format!("{}/api/events", base))
        .send()
        .await
        .unwrap();
    assert_eq!(sse.headers()["content-type"], "text/event-stream");
    let mut sse_stream = sse.bytes_stream();

    // 提交目标
    let created = http
        .post(format!("{}/api/runs", base))
        .json(&serde_json::json!({ "goal": "ship it" }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let created: serde_json::Value = created.json().await.unwrap();
    let run_id = created["runId"].as_str().unwrap().to_string();
    assert_eq!(created["goal"], "ship it");

    // 空目标 → 400
    let bad = http
        .post(format!("{}/api/runs", base))
        .json(&serde_json::json!({ "goal": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);

    // 轮询直到终态
    let mut run = serde_json::Value::Null;
    for _ in 0..100 {
        let resp = http
            .get(format!("{}/api/runs/{}", base, run_id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");
        run = resp.json().await.unwrap();
        if run["state"] == "done" || run["state"] == "error" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(run["state"], "done");
    assert_eq!(run["finalAnswer"], "served");

    // SSE 至少观察到 run:started 与 run:complete
    let mut seen = String::new();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(std::time::Duration::from_millis(200), sse_stream.next()).await
        {
            Ok(Some(Ok(bytes))) => seen.push_str(&String::from_utf8_lossy(&bytes)),
            _ => {}
        }
        if seen.contains("run:started") && seen.contains("run:complete") {
            break;
        }
    }
    assert!(seen.contains("run:started"));
    assert!(seen.contains("run:complete"));
    assert!(seen.contains(&run_id));

    // 未知 Run → 404
    let missing = http
        .get(format!("{}/api/runs/nope", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    // 删除
    let deleted = http
        .delete(format!("{}/api/runs/{}", base, run_id))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);
    let deleted: serde_json::Value = deleted.json().await.unwrap();
    assert_eq!(deleted["deleted"], true);

    let gone = http
        .delete(format!("{}/api/runs/{}", base, run_id))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);

    // 健康面
    let health: serde_json::Value = http
        .get(format!("{}/api/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["ok"], true);
    assert_eq!(health["gateways"][0], "mock");
}

#[tokio::test]
async fn test_serve_without_gateways_errors_run() {
    use hive::dashboard::DashboardState;
    use hive::gateway::GatewayRegistry;
    use hive::run::MemoryRunStore;

    let state = DashboardState::new(
        Arc::new(AgentRegistry::new()),
        Arc::new(GatewayRegistry::new()),
        Arc::new(MemoryRunStore::new()),
        RunOptions::default(),
        50,
    );

    let run_id = Arc::clone(&state)
        .submit_goal("doomed".to_string(), RunOptions::default())
        .await;

    let mut error = String::new();
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        if let Some(run) = state.get_run(&run_id).await {
            if run.state == RunState::Error {
                error = run.error.unwrap_or_default();
                break;
            }
        }
    }
    assert!(error.contains("No gateways configured"));
}
