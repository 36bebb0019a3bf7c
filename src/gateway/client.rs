//! 网关客户端：登录、签名握手、请求/响应与聊天流关联
//!
//! 每个配置的网关 URL 对应一个客户端，所有连接共用持久化设备身份。
//! 连接序列：HTTP 登录（尽力而为）→ 带 Origin/Cookie 打开 WebSocket →
//! 等待 connect.challenge（≤800ms，收到则用 v2 签名，否则回退 v1）→
//! 发送 connect 帧 → 等待 hello。请求按 id 关联，聊天流按 runId 关联；
//! 套接字关闭时两张待定表各自恰好拒绝一次。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::core::HiveError;
use crate::gateway::identity::DeviceIdentity;
use crate::gateway::protocol::{
    ChallengePayload, ClientMeta, ConnectAuth, ConnectParams, DeviceProof, GatewayFrame,
    HelloPayload, RequestFrame, CLIENT_ID, CLIENT_MODE, PROTOCOL_VERSION, ROLE_OPERATOR,
};
use crate::gateway::soul::{parse_soul, SoulProfile};

/// 整体连接超时
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// connect.challenge 等待窗口
const CHALLENGE_WAIT: Duration = Duration::from_millis(800);
/// 单请求默认超时（毫秒）
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
/// 聊天默认超时（毫秒）
pub const DEFAULT_CHAT_TIMEOUT_MS: u64 = 120_000;

/// 连接申请的 scope
const SCOPES: &[&str] = &["operator.admin"];

/// 单个网关的配置；与 GatewayClient 一一对应
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub name: String,
    /// ws:// 或 wss:// 地址
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// 发现的网关侧智能体
#[derive(Debug, Clone)]
pub struct DiscoveredAgent {
    pub id: String,
    pub name: String,
    pub soul: Option<SoulProfile>,
}

type PendingSender = oneshot::Sender<Result<serde_json::Value, HiveError>>;
type PendingTable = Arc<Mutex<HashMap<String, PendingSender>>>;

/// 网关客户端
#[derive(Debug)]
pub struct GatewayClient {
    config: GatewayConfig,
    identity: Arc<DeviceIdentity>,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    /// 并发 connect 合并为一次在途握手
    connect_gate: Mutex<()>,
    out_tx: RwLock<Option<mpsc::UnboundedSender<WsMessage>>>,
    hello: RwLock<Option<HelloPayload>>,
    pending: PendingTable,
    pending_chats: PendingTable,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig, identity: Arc<DeviceIdentity>) -> Self {
        Self {
            config,
            identity,
            next_id: AtomicU64::new(1),
            connected: Arc::new(AtomicBool::new(false)),
            connect_gate: Mutex::new(()),
            out_tx: RwLock::new(None),
            hello: RwLock::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            pending_chats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// 握手成功后网关返回的 hello 载荷
    pub async fn hello(&self) -> Option<HelloPayload> {
        self.hello.read().await.clone()
    }

    /// 建立连接；已连接时立即返回，并发调用合并
    pub async fn connect(&self) -> Result<(), HiveError> {
        let _gate = self.connect_gate.lock().await;
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        tokio::time::timeout(CONNECT_TIMEOUT, self.connect_inner())
            .await
            .map_err(|_| {
                HiveError::Timeout(format!("connect to {} timed out", self.config.url))
            })?
    }

    async fn connect_inner(&self) -> Result<(), HiveError> {
        let origin = http_origin(&self.config.url);

        // 1. HTTP 登录，失败不致命
        let cookie = self.login_http(origin.as_deref()).await;

        // 2. 打开 WebSocket
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| HiveError::Gateway(format!("bad gateway url: {}", e)))?;
        if let Some(origin) = &origin {
            if let Ok(value) = origin.parse() {
                request.headers_mut().insert(header::ORIGIN, value);
            }
        }
        if let Some(cookie) = &cookie {
            if let Ok(value) = cookie.parse() {
                request.headers_mut().insert(header::COOKIE, value);
            }
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| HiveError::Gateway(format!("websocket connect failed: {}", e)))?;
        let (mut write, mut read) = ws.split();

        // 3. challenge 窗口：收到则 v2，否则回退 v1
        let nonce = wait_for_challenge(&mut read).await?;

        // 4-5. 组装签名并发送 connect 帧
        let signed_at = chrono::Utc::now().timestamp_millis() as u64;
        let token = self.config.token.clone().unwrap_or_default();
        let input = signature_input(
            self.identity.device_id(),
            &token,
            signed_at,
            nonce.as_deref(),
        );
        let params = ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientMeta::default(),
            role: ROLE_OPERATOR.to_string(),
            scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
            caps: Vec::new(),
            auth: Some(ConnectAuth {
                token: self.config.token.clone(),
            }),
            device: DeviceProof {
                id: self.identity.device_id().to_string(),
                public_key: self.identity.public_key_base64url(),
                signature: self.identity.sign_base64url(&input),
                signed_at,
                nonce: nonce.clone(),
            },
        };

        let connect_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let frame = RequestFrame::new(
            &connect_id,
            "connect",
            Some(serde_json::to_value(&params).map_err(|e| HiveError::Gateway(e.to_string()))?),
        );
        let json = serde_json::to_string(&frame).map_err(|e| HiveError::Gateway(e.to_string()))?;
        write
            .send(WsMessage::Text(json))
            .await
            .map_err(|e| HiveError::Gateway(format!("send connect failed: {}", e)))?;

        // 6. 等待匹配的响应帧
        let hello = loop {
            match read.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<GatewayFrame>(&text) {
                        Ok(GatewayFrame::Response { id, ok, payload, error }) if id == connect_id => {
                            if !ok {
                                let e = error.map(|e| HiveError::gateway_frame(&e.code, &e.message));
                                return Err(e.unwrap_or_else(|| {
                                    HiveError::Gateway("connect rejected".to_string())
                                }));
                            }
                            break payload
                                .and_then(|p| serde_json::from_value::<HelloPayload>(p).ok())
                                .unwrap_or_else(|| HelloPayload {
                                    server: serde_json::Value::Null,
                                    methods: Vec::new(),
                                    events: Vec::new(),
                                    policy: serde_json::Value::Null,
                                });
                        }
                        _ => continue,
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(1005);
                    return Err(HiveError::Gateway(format!(
                        "Connection closed during connect (code={})",
                        code
                    )));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(HiveError::Gateway(e.to_string())),
                None => {
                    return Err(HiveError::Gateway(
                        "Connection closed during connect".to_string(),
                    ))
                }
            }
        };

        *self.hello.write().await = Some(hello);

        // 出站泵：所有写都经过单一 send 路径
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });
        *self.out_tx.write().await = Some(out_tx);
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            gateway = %self.config.name,
            protocol = if nonce.is_some() { "v2" } else { "v1" },
            "Gateway connected"
        );

        // 入站泵：分发 res / chat 事件，关闭时拒绝全部待定项
        let pending = Arc::clone(&self.pending);
        let pending_chats = Arc::clone(&self.pending_chats);
        let connected = Arc::clone(&self.connected);
        let gateway_name = self.config.name.clone();
        tokio::spawn(async move {
            let close_code = loop {
                match read.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        dispatch_frame(&text, &pending, &pending_chats).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame.map(|f| u16::from(f.code)).unwrap_or(1005);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(gateway = %gateway_name, "WebSocket receive error: {}", e);
                        break 1006;
                    }
                    None => break 1006,
                }
            };
            connected.store(false, Ordering::SeqCst);
            reject_all(&pending, &pending_chats, close_code).await;
            tracing::info!(gateway = %gateway_name, code = close_code, "Gateway disconnected");
        });

        Ok(())
    }

    /// HTTP 登录：POST `${origin}/login`，抽取 connect.sid cookie
    async fn login_http(&self, origin: Option<&str>) -> Option<String> {
        let origin = origin?;
        let token = self.config.token.clone().unwrap_or_default();
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/login", origin))
            .form(&[("token", token.as_str())])
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .ok()?;

        for value in response.headers().get_all(reqwest::header::SET_COOKIE) {
            let raw = value.to_str().ok()?;
            if raw.starts_with("connect.sid=") {
                let cookie = raw.split(';').next().unwrap_or(raw);
                return Some(cookie.to_string());
            }
        }
        None
    }

    async fn send_text(&self, text: String) -> Result<(), HiveError> {
        let out = self.out_tx.read().await;
        match out.as_ref() {
            Some(tx) => tx
                .send(WsMessage::Text(text))
                .map_err(|_| HiveError::Gateway("Connection closed".to_string())),
            None => Err(HiveError::Gateway("Not connected".to_string())),
        }
    }

    /// RPC 调用：分配 id、注册待定项、发送请求帧并等待响应
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout_ms: Option<u64>,
    ) -> Result<serde_json::Value, HiveError> {
        self.connect().await?;
        crate::observability::Metrics::global()
            .gateway_calls
            .fetch_add(1, Ordering::Relaxed);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let frame = RequestFrame::new(&id, method, params);
        let json = serde_json::to_string(&frame).map_err(|e| HiveError::Gateway(e.to_string()))?;
        if let Err(e) = self.send_text(json).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_CALL_TIMEOUT_MS));
        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HiveError::Gateway("request dropped".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(HiveError::Timeout(format!(
                    "{} timed out after {}ms",
                    method,
                    timeout.as_millis()
                )))
            }
        };
        if outcome.is_err() {
            crate::observability::Metrics::global()
                .gateway_errors
                .fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// 聊天：chat.send 拿 runId，按 runId 等待 final 事件；多路并发安全。
    /// agent_id 仅被接受而不会上线（网关按 sessionKey 路由）。
    pub async fn chat(
        &self,
        message: &str,
        session_key: &str,
        agent_id: Option<&str>,
    ) -> Result<String, HiveError> {
        let _ = agent_id;
        self.connect().await?;

        let params = serde_json::json!({
            "message": message,
            "sessionKey": session_key,
            "idempotencyKey": uuid::Uuid::new_v4().to_string(),
            "deliver": false,
        });
        let payload = self.call("chat.send", Some(params), None).await?;
        let run_id = payload
            .get("runId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HiveError::Gateway("chat.send returned no runId".to_string()))?
            .to_string();

        let (tx, rx) = oneshot::channel();
        self.pending_chats.lock().await.insert(run_id.clone(), tx);

        let timeout = Duration::from_millis(DEFAULT_CHAT_TIMEOUT_MS);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(payload))) => Ok(extract_final_text(&payload)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(HiveError::Gateway("chat dropped".to_string())),
            Err(_) => {
                self.pending_chats.lock().await.remove(&run_id);
                Err(HiveError::Timeout(format!(
                    "chat {} timed out after {}ms",
                    run_id,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// 网关侧可用模型
    pub async fn list_models(&self) -> Result<serde_json::Value, HiveError> {
        self.call("models.list", None, None).await
    }

    /// 网关侧活跃会话
    pub async fn list_sessions(&self) -> Result<serde_json::Value, HiveError> {
        self.call("sessions.list", None, None).await
    }

    /// 智能体发现：agents.list + 逐个尽力拉取 SOUL.md
    pub async fn list_agents(&self) -> Result<Vec<DiscoveredAgent>, HiveError> {
        let payload = self.call("agents.list", None, None).await?;
        let items = payload
            .get("agents")
            .and_then(|v| v.as_array())
            .cloned()
            .or_else(|| payload.as_array().cloned())
            .ok_or_else(|| {
                HiveError::Gateway("agents.list returned unexpected shape".to_string())
            })?;

        let mut agents = Vec::with_capacity(items.len());
        for item in items {
            let id = item
                .get("id")
                .and_then(|v| v.as_str())
                .or_else(|| item.get("name").and_then(|v| v.as_str()))
                .unwrap_or_default()
                .to_string();
            if id.is_empty() {
                continue;
            }
            let name = item
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or(&id)
                .to_string();

            // 单个智能体的发现失败只降级为 {id, name}
            let soul = match self
                .call(
                    "agents.files.get",
                    Some(serde_json::json!({ "agentId": id, "name": "SOUL.md" })),
                    None,
                )
                .await
            {
                Ok(p) => p
                    .get("content")
                    .and_then(|v| v.as_str())
                    .or_else(|| {
                        p.get("file")
                            .and_then(|f| f.get("content"))
                            .and_then(|v| v.as_str())
                    })
                    .map(parse_soul),
                Err(e) => {
                    tracing::debug!(agent = %id, "SOUL.md fetch failed: {}", e);
                    None
                }
            };

            agents.push(DiscoveredAgent { id, name, soul });
        }
        Ok(agents)
    }
}

/// 组装签名输入：固定顺序的竖线拼接；有 nonce 时为 v2
pub fn signature_input(
    device_id: &str,
    token: &str,
    signed_at: u64,
    nonce: Option<&str>,
) -> String {
    let version = if nonce.is_some() { "v2" } else { "v1" };
    let mut fields = vec![
        version.to_string(),
        device_id.to_string(),
        CLIENT_ID.to_string(),
        CLIENT_MODE.to_string(),
        ROLE_OPERATOR.to_string(),
        SCOPES.join(","),
        signed_at.to_string(),
        token.to_string(),
    ];
    if let Some(nonce) = nonce {
        fields.push(nonce.to_string());
    }
    fields.join("|")
}

/// ws[s]:// → http[s]://，取 authority 作为 Origin
fn http_origin(url: &str) -> Option<String> {
    let (scheme, rest) = if let Some(rest) = url.strip_prefix("wss://") {
        ("https", rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        ("http", rest)
    } else {
        return None;
    };
    let authority = rest.split('/').next()?;
    if authority.is_empty() {
        return None;
    }
    Some(format!("{}://{}", scheme, authority))
}

type WsReadHalf = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

async fn wait_for_challenge(read: &mut WsReadHalf) -> Result<Option<String>, HiveError> {
    let deadline = tokio::time::Instant::now() + CHALLENGE_WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        match tokio::time::timeout(remaining, read.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                if let Ok(GatewayFrame::Event { event, payload, .. }) =
                    serde_json::from_str::<GatewayFrame>(&text)
                {
                    if event == "connect.challenge" {
                        let nonce = payload
                            .and_then(|p| serde_json::from_value::<ChallengePayload>(p).ok())
                            .map(|c| c.nonce);
                        return Ok(nonce);
                    }
                }
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => return Err(HiveError::Gateway(e.to_string())),
            Ok(None) => {
                return Err(HiveError::Gateway(
                    "Connection closed during connect".to_string(),
                ))
            }
            Err(_) => return Ok(None),
        }
    }
}

/// 分发入站帧：res → pending(id)，chat 事件 → pending_chats(runId)
async fn dispatch_frame(text: &str, pending: &PendingTable, pending_chats: &PendingTable) {
    let frame = match serde_json::from_str::<GatewayFrame>(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!("Unparseable gateway frame: {}", e);
            return;
        }
    };

    match frame {
        GatewayFrame::Response { id, ok, payload, error } => {
            if let Some(tx) = pending.lock().await.remove(&id) {
                let result = if ok {
                    Ok(payload.unwrap_or(serde_json::Value::Null))
                } else {
                    Err(error
                        .map(|e| HiveError::gateway_frame(&e.code, &e.message))
                        .unwrap_or_else(|| HiveError::Gateway("unknown error".to_string())))
                };
                let _ = tx.send(result);
            }
        }
        GatewayFrame::Event { event, payload, .. } if event == "chat" => {
            let Some(payload) = payload else { return };
            let Some(run_id) = payload.get("runId").and_then(|v| v.as_str()) else {
                return;
            };
            match payload.get("state").and_then(|v| v.as_str()) {
                Some("final") => {
                    if let Some(tx) = pending_chats.lock().await.remove(run_id) {
                        let _ = tx.send(Ok(payload.clone()));
                    }
                }
                Some("error") => {
                    if let Some(tx) = pending_chats.lock().await.remove(run_id) {
                        let message = payload
                            .get("error")
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "chat failed".to_string());
                        let _ = tx.send(Err(HiveError::Gateway(message)));
                    }
                }
                // 其余状态为流式进度，忽略
                _ => {}
            }
        }
        _ => {}
    }
}

/// 套接字关闭：两张表的每个待定项恰好拒绝一次并移除
async fn reject_all(pending: &PendingTable, pending_chats: &PendingTable, code: u16) {
    let message = format!("Connection closed (code={})", code);
    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(HiveError::Gateway(message.clone())));
    }
    for (_, tx) in pending_chats.lock().await.drain() {
        let _ = tx.send(Err(HiveError::Gateway(message.clone())));
    }
}

/// final 事件取 message.content[*].text 拼接；形状不符时退回 message 的 JSON
fn extract_final_text(payload: &serde_json::Value) -> String {
    let message = payload.get("message").cloned().unwrap_or_default();
    let texts: Vec<String> = message
        .get("content")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    if texts.is_empty() {
        serde_json::to_string(&message).unwrap_or_default()
    } else {
        texts.concat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_input_field_order_v1() {
        let input = signature_input("dev-1", "tok", 1_700_000_000_000, None);
        assert_eq!(
            input,
            "v1|dev-1|openclaw-control-ui|webchat|operator|operator.admin|1700000000000|tok"
        );
    }

    #[test]
    fn test_signature_input_v2_appends_nonce() {
        let input = signature_input("dev-1", "tok", 42, Some("n-9"));
        assert!(input.starts_with("v2|dev-1|"));
        assert!(input.ends_with("|42|tok|n-9"));
    }

    #[test]
    fn test_http_origin_rewrites_scheme() {
        assert_eq!(
            http_origin("ws://127.0.0.1:9100/ws").as_deref(),
            Some("http://127.0.0.1:9100")
        );
        assert_eq!(
            http_origin("wss://gw.example.com/path/x").as_deref(),
            Some("https://gw.example.com")
        );
        assert!(http_origin("http://nope").is_none());
    }

    #[test]
    fn test_extract_final_text_concatenates() {
        let payload = serde_json::json!({
            "runId": "r",
            "state": "final",
            "message": { "content": [ {"type":"text","text":"Hello "}, {"type":"text","text":"world"} ] }
        });
        assert_eq!(extract_final_text(&payload), "Hello world");
    }

    #[test]
    fn test_extract_final_text_falls_back_to_json() {
        let payload = serde_json::json!({
            "runId": "r",
            "state": "final",
            "message": { "role": "assistant" }
        });
        assert_eq!(extract_final_text(&payload), r#"{"role":"assistant"}"#);
    }

    #[tokio::test]
    async fn test_reject_all_drains_both_tables() {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let pending_chats: PendingTable = Arc::new(Mutex::new(HashMap::new()));

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.lock().await.insert("1".into(), tx1);
        pending_chats.lock().await.insert("run-1".into(), tx2);

        reject_all(&pending, &pending_chats, 1006).await;

        assert!(pending.lock().await.is_empty());
        assert!(pending_chats.lock().await.is_empty());
        let err = rx1.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("Connection closed (code=1006)"));
        let err = rx2.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("code=1006"));
    }

    #[tokio::test]
    async fn test_dispatch_chat_final_resolves_by_run_id() {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let pending_chats: PendingTable = Arc::new(Mutex::new(HashMap::new()));

        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        pending_chats.lock().await.insert("run-a".into(), tx_a);
        pending_chats.lock().await.insert("run-b".into(), tx_b);

        // 流式进度被忽略
        let progress = r#"{"type":"event","event":"chat","payload":{"runId":"run-a","state":"delta"}}"#;
        dispatch_frame(progress, &pending, &pending_chats).await;
        assert_eq!(pending_chats.lock().await.len(), 2);

        // run-b 先完成，不影响 run-a
        let final_b = r#"{"type":"event","event":"chat","payload":{"runId":"run-b","state":"final","message":{"content":[{"text":"answer b"}]}}}"#;
        dispatch_frame(final_b, &pending, &pending_chats).await;
        let payload = rx_b.await.unwrap().unwrap();
        assert_eq!(extract_final_text(&payload), "answer b");
        assert_eq!(pending_chats.lock().await.len(), 1);

        let final_a = r#"{"type":"event","event":"chat","payload":{"runId":"run-a","state":"final","message":{"content":[{"text":"answer a"}]}}}"#;
        dispatch_frame(final_a, &pending, &pending_chats).await;
        let payload = rx_a.await.unwrap().unwrap();
        assert_eq!(extract_final_text(&payload), "answer a");
    }

    #[tokio::test]
    async fn test_dispatch_response_resolves_pending_once() {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let pending_chats: PendingTable = Arc::new(Mutex::new(HashMap::new()));

        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("5".into(), tx);

        let res = r#"{"type":"res","id":"5","ok":false,"error":{"code":"UNAVAILABLE","message":"down"}}"#;
        dispatch_frame(res, &pending, &pending_chats).await;
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("UNAVAILABLE: down"));
        assert!(pending.lock().await.is_empty());

        // 同 id 再次到达时无待定项，不应 panic
        dispatch_frame(res, &pending, &pending_chats).await;
    }
}
