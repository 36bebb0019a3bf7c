//! 网关线协议定义
//!
//! 协议版本固定为 3，全部为 WebSocket 上的 JSON 帧：
//! - `RequestFrame`：客户端 → 网关 RPC 调用
//! - `ResponseFrame`：网关 → 客户端 RPC 结果
//! - `EventFrame`：网关 → 客户端推送

use serde::{Deserialize, Serialize};

/// 协商的协议版本（minProtocol = maxProtocol = 3）
pub const PROTOCOL_VERSION: u32 = 3;

/// 握手签名里的客户端标识
pub const CLIENT_ID: &str = "openclaw-control-ui";
/// 客户端模式
pub const CLIENT_MODE: &str = "webchat";
/// 连接角色
pub const ROLE_OPERATOR: &str = "operator";

/// 网关错误帧内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// 客户端 → 网关 RPC 请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub r#type: String, // 恒为 "req"
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            r#type: "req".into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// 按 `type` 区分的入站帧
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    #[serde(rename = "req")]
    Request {
        id: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },
    #[serde(rename = "res")]
    Response {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

/// connect 请求中的客户端信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMeta {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

impl Default for ClientMeta {
    fn default() -> Self {
        Self {
            id: CLIENT_ID.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: CLIENT_MODE.to_string(),
        }
    }
}

/// 设备证明：公钥 + 对握手签名输入的 Ed25519 签名
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProof {
    pub id: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub signature: String,
    #[serde(rename = "signedAt")]
    pub signed_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// connect 请求的 auth 段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// connect 请求参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    pub client: ClientMeta,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    pub device: DeviceProof,
}

/// 握手成功后网关返回的 hello 载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    #[serde(default)]
    pub server: serde_json::Value,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub policy: serde_json::Value,
}

/// connect.challenge 事件载荷
#[derive(Debug, Clone, Deserialize)]
pub struct ChallengePayload {
    pub nonce: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_shape() {
        let frame = RequestFrame::new("1", "chat.send", Some(serde_json::json!({"message": "hi"})));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "req");
        assert_eq!(json["method"], "chat.send");
    }

    #[test]
    fn test_response_frame_round_trip() {
        let raw = r#"{"type":"res","id":"7","ok":true,"payload":{"runId":"r-1"}}"#;
        match serde_json::from_str::<GatewayFrame>(raw).unwrap() {
            GatewayFrame::Response { id, ok, payload, error } => {
                assert_eq!(id, "7");
                assert!(ok);
                assert_eq!(payload.unwrap()["runId"], "r-1");
                assert!(error.is_none());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_event_frame_round_trip() {
        let raw = r#"{"type":"event","event":"chat","payload":{"runId":"r","state":"final"},"seq":3}"#;
        match serde_json::from_str::<GatewayFrame>(raw).unwrap() {
            GatewayFrame::Event { event, payload, seq } => {
                assert_eq!(event, "chat");
                assert_eq!(seq, Some(3));
                assert_eq!(payload.unwrap()["state"], "final");
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_error_shape_optional_fields_omitted() {
        let err = ErrorShape {
            code: "TIMEOUT".into(),
            message: "too slow".into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        };
        let json = serde_json::to_value(&err).unwrap();
        assert!(!json.as_object().unwrap().contains_key("retryAfterMs"));
    }

    #[test]
    fn test_connect_params_wire_names() {
        let params = ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientMeta::default(),
            role: ROLE_OPERATOR.into(),
            scopes: vec!["operator.read".into()],
            caps: vec![],
            auth: Some(ConnectAuth { token: Some("t".into()) }),
            device: DeviceProof {
                id: "dev".into(),
                public_key: "pk".into(),
                signature: "sig".into(),
                signed_at: 1,
                nonce: None,
            },
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["minProtocol"], 3);
        assert_eq!(json["device"]["publicKey"], "pk");
        assert_eq!(json["device"]["signedAt"], 1);
        assert!(!json["device"].as_object().unwrap().contains_key("nonce"));
        assert_eq!(json["client"]["id"], CLIENT_ID);
    }
}
