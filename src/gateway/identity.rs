//! 设备身份：每次安装持久化一份 Ed25519 密钥对
//!
//! deviceId 为公钥 sha-256 的十六进制；文件 JSON 格式
//! {deviceId, publicKeyBase64, privateKeyPem}，权限仅属主可读写。
//! 所有网关连接复用同一身份；已存在的合法身份文件直接加载。

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::HiveError;

/// 身份文件的持久化格式
#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "publicKeyBase64")]
    public_key_base64: String,
    #[serde(rename = "privateKeyPem")]
    private_key_pem: String,
}

/// 设备身份
#[derive(Debug)]
pub struct DeviceIdentity {
    device_id: String,
    signing_key: SigningKey,
}

impl DeviceIdentity {
    /// 默认身份文件位置：`<用户配置目录>/hive/device.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hive")
            .join("device.json")
    }

    /// 加载或创建身份；并发进程须容忍已存在的合法身份
    pub fn load_or_create(path: &Path) -> Result<Self, HiveError> {
        if path.exists() {
            return Self::load(path);
        }

        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        let identity = Self {
            device_id: device_id_of(&signing_key),
            signing_key,
        };
        identity.save(path)?;
        tracing::info!("Created device identity {} at {:?}", identity.device_id, path);
        Ok(identity)
    }

    fn load(path: &Path) -> Result<Self, HiveError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| HiveError::Config(format!("read identity file: {}", e)))?;
        let file: IdentityFile = serde_json::from_str(&raw)
            .map_err(|e| HiveError::Config(format!("parse identity file: {}", e)))?;
        let signing_key = SigningKey::from_pkcs8_pem(&file.private_key_pem)
            .map_err(|e| HiveError::Config(format!("parse identity key: {}", e)))?;

        Ok(Self {
            device_id: device_id_of(&signing_key),
            signing_key,
        })
    }

    fn save(&self, path: &Path) -> Result<(), HiveError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HiveError::Config(format!("create identity dir: {}", e)))?;
        }

        let pem = self
            .signing_key
            .to_pkcs8_pem(ed25519_dalek::pkcs8::spki::der::pem::LineEnding::LF)
            .map_err(|e| HiveError::Config(format!("encode identity key: {}", e)))?;
        let file = IdentityFile {
            device_id: self.device_id.clone(),
            public_key_base64: STANDARD.encode(self.signing_key.verifying_key().to_bytes()),
            private_key_pem: pem.to_string(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| HiveError::Config(format!("encode identity file: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| HiveError::Config(format!("write identity file: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)
                .map_err(|e| HiveError::Config(format!("chmod identity file: {}", e)))?;
        }

        Ok(())
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// 握手 device 段使用的 base64url 公钥
    pub fn public_key_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// 对握手签名输入做 Ed25519 签名，返回 base64url
    pub fn sign_base64url(&self, payload: &str) -> String {
        let signature = self.signing_key.sign(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    }

    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.signing_key.verifying_key()
    }
}

fn device_id_of(signing_key: &SigningKey) -> String {
    let digest = Sha256::digest(signing_key.verifying_key().to_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
