//! 发现与链路管理
//!
//! # 状态机
//!
//! ```text
//! Disconnected ──bonded──▶ Idle ──enableHotspot──▶ Connecting ──hotspotJoined──▶ Connected
//!       ▲                   ▲  ◀──tethering failed──┘                               │
//!       │                   └───────────────────────hotspotLeft─────────────────────┘
//!       └── link lost / unpair / bonding failed (任意状态)
//! ```
//!
//! - `Idle`: 已绑定，对端尚未使用热点
//! - `Connecting`: 已派发开启热点，等待对端加入
//! - `Connected`: 对端正在使用热点
//!
//! # 重试
//!
//! 连接或断开请求失败时立即重发同一请求，最多 [`MAX_CONNECT_RETRIES`] 次，
//! 超过后上报 [`LinkError::ConnectFailed`]。
//!
//! [`MAX_CONNECT_RETRIES`]: crate::config::MAX_CONNECT_RETRIES

pub mod manager;

#[cfg(test)]
mod tests;

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ble::{BondState, PeerAddress, ScanFailure};
use crate::crypto::CipherError;
use crate::store::PersistedRecord;

pub use manager::LinkManager;

static UUID_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .unwrap()
});

/// 8-4-4-4-12 十六进制格式
pub fn validate_uuid_format(value: &str) -> bool {
    UUID_FORMAT.is_match(value)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairError {
    #[error("Invalid pairing data format")]
    InvalidFormat,

    #[error("No stored pairing credentials")]
    MissingCredentials,

    #[error("Pairing store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("{0}")]
    ScanFailed(ScanFailure),

    #[error("Connection failed after retries")]
    ConnectFailed,

    #[error("Bonding failed")]
    BondingFailed,

    /// 对端不可达，凭据已保存，连上后重发
    #[error("Hotspot credentials deferred until the peer is connected")]
    HotspotShareFailed,

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConnectStatus {
    #[default]
    Disconnected,
    Idle,
    Connecting,
    Connected,
}

impl ConnectStatus {
    /// 已绑定的链路是否在线
    pub fn is_linked(&self) -> bool {
        !matches!(self, ConnectStatus::Disconnected)
    }
}

/// 一次配对的会话参数
///
/// 派生密钥只保存在 [`CredentialCipher`](crate::crypto::CredentialCipher) 内部。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSession {
    pub service_uuid: Uuid,
    pub shared_secret: String,
}

impl PairingSession {
    pub fn new(service_uuid: &str, shared_secret: &str) -> Result<Self, PairError> {
        if !validate_uuid_format(service_uuid) || !validate_uuid_format(shared_secret) {
            return Err(PairError::InvalidFormat);
        }
        let service_uuid = Uuid::parse_str(service_uuid).map_err(|_| PairError::InvalidFormat)?;
        Ok(Self {
            service_uuid,
            shared_secret: shared_secret.to_string(),
        })
    }

    /// 从持久化记录恢复
    pub fn from_record(record: &PersistedRecord) -> Result<Self, PairError> {
        if !record.has_pairing() {
            return Err(PairError::MissingCredentials);
        }
        Self::new(&record.service_uuid, &record.shared_pin)
    }
}

/// 二维码内容
#[derive(Debug, Clone, Deserialize)]
pub struct QrPayload {
    #[serde(rename = "serviceUUID")]
    pub service_uuid: Option<String>,
    #[serde(rename = "sharedPIN")]
    pub shared_pin: Option<String>,
}

impl QrPayload {
    /// 解析二维码 JSON，任一字段缺失即 `InvalidFormat`
    pub fn parse(json: &str) -> Result<(String, String), PairError> {
        let payload: QrPayload = serde_json::from_str(json).map_err(|_| PairError::InvalidFormat)?;
        match (payload.service_uuid, payload.shared_pin) {
            (Some(uuid), Some(pin)) => Ok((uuid, pin)),
            _ => Err(PairError::InvalidFormat),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    Connect,
    Disconnect,
}

/// 与对端的连接，由链路管理器独占
#[derive(Debug, Clone)]
pub struct DeviceLink {
    pub peer: PeerAddress,
    pub bond_state: BondState,
    pub retry_count: u8,
    pub pending: Option<PendingOp>,
}

impl DeviceLink {
    fn new(peer: PeerAddress) -> Self {
        Self {
            peer,
            bond_state: BondState::NotBonded,
            retry_count: 0,
            pending: Some(PendingOp::Connect),
        }
    }
}

/// 链路管理器对外的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkReport {
    ScanStarted(Uuid),
    PeerMatched(PeerAddress),
    Bonded { peer: PeerAddress, first_connect: bool },
    LinkLost(PeerAddress),
    CredentialsSent,
    TetheringStarted,
    TetheringFailed,
    TetheringUnsupported,
    PhoneInfo { enabled: bool },
    Error(LinkError),
}
