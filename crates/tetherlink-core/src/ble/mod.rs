//! BLE 链路层
//!
//! 桌面端作为 GATT Server 广播配对时约定的服务 UUID（每次配对不同），
//! 服务下的特征 UUID 固定：
//!
//! | 特征 | 方向 | 内容 |
//! |------|------|------|
//! | [`CREDENTIALS_CHAR_UUID`] | 手机 → 桌面 (write) | 加密后的热点凭据 |
//! | [`TELEMETRY_CHAR_UUID`] | 手机 → 桌面 (write) | 信号/网络/电量报告 |
//! | [`COMMAND_CHAR_UUID`] | 桌面 → 手机 (notify) | [`PeerCommand`] |

#[cfg(feature = "bluez")]
pub mod bluez;
pub mod gatt;
pub mod mock;
pub mod transport;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use transport::{
    BondState, LinkTransport, ScanFailure, ScanMode, TransportError, TransportEvent,
};

pub const CREDENTIALS_CHAR_UUID: Uuid = Uuid::from_u128(0x0000b001_0000_1000_8000_00805f9b34fb);
pub const TELEMETRY_CHAR_UUID: Uuid = Uuid::from_u128(0x0000b002_0000_1000_8000_00805f9b34fb);
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x0000b003_0000_1000_8000_00805f9b34fb);

/// 对端蓝牙地址
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress(pub String);

impl PeerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 桌面端通过 COMMAND 特征下发的指令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerCommand {
    /// 请求开启热点
    EnableHotspot,
    DisableHotspot,
    /// 桌面端是否在显示手机信息（控制遥测开关）
    SeePhoneInfo { enabled: bool },
    /// 桌面端已加入热点
    HotspotJoined,
    /// 桌面端已离开热点
    HotspotLeft,
}

/// TELEMETRY 特征上的报告，未变化的通道为哨兵值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReport {
    pub signal_level: i32,
    pub network_type: String,
    pub battery_percent: i32,
}

/// CREDENTIALS 特征上的加密帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialFrame {
    pub ciphertext: String,
    pub iv: String,
}
