//! 链路传输接口
//!
//! [`LinkTransport`] 把平台 BLE 栈（BlueZ 或测试替身）抽象成“发请求 + 收事件”：
//! `connect`/`disconnect`/`create_bond` 只负责派发，结果通过 [`TransportEvent`] 异步返回。
//! 链路管理器在单个任务里按顺序消费这些事件。

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::PeerAddress;

/// 扫描模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    NotBonded,
    Bonding,
    Bonded,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanFailure {
    #[error("Scan registration failed")]
    RegistrationFailed,

    #[error("Scan failed (code {0})")]
    Other(i32),
}

impl ScanFailure {
    pub const REGISTRATION_FAILED_CODE: i32 = 2;

    pub fn from_code(code: i32) -> Self {
        match code {
            Self::REGISTRATION_FAILED_CODE => ScanFailure::RegistrationFailed,
            other => ScanFailure::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Peer not connected: {0}")]
    NotConnected(PeerAddress),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Transport error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 扫描命中服务 UUID
    ScanMatched(PeerAddress),
    ScanFailed(ScanFailure),
    Connected(PeerAddress),
    /// 连接/断开请求失败（对应 GATT 层的非成功状态）
    OperationFailed { peer: PeerAddress, reason: String },
    Disconnected(PeerAddress),
    BondStateChanged { peer: PeerAddress, state: BondState },
    /// 对端通过某个特征推送的数据
    Message {
        peer: PeerAddress,
        characteristic: Uuid,
        payload: Vec<u8>,
    },
}

#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// 取走事件接收端，只能取一次
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// 按服务 UUID 精确过滤扫描，命中第一个后由调用方停止
    async fn start_scan(&self, service: Uuid, mode: ScanMode) -> Result<(), ScanFailure>;

    /// 停止扫描，可重复调用
    async fn stop_scan(&self);

    async fn connect(&self, peer: &PeerAddress) -> Result<(), TransportError>;

    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), TransportError>;

    async fn bond_state(&self, peer: &PeerAddress) -> BondState;

    async fn create_bond(&self, peer: &PeerAddress) -> Result<(), TransportError>;

    async fn write(
        &self,
        peer: &PeerAddress,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_failure_classification() {
        assert_eq!(ScanFailure::from_code(2), ScanFailure::RegistrationFailed);
        assert_eq!(ScanFailure::from_code(1), ScanFailure::Other(1));
        assert_eq!(ScanFailure::from_code(4), ScanFailure::Other(4));
    }
}
