//! 内存中的链路传输，供测试和无蓝牙环境使用
//!
//! 默认只记录调用，事件由测试通过 [`MockTransport::inject`] 注入。
//! [`MockTransport::with_peer`] 创建的实例会模拟一个始终在线的对端：
//! 扫描立即命中、连接立即成功、绑定立即完成。

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    BondState, LinkTransport, PeerAddress, ScanFailure, ScanMode, TransportError, TransportEvent,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartScan(Uuid, ScanMode),
    StopScan,
    Connect(PeerAddress),
    Disconnect(PeerAddress),
    CreateBond(PeerAddress),
    Write {
        peer: PeerAddress,
        characteristic: Uuid,
        payload: Vec<u8>,
    },
}

pub struct MockTransport {
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    calls: Mutex<Vec<TransportCall>>,
    bond_state: Mutex<BondState>,
    scan_failure: Mutex<Option<ScanFailure>>,
    auto_peer: Option<PeerAddress>,
    fail_writes: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// 模拟始终在线的对端
    pub fn with_peer(peer: PeerAddress) -> Self {
        Self::build(Some(peer))
    }

    fn build(auto_peer: Option<PeerAddress>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            calls: Mutex::new(Vec::new()),
            bond_state: Mutex::new(BondState::NotBonded),
            scan_failure: Mutex::new(None),
            auto_peer,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// 注入一个平台事件
    pub fn inject(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
    }

    pub fn count(&self, pred: impl Fn(&TransportCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    /// 写到某个特征的全部数据
    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::Write {
                    characteristic: ch,
                    payload,
                    ..
                } if ch == characteristic => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn set_bond_state(&self, state: BondState) {
        *self.bond_state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = state;
    }

    /// 下一次 `start_scan` 以指定错误失败
    pub fn fail_next_scan(&self, failure: ScanFailure) {
        *self.scan_failure.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(failure);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(call);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkTransport for MockTransport {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take()
    }

    async fn start_scan(&self, service: Uuid, mode: ScanMode) -> Result<(), ScanFailure> {
        self.record(TransportCall::StartScan(service, mode));
        if let Some(failure) = self
            .scan_failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            return Err(failure);
        }
        if let Some(peer) = &self.auto_peer {
            self.inject(TransportEvent::ScanMatched(peer.clone()));
        }
        Ok(())
    }

    async fn stop_scan(&self) {
        self.record(TransportCall::StopScan);
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<(), TransportError> {
        self.record(TransportCall::Connect(peer.clone()));
        if self.auto_peer.is_some() {
            self.inject(TransportEvent::Connected(peer.clone()));
        }
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect(peer.clone()));
        if self.auto_peer.is_some() {
            self.inject(TransportEvent::Disconnected(peer.clone()));
        }
        Ok(())
    }

    async fn bond_state(&self, _peer: &PeerAddress) -> BondState {
        *self.bond_state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn create_bond(&self, peer: &PeerAddress) -> Result<(), TransportError> {
        self.record(TransportCall::CreateBond(peer.clone()));
        if self.auto_peer.is_some() {
            self.set_bond_state(BondState::Bonded);
            self.inject(TransportEvent::BondStateChanged {
                peer: peer.clone(),
                state: BondState::Bonded,
            });
        }
        Ok(())
    }

    async fn write(
        &self,
        peer: &PeerAddress,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected(peer.clone()));
        }
        self.record(TransportCall::Write {
            peer: peer.clone(),
            characteristic,
            payload: payload.to_vec(),
        });
        Ok(())
    }
}
