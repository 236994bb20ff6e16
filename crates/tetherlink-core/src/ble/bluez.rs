//! BlueZ 传输实现
//!
//! 通过 bluer (BlueZ D-Bus) 扫描、连接、绑定并读写桌面端的 GATT 服务。
//! 每个连接由一个后台任务监听属性变化，把结果转成 [`TransportEvent`]。
//!
//! # 扫描错误码
//!
//! | BlueZ 错误 | 码 |
//! |-----------|----|
//! | InProgress | 1 |
//! | NotReady | 2（注册失败） |
//! | NotSupported | 4 |
//! | 其他 | 3 |

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{AdapterEvent, DeviceEvent, DeviceProperty, DiscoveryFilter, DiscoveryTransport};
use futures_util::StreamExt;
use log::{debug, info, trace, warn};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    BondState, COMMAND_CHAR_UUID, LinkTransport, PeerAddress, ScanFailure, ScanMode,
    TransportError, TransportEvent,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

impl From<bluer::Error> for TransportError {
    fn from(e: bluer::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

fn scan_failure(e: &bluer::Error) -> ScanFailure {
    let code = match e.kind {
        bluer::ErrorKind::InProgress => 1,
        bluer::ErrorKind::NotReady => ScanFailure::REGISTRATION_FAILED_CODE,
        bluer::ErrorKind::NotSupported => 4,
        _ => 3,
    };
    ScanFailure::from_code(code)
}

struct PeerLink {
    device: bluer::Device,
    cancel: CancellationToken,
}

pub struct BluezTransport {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    scan: std::sync::Mutex<Option<CancellationToken>>,
    links: Mutex<HashMap<PeerAddress, PeerLink>>,
}

impl BluezTransport {
    /// `adapter` 为 `None` 时使用默认适配器
    pub async fn new(adapter: Option<&str>) -> anyhow::Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = match adapter {
            Some(name) => session.adapter(name)?,
            None => {
                debug!("Getting default adapter");
                session.default_adapter().await?
            }
        };

        debug!("Powering on adapter '{}'", adapter.name());
        adapter.set_powered(true).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            _session: session,
            adapter,
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            scan: std::sync::Mutex::new(None),
            links: Mutex::new(HashMap::new()),
        })
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    fn device(&self, peer: &PeerAddress) -> Result<bluer::Device, TransportError> {
        let addr: bluer::Address = peer
            .as_str()
            .parse()
            .map_err(|_| TransportError::Io(format!("Invalid address {peer}")))?;
        Ok(self.adapter.device(addr)?)
    }
}

/// 设备是否广播了目标服务
async fn advertises(device: &bluer::Device, service: Uuid) -> bool {
    match device.uuids().await {
        Ok(Some(uuids)) => uuids.contains(&service),
        _ => false,
    }
}

async fn scan_loop(
    adapter: bluer::Adapter,
    service: Uuid,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
    mut discoverer: impl futures_util::Stream<Item = AdapterEvent> + Unpin,
) {
    // 扫描开始前已缓存的设备
    if let Ok(addrs) = adapter.device_addresses().await {
        debug!("Checking {} cached devices", addrs.len());
        for addr in addrs {
            if let Ok(device) = adapter.device(addr)
                && advertises(&device, service).await
            {
                let _ = events.send(TransportEvent::ScanMatched(PeerAddress::new(addr.to_string())));
            }
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = discoverer.next() => match event {
                Some(AdapterEvent::DeviceAdded(addr)) => {
                    let Ok(device) = adapter.device(addr) else { continue };
                    if advertises(&device, service).await {
                        debug!("Device {} advertises {}", addr, service);
                        let _ = events.send(TransportEvent::ScanMatched(PeerAddress::new(addr.to_string())));
                    } else {
                        trace!("Device {} ignored", addr);
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
    }
    // 丢弃 discoverer 即停止扫描
    debug!("Scan loop finished");
}

async fn wait_services_resolved(device: &bluer::Device) -> bool {
    let deadline = tokio::time::Instant::now() + SERVICES_RESOLVE_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if device.is_services_resolved().await.unwrap_or(false) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

async fn find_characteristic(
    device: &bluer::Device,
    uuid: Uuid,
) -> Result<Characteristic, TransportError> {
    for service in device.services().await? {
        for ch in service.characteristics().await? {
            if ch.uuid().await? == uuid {
                return Ok(ch);
            }
        }
    }
    Err(TransportError::CharacteristicNotFound(uuid))
}

/// 连接后的监听任务：断开、绑定状态变化和 COMMAND 通知
async fn watch_link(
    device: bluer::Device,
    peer: PeerAddress,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut device_events = match device.events().await {
        Ok(stream) => Box::pin(stream),
        Err(e) => {
            warn!("Cannot watch {}: {}", peer, e);
            return;
        }
    };

    let notifications = async {
        if !wait_services_resolved(&device).await {
            warn!("Services of {} not resolved", peer);
            return None;
        }
        let ch = find_characteristic(&device, COMMAND_CHAR_UUID).await.ok()?;
        ch.notify().await.ok()
    };
    let mut commands = Box::pin(
        futures_util::stream::once(notifications)
            .filter_map(|s| async { s })
            .flatten(),
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = device_events.next() => match event {
                Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) | None => {
                    info!("{} disconnected", peer);
                    let _ = events.send(TransportEvent::Disconnected(peer.clone()));
                    break;
                }
                Some(DeviceEvent::PropertyChanged(DeviceProperty::Paired(paired))) => {
                    let state = if paired { BondState::Bonded } else { BondState::NotBonded };
                    let _ = events.send(TransportEvent::BondStateChanged { peer: peer.clone(), state });
                }
                Some(_) => {}
            },
            Some(payload) = commands.next() => {
                trace!("Command notification from {} ({} bytes)", peer, payload.len());
                let _ = events.send(TransportEvent::Message {
                    peer: peer.clone(),
                    characteristic: COMMAND_CHAR_UUID,
                    payload,
                });
            }
        }
    }
}

#[async_trait]
impl LinkTransport for BluezTransport {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    async fn start_scan(&self, service: Uuid, mode: ScanMode) -> Result<(), ScanFailure> {
        self.stop_scan().await;

        let filter = DiscoveryFilter {
            uuids: HashSet::from([service]),
            transport: DiscoveryTransport::Le,
            duplicate_data: mode == ScanMode::LowLatency,
            ..Default::default()
        };
        self.adapter
            .set_discovery_filter(filter)
            .await
            .map_err(|e| scan_failure(&e))?;
        let discoverer = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| scan_failure(&e))?;

        info!("Starting BLE scan for {} ({:?})", service, mode);
        let cancel = CancellationToken::new();
        *self.scan.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(cancel.clone());
        tokio::spawn(scan_loop(
            self.adapter.clone(),
            service,
            self.events_tx.clone(),
            cancel,
            Box::pin(discoverer),
        ));
        Ok(())
    }

    async fn stop_scan(&self) {
        if let Some(cancel) = self
            .scan
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<(), TransportError> {
        let device = self.device(peer)?;
        let events = self.events_tx.clone();
        let peer = peer.clone();

        let cancel = CancellationToken::new();
        let mut links = self.links.lock().await;
        if let Some(old) = links.insert(
            peer.clone(),
            PeerLink {
                device: device.clone(),
                cancel: cancel.clone(),
            },
        ) {
            old.cancel.cancel();
        }
        drop(links);

        tokio::spawn(async move {
            info!("Connecting to {}", peer);
            match tokio::time::timeout(CONNECT_TIMEOUT, device.connect()).await {
                Ok(Ok(())) => {
                    let _ = events.send(TransportEvent::Connected(peer.clone()));
                    watch_link(device, peer, events, cancel).await;
                }
                Ok(Err(e)) => {
                    let _ = events.send(TransportEvent::OperationFailed {
                        peer,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    let _ = events.send(TransportEvent::OperationFailed {
                        peer,
                        reason: "connect timed out".to_string(),
                    });
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), TransportError> {
        let Some(link) = self.links.lock().await.remove(peer) else {
            return Err(TransportError::NotConnected(peer.clone()));
        };
        link.cancel.cancel();

        let events = self.events_tx.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            match link.device.disconnect().await {
                Ok(()) => {
                    let _ = events.send(TransportEvent::Disconnected(peer));
                }
                Err(e) => {
                    let _ = events.send(TransportEvent::OperationFailed {
                        peer,
                        reason: e.to_string(),
                    });
                }
            }
        });
        Ok(())
    }

    async fn bond_state(&self, peer: &PeerAddress) -> BondState {
        let Ok(device) = self.device(peer) else {
            return BondState::NotBonded;
        };
        match device.is_paired().await {
            Ok(true) => BondState::Bonded,
            _ => BondState::NotBonded,
        }
    }

    async fn create_bond(&self, peer: &PeerAddress) -> Result<(), TransportError> {
        let device = self.device(peer)?;
        let events = self.events_tx.clone();
        let peer = peer.clone();

        tokio::spawn(async move {
            info!("Pairing with {}", peer);
            let state = match device.pair().await {
                Ok(()) => BondState::Bonded,
                Err(e) => {
                    warn!("Pairing with {} failed: {}", peer, e);
                    BondState::NotBonded
                }
            };
            let _ = events.send(TransportEvent::BondStateChanged { peer, state });
        });
        Ok(())
    }

    async fn write(
        &self,
        peer: &PeerAddress,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let device = match self.links.lock().await.get(peer) {
            Some(link) => link.device.clone(),
            None => return Err(TransportError::NotConnected(peer.clone())),
        };
        if !device.is_connected().await? {
            return Err(TransportError::NotConnected(peer.clone()));
        }

        let ch = find_characteristic(&device, characteristic).await?;
        debug!("Writing {} bytes to {}", payload.len(), characteristic);
        ch.write(payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_error_mapping() {
        let err = |kind| bluer::Error {
            kind,
            message: String::new(),
        };
        assert_eq!(
            scan_failure(&err(bluer::ErrorKind::NotReady)),
            ScanFailure::RegistrationFailed
        );
        assert_eq!(scan_failure(&err(bluer::ErrorKind::InProgress)), ScanFailure::Other(1));
        assert_eq!(scan_failure(&err(bluer::ErrorKind::NotSupported)), ScanFailure::Other(4));
        assert_eq!(scan_failure(&err(bluer::ErrorKind::Failed)), ScanFailure::Other(3));
    }
}
