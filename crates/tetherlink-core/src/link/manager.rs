//! 链路管理器
//!
//! 所有平台事件、共享启动结果和遥测样本都在 [`LinkManager::run`] 的单个任务中
//! 按到达顺序处理；公开操作与事件处理共用同一把状态锁。

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{
    ConnectStatus, DeviceLink, LinkError, LinkReport, PairError, PairingSession, PendingOp,
    QrPayload,
};
use crate::ble::gatt::GattCodec;
use crate::ble::{
    BondState, COMMAND_CHAR_UUID, CREDENTIALS_CHAR_UUID, LinkTransport, PeerAddress, PeerCommand,
    ScanMode, TELEMETRY_CHAR_UUID, TransportEvent,
};
use crate::config::{AppSettings, MAX_CONNECT_RETRIES};
use crate::crypto::CredentialCipher;
use crate::hotspot::{HotspotController, HotspotCredentials, TetheringCallback};
use crate::observable::{EventBus, Observable};
use crate::store::RecordStore;
use crate::telemetry::{TelemetrySample, TelemetrySampler};

/// 链路管理器的协作者
pub struct LinkDeps {
    pub transport: Arc<dyn LinkTransport>,
    pub cipher: Arc<CredentialCipher>,
    pub store: RecordStore,
    pub hotspot: Arc<HotspotController>,
    pub sampler: TelemetrySampler,
    /// 采样器 sink 对应的接收端
    pub telemetry: mpsc::UnboundedReceiver<TelemetrySample>,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkPolicy {
    pub max_retries: u8,
    pub auto_reconnect: bool,
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_CONNECT_RETRIES,
            auto_reconnect: true,
        }
    }
}

impl From<&AppSettings> for LinkPolicy {
    fn from(settings: &AppSettings) -> Self {
        Self {
            max_retries: settings.connect_retries(),
            auto_reconnect: settings.auto_reconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TetherOutcome {
    Started,
    Failed,
}

/// 把共享结果回调转成事件，交给事件任务处理
struct TetherNotifier(mpsc::UnboundedSender<TetherOutcome>);

impl TetheringCallback for TetherNotifier {
    fn on_tethering_started(&self) {
        let _ = self.0.send(TetherOutcome::Started);
    }

    fn on_tethering_failed(&self) {
        let _ = self.0.send(TetherOutcome::Failed);
    }
}

#[derive(Default)]
struct LinkState {
    session: Option<PairingSession>,
    link: Option<DeviceLink>,
    scanning: bool,
    /// 首次连接令牌，触发后即被取走
    first_connect: Option<oneshot::Sender<PeerAddress>>,
    /// 凭据保存时对端不在线，连上后重发
    share_pending: bool,
}

impl LinkState {
    fn is_current(&self, peer: &PeerAddress) -> bool {
        self.link.as_ref().is_some_and(|l| &l.peer == peer)
    }
}

pub struct LinkManager {
    transport: Arc<dyn LinkTransport>,
    cipher: Arc<CredentialCipher>,
    store: RecordStore,
    hotspot: Arc<HotspotController>,
    sampler: TelemetrySampler,
    policy: LinkPolicy,
    status: Observable<ConnectStatus>,
    reports: EventBus<LinkReport>,
    state: Mutex<LinkState>,
    tether_tx: mpsc::UnboundedSender<TetherOutcome>,
    tether_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TetherOutcome>>>,
    telemetry_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TelemetrySample>>>,
}

impl LinkManager {
    pub fn new(deps: LinkDeps, policy: LinkPolicy) -> Self {
        let (tether_tx, tether_rx) = mpsc::unbounded_channel();
        let policy = LinkPolicy {
            max_retries: policy.max_retries.min(MAX_CONNECT_RETRIES),
            ..policy
        };

        Self {
            transport: deps.transport,
            cipher: deps.cipher,
            store: deps.store,
            hotspot: deps.hotspot,
            sampler: deps.sampler,
            policy,
            status: Observable::new(ConnectStatus::Disconnected),
            reports: EventBus::new(),
            state: Mutex::new(LinkState::default()),
            tether_tx,
            tether_rx: std::sync::Mutex::new(Some(tether_rx)),
            telemetry_rx: std::sync::Mutex::new(Some(deps.telemetry)),
        }
    }

    pub fn status(&self) -> ConnectStatus {
        self.status.get()
    }

    /// 订阅状态变化，先收到当前值
    pub fn subscribe_status(&self) -> mpsc::UnboundedReceiver<ConnectStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_reports(&self) -> mpsc::UnboundedReceiver<LinkReport> {
        self.reports.subscribe()
    }

    pub async fn session(&self) -> Option<PairingSession> {
        self.state.lock().await.session.clone()
    }

    pub async fn device_link(&self) -> Option<DeviceLink> {
        self.state.lock().await.link.clone()
    }

    pub async fn is_scanning(&self) -> bool {
        self.state.lock().await.scanning
    }

    // ========================================================================
    // 公开操作
    // ========================================================================

    /// 扫码配对
    ///
    /// 校验通过后持久化配对信息、派生密钥并开始扫描。返回的接收端在本次配对
    /// 第一次绑定成功时收到对端地址，之后的重连不会再触发。
    pub async fn pair_from_qr(
        &self,
        service_uuid: &str,
        shared_secret: &str,
    ) -> Result<oneshot::Receiver<PeerAddress>, PairError> {
        let session = PairingSession::new(service_uuid, shared_secret)?;

        let mut state = self.state.lock().await;
        self.store
            .update(|r| {
                r.service_uuid = service_uuid.to_string();
                r.shared_pin = shared_secret.to_string();
                r.is_setup_complete = false;
            })
            .await
            .map_err(|e| PairError::Store(e.to_string()))?;

        self.cipher.initialize(&session.shared_secret);
        info!("Paired with service {}", session.service_uuid);

        let (tx, rx) = oneshot::channel();
        state.first_connect = Some(tx);
        self.activate_session(&mut state, session).await;
        Ok(rx)
    }

    /// 二维码 JSON 文本 `{"serviceUUID": ..., "sharedPIN": ...}`
    pub async fn pair_from_qr_json(
        &self,
        json: &str,
    ) -> Result<oneshot::Receiver<PeerAddress>, PairError> {
        let (service_uuid, shared_pin) = QrPayload::parse(json)?;
        self.pair_from_qr(&service_uuid, &shared_pin).await
    }

    /// 用已保存的配对信息恢复会话（不触发首次连接流程）
    pub async fn pair_from_store(&self) -> Result<(), PairError> {
        let record = self
            .store
            .load()
            .await
            .map_err(|e| PairError::Store(e.to_string()))?;
        let session = PairingSession::from_record(&record)?;

        let mut state = self.state.lock().await;
        if state.session.as_ref() == Some(&session) && (state.link.is_some() || state.scanning) {
            debug!("Session already active");
            return Ok(());
        }

        self.cipher.initialize(&session.shared_secret);
        info!("Restored pairing for service {}", session.service_uuid);
        self.activate_session(&mut state, session).await;
        Ok(())
    }

    /// 加密并发送热点凭据
    ///
    /// 对端不在线时返回 [`LinkError::HotspotShareFailed`]，并在下次绑定成功后自动重发。
    pub async fn send_credentials(&self, creds: &HotspotCredentials) -> Result<(), LinkError> {
        let mut state = self.state.lock().await;
        let result = self.write_credentials(&state, creds).await;
        if matches!(result, Err(LinkError::HotspotShareFailed)) {
            state.share_pending = true;
        }
        result
    }

    /// 解除配对
    pub async fn unpair(&self) -> Result<(), PairError> {
        let mut state = self.state.lock().await;
        info!("Unpairing");

        state.session = None;
        state.first_connect = None;
        state.share_pending = false;
        self.stop_discovery(&mut state).await;
        if state.link.is_some() {
            self.begin_disconnect(&mut state).await;
        }

        self.hotspot.stop_tethering().await;
        self.sampler.set_enabled(false);
        self.cipher.clear();
        self.set_status(ConnectStatus::Disconnected);

        self.store
            .update(|r| r.clear_pairing())
            .await
            .map_err(|e| PairError::Store(e.to_string()))?;
        Ok(())
    }

    /// 停止扫描、断开链路、关闭由本引擎开启的共享
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        self.stop_discovery(&mut state).await;

        if let Some(link) = state.link.take()
            && let Err(e) = self.transport.disconnect(&link.peer).await
        {
            debug!("Disconnect on shutdown failed: {}", e);
        }

        self.hotspot.stop_tethering().await;
        self.sampler.set_enabled(false);
        self.set_status(ConnectStatus::Disconnected);
    }

    // ========================================================================
    // 事件循环
    // ========================================================================

    /// 事件任务，直到 `cancel` 触发或所有事件源关闭
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(mut events) = self.transport.take_events() else {
            warn!("Transport events already taken, link manager not started");
            return;
        };
        let tether_rx = self
            .tether_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let telemetry_rx = self
            .telemetry_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let (Some(mut tether_rx), Some(mut telemetry_rx)) = (tether_rx, telemetry_rx) else {
            warn!("Link manager already running");
            return;
        };

        info!("Link manager started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(outcome) = tether_rx.recv() => self.handle_tether_outcome(outcome).await,
                Some(sample) = telemetry_rx.recv() => self.forward_telemetry(sample).await,
                else => break,
            }
        }
        info!("Link manager stopped");
    }

    pub(crate) async fn handle_event(&self, event: TransportEvent) {
        let mut state = self.state.lock().await;
        debug!("Transport event: {:?}", event);

        match event {
            TransportEvent::ScanMatched(peer) => self.on_scan_matched(&mut state, peer).await,
            TransportEvent::ScanFailed(failure) => {
                state.scanning = false;
                warn!("Scan failed: {}", failure);
                self.report(LinkReport::Error(LinkError::ScanFailed(failure)));
            }
            TransportEvent::Connected(peer) => self.on_connected(&mut state, peer).await,
            TransportEvent::OperationFailed { peer, reason } => {
                if !state.is_current(&peer) {
                    return;
                }
                warn!("Link operation to {} failed: {}", peer, reason);
                if self.retry_or_fail(&mut state).await {
                    self.issue_pending(&mut state).await;
                }
            }
            TransportEvent::Disconnected(peer) => self.on_disconnected(&mut state, peer).await,
            TransportEvent::BondStateChanged { peer, state: bond } => {
                self.on_bond_state(&mut state, peer, bond).await
            }
            TransportEvent::Message {
                peer,
                characteristic,
                payload,
            } => {
                if !state.is_current(&peer) || characteristic != COMMAND_CHAR_UUID {
                    debug!("Ignoring message on {} from {}", characteristic, peer);
                    return;
                }
                match GattCodec::parse_command(&payload) {
                    Ok(cmd) => self.handle_command(&mut state, cmd).await,
                    Err(e) => warn!("Malformed peer command: {}", e),
                }
            }
        }
    }

    async fn handle_tether_outcome(&self, outcome: TetherOutcome) {
        let _state = self.state.lock().await;
        match outcome {
            TetherOutcome::Started => {
                info!("Tethering started");
                self.report(LinkReport::TetheringStarted);
            }
            TetherOutcome::Failed => {
                warn!("Tethering failed");
                if self.status.get() == ConnectStatus::Connecting {
                    self.set_status(ConnectStatus::Idle);
                }
                self.report(LinkReport::TetheringFailed);
            }
        }
    }

    async fn forward_telemetry(&self, sample: TelemetrySample) {
        let state = self.state.lock().await;
        let Some(link) = Self::bonded_link(&state) else {
            debug!("Dropping telemetry, no link");
            return;
        };
        if !self.status.get().is_linked() {
            return;
        }

        let data = GattCodec::encode_telemetry(&sample);
        if let Err(e) = self
            .transport
            .write(&link.peer, TELEMETRY_CHAR_UUID, &data)
            .await
        {
            debug!("Telemetry write failed: {}", e);
        }
    }

    // ========================================================================
    // 内部流程
    // ========================================================================

    fn report(&self, report: LinkReport) {
        self.reports.emit(report);
    }

    fn set_status(&self, status: ConnectStatus) {
        if self.status.set(status) {
            info!("Connect status -> {:?}", status);
        }
    }

    fn bonded_link(state: &LinkState) -> Option<&DeviceLink> {
        state
            .link
            .as_ref()
            .filter(|l| l.bond_state == BondState::Bonded)
    }

    async fn activate_session(&self, state: &mut LinkState, session: PairingSession) {
        state.session = Some(session);
        if state.link.is_some() {
            // 扫描在旧链路断开后重新开始
            self.begin_disconnect(state).await;
        } else {
            self.start_discovery(state).await;
        }
    }

    async fn start_discovery(&self, state: &mut LinkState) {
        let Some(service) = state.session.as_ref().map(|s| s.service_uuid) else {
            return;
        };
        if state.scanning {
            self.transport.stop_scan().await;
        }

        match self.transport.start_scan(service, ScanMode::LowLatency).await {
            Ok(()) => {
                state.scanning = true;
                info!("Scanning for service {}", service);
                self.report(LinkReport::ScanStarted(service));
            }
            Err(failure) => {
                state.scanning = false;
                warn!("Scan failed to start: {}", failure);
                self.report(LinkReport::Error(LinkError::ScanFailed(failure)));
            }
        }
    }

    async fn stop_discovery(&self, state: &mut LinkState) {
        if state.scanning {
            self.transport.stop_scan().await;
            state.scanning = false;
        }
    }

    async fn on_scan_matched(&self, state: &mut LinkState, peer: PeerAddress) {
        if !state.scanning || state.link.is_some() {
            debug!("Ignoring scan match {}", peer);
            return;
        }

        // 只取第一个命中
        self.stop_discovery(state).await;
        info!("Found peer {}", peer);
        self.report(LinkReport::PeerMatched(peer.clone()));

        state.link = Some(DeviceLink::new(peer));
        self.issue_pending(state).await;
    }

    /// 发出挂起的连接/断开请求；派发失败按重试策略处理
    async fn issue_pending(&self, state: &mut LinkState) {
        loop {
            let Some((peer, op)) = state
                .link
                .as_ref()
                .and_then(|l| l.pending.map(|op| (l.peer.clone(), op)))
            else {
                return;
            };

            let result = match op {
                PendingOp::Connect => self.transport.connect(&peer).await,
                PendingOp::Disconnect => self.transport.disconnect(&peer).await,
            };

            match result {
                Ok(()) => return,
                Err(e) => {
                    warn!("{:?} to {} could not be issued: {}", op, peer, e);
                    if !self.retry_or_fail(state).await {
                        return;
                    }
                }
            }
        }
    }

    /// 返回 `true` 表示应重发挂起的请求
    async fn retry_or_fail(&self, state: &mut LinkState) -> bool {
        let Some(link) = state.link.as_mut() else {
            return false;
        };
        let Some(op) = link.pending else {
            return false;
        };

        if link.retry_count < self.policy.max_retries {
            link.retry_count += 1;
            info!(
                "Retrying {:?} to {} ({}/{})",
                op, link.peer, link.retry_count, self.policy.max_retries
            );
            return true;
        }

        warn!(
            "{:?} to {} abandoned after {} retries",
            op, link.peer, link.retry_count
        );
        state.link = None;
        match op {
            PendingOp::Connect => {
                self.set_status(ConnectStatus::Disconnected);
                self.report(LinkReport::Error(LinkError::ConnectFailed));
            }
            PendingOp::Disconnect => {
                // 放弃等待断开确认，新会话照常扫描
                self.start_discovery(state).await;
            }
        }
        false
    }

    async fn begin_disconnect(&self, state: &mut LinkState) {
        let Some(link) = state.link.as_mut() else {
            return;
        };
        link.pending = Some(PendingOp::Disconnect);
        link.retry_count = 0;

        self.sampler.set_enabled(false);
        self.set_status(ConnectStatus::Disconnected);
        self.issue_pending(state).await;
    }

    async fn on_connected(&self, state: &mut LinkState, peer: PeerAddress) {
        let Some(link) = state.link.as_mut().filter(|l| l.peer == peer) else {
            debug!("Connected event for unknown peer {}", peer);
            return;
        };
        if link.pending != Some(PendingOp::Connect) {
            debug!("Unexpected connected event for {}", peer);
            return;
        }

        info!("Connected to {}", peer);
        link.retry_count = 0;
        link.pending = None;

        let bond = self.transport.bond_state(&peer).await;
        link.bond_state = bond;
        match bond {
            BondState::Bonded => self.on_bonded(state).await,
            BondState::Bonding => debug!("Bonding with {} in progress", peer),
            BondState::NotBonded => match self.transport.create_bond(&peer).await {
                Ok(()) => link.bond_state = BondState::Bonding,
                Err(e) => {
                    warn!("Failed to start bonding with {}: {}", peer, e);
                    self.on_bonding_failed(state).await;
                }
            },
        }
    }

    async fn on_bond_state(
        &self,
        state: &mut LinkState,
        peer: PeerAddress,
        bond: BondState,
    ) {
        let Some(link) = state.link.as_mut().filter(|l| l.peer == peer) else {
            return;
        };
        link.bond_state = bond;

        match bond {
            BondState::Bonded => self.on_bonded(state).await,
            BondState::NotBonded => self.on_bonding_failed(state).await,
            BondState::Bonding => debug!("Bonding with {}", peer),
        }
    }

    async fn on_bonded(&self, state: &mut LinkState) {
        let Some(peer) = Self::bonded_link(state).map(|l| l.peer.clone()) else {
            return;
        };
        if self.status.get().is_linked() {
            debug!("Already bonded with {}", peer);
            return;
        }

        info!("Bonded with {}", peer);
        self.set_status(ConnectStatus::Idle);

        let first_connect = match state.first_connect.take() {
            Some(token) => {
                // 首连流程会发送最新保存的凭据
                state.share_pending = false;
                let _ = token.send(peer.clone());
                true
            }
            None => false,
        };
        self.report(LinkReport::Bonded {
            peer,
            first_connect,
        });

        if !first_connect && state.share_pending {
            match self.send_stored_credentials(state).await {
                Ok(()) => state.share_pending = false,
                Err(e) => warn!("Deferred credentials still not sent: {}", e),
            }
        }
    }

    async fn on_bonding_failed(&self, state: &mut LinkState) {
        let Some(link) = state.link.take() else {
            return;
        };
        warn!("Bonding with {} failed", link.peer);

        if let Err(e) = self.transport.disconnect(&link.peer).await {
            debug!("Disconnect after bonding failure: {}", e);
        }
        self.sampler.set_enabled(false);
        self.set_status(ConnectStatus::Disconnected);
        self.report(LinkReport::Error(LinkError::BondingFailed));
    }

    async fn on_disconnected(&self, state: &mut LinkState, peer: PeerAddress) {
        if !state.is_current(&peer) {
            return;
        }
        let Some(link) = state.link.take() else {
            return;
        };

        if link.pending == Some(PendingOp::Disconnect) {
            info!("Disconnected from {}", peer);
            // 换绑时旧链路断开后开始新会话的扫描
            self.start_discovery(state).await;
            return;
        }

        info!("Link to {} lost", peer);
        self.sampler.set_enabled(false);
        self.set_status(ConnectStatus::Disconnected);
        self.report(LinkReport::LinkLost(peer));

        if self.policy.auto_reconnect {
            self.start_discovery(state).await;
        }
    }

    async fn handle_command(&self, state: &mut LinkState, cmd: PeerCommand) {
        if Self::bonded_link(state).is_none() {
            warn!("Peer command {:?} before bonding, ignored", cmd);
            return;
        }
        info!("Peer command: {:?}", cmd);

        let status = self.status.get();
        match cmd {
            PeerCommand::EnableHotspot => {
                if status != ConnectStatus::Idle {
                    debug!("Hotspot already requested ({:?})", status);
                    return;
                }
                if self.hotspot.is_tether_active().await {
                    // 已在共享，等待对端加入
                    self.set_status(ConnectStatus::Connecting);
                    return;
                }

                let callback = Arc::new(TetherNotifier(self.tether_tx.clone()));
                if self.hotspot.start_tethering(callback).await {
                    self.set_status(ConnectStatus::Connecting);
                } else {
                    self.report(LinkReport::TetheringUnsupported);
                }
            }
            PeerCommand::DisableHotspot => {
                self.hotspot.stop_tethering().await;
                if matches!(status, ConnectStatus::Connecting | ConnectStatus::Connected) {
                    self.set_status(ConnectStatus::Idle);
                }
            }
            PeerCommand::SeePhoneInfo { enabled } => {
                self.sampler.set_enabled(enabled);
                self.report(LinkReport::PhoneInfo { enabled });
            }
            PeerCommand::HotspotJoined => {
                if matches!(status, ConnectStatus::Idle | ConnectStatus::Connecting) {
                    self.set_status(ConnectStatus::Connected);
                }
            }
            PeerCommand::HotspotLeft => {
                if status == ConnectStatus::Connected {
                    self.set_status(ConnectStatus::Idle);
                }
            }
        }
    }

    async fn send_stored_credentials(&self, state: &LinkState) -> Result<(), LinkError> {
        let record = self
            .store
            .load()
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        if !record.has_hotspot_credentials() {
            debug!("No hotspot credentials saved");
            return Ok(());
        }

        let creds = HotspotCredentials {
            ssid: record.ssid,
            password: record.password,
        };
        self.write_credentials(state, &creds).await
    }

    async fn write_credentials(
        &self,
        state: &LinkState,
        creds: &HotspotCredentials,
    ) -> Result<(), LinkError> {
        let Some(link) = Self::bonded_link(state) else {
            return Err(LinkError::HotspotShareFailed);
        };
        if !self.status.get().is_linked() {
            return Err(LinkError::HotspotShareFailed);
        }

        let data = GattCodec::encode_credentials(creds, &self.cipher)?;
        self.transport
            .write(&link.peer, CREDENTIALS_CHAR_UUID, &data)
            .await
            .map_err(|e| {
                warn!("Credential write to {} failed: {}", link.peer, e);
                LinkError::HotspotShareFailed
            })?;

        info!("Hotspot credentials sent to {}", link.peer);
        self.report(LinkReport::CredentialsSent);
        Ok(())
    }
}
