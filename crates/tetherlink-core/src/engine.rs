//! 引擎
//!
//! 把密码器、热点控制器、遥测采样器和链路管理器组装成一个显式实例，
//! 由调用方持有句柄，`init` 启动事件任务，`shutdown` 停止一切由本实例开启的东西。
//!
//! # 首次配对流程
//!
//! ```text
//! pair_from_qr ──▶ 扫描/连接/绑定 ──▶ 首连令牌 ──▶ 发送已保存的热点凭据
//!                                                  └─▶ isSetupComplete = true ──▶ SetupEvent::Complete
//! ```
//!
//! 整个流程在一个顺序任务中执行，持久化确认后才发布完成事件。

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ble::{LinkTransport, PeerAddress};
use crate::config::AppSettings;
use crate::crypto::CredentialCipher;
use crate::hotspot::{CapabilityResolution, CredentialsError, HotspotController, HotspotCredentials};
use crate::link::manager::{LinkDeps, LinkPolicy};
use crate::link::{ConnectStatus, LinkError, LinkManager, LinkReport, PairError, QrPayload};
use crate::observable::EventBus;
use crate::store::{PairingStore, PersistedRecord, RecordStore};
use crate::telemetry::{BatterySource, TelemetrySampler};

/// 平台绑定
pub struct EngineDeps {
    pub transport: Arc<dyn LinkTransport>,
    pub store: Arc<dyn PairingStore>,
    pub tethering: CapabilityResolution,
    pub battery: Arc<dyn BatterySource>,
}

/// 首次配对流程的进展
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupEvent {
    /// 凭据已交换，`isSetupComplete` 已写入
    Complete(PeerAddress),
    /// 首连时凭据未送达，等下次连上再发
    CredentialsDeferred,
    Failed(String),
}

/// 保存热点凭据的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// 与已保存的凭据相同，未写入也未发送
    Unchanged,
    Sent,
    /// 已保存，对端不在线，连上后自动发送
    Deferred,
}

#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error(transparent)]
    Invalid(#[from] CredentialsError),

    #[error("Failed to persist credentials: {0}")]
    Store(String),

    #[error(transparent)]
    Link(#[from] LinkError),
}

pub struct Engine {
    link: Arc<LinkManager>,
    store: RecordStore,
    cipher: Arc<CredentialCipher>,
    hotspot: Arc<HotspotController>,
    sampler: TelemetrySampler,
    setup: Arc<EventBus<SetupEvent>>,
    cancel: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// 组装并启动事件任务，需要在 tokio 运行时内调用
    pub fn init(deps: EngineDeps, settings: &AppSettings) -> Arc<Self> {
        let store = RecordStore::new(deps.store);
        let cipher = Arc::new(CredentialCipher::new());
        let hotspot = Arc::new(HotspotController::new(deps.tethering));

        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
        let sampler = TelemetrySampler::new(
            Arc::new(telemetry_tx),
            deps.battery,
            settings.battery_interval(),
        );

        let link = Arc::new(LinkManager::new(
            LinkDeps {
                transport: deps.transport,
                cipher: cipher.clone(),
                store: store.clone(),
                hotspot: hotspot.clone(),
                sampler: sampler.clone(),
                telemetry: telemetry_rx,
            },
            LinkPolicy::from(settings),
        ));

        let cancel = CancellationToken::new();
        let runner = {
            let link = link.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { link.run(cancel).await })
        };

        info!("Engine initialized");
        Arc::new(Self {
            link,
            store,
            cipher,
            hotspot,
            sampler,
            setup: Arc::new(EventBus::new()),
            cancel,
            tasks: std::sync::Mutex::new(vec![runner]),
        })
    }

    /// 停止扫描、断开链路、关闭由本引擎开启的共享并结束后台任务
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.link.shutdown().await;
        self.cancel.cancel();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }
    }

    pub fn link(&self) -> &Arc<LinkManager> {
        &self.link
    }

    /// 平台信号源（ModemManager 等）推送样本的入口
    pub fn sampler(&self) -> &TelemetrySampler {
        &self.sampler
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn hotspot_supported(&self) -> bool {
        self.hotspot.is_supported()
    }

    pub fn is_cipher_ready(&self) -> bool {
        self.cipher.is_initialized()
    }

    pub fn status(&self) -> ConnectStatus {
        self.link.status()
    }

    pub fn subscribe_status(&self) -> mpsc::UnboundedReceiver<ConnectStatus> {
        self.link.subscribe_status()
    }

    pub fn subscribe_reports(&self) -> mpsc::UnboundedReceiver<LinkReport> {
        self.link.subscribe_reports()
    }

    pub fn subscribe_setup(&self) -> mpsc::UnboundedReceiver<SetupEvent> {
        self.setup.subscribe()
    }

    pub async fn record(&self) -> anyhow::Result<PersistedRecord> {
        self.store.load().await
    }

    // ========================================================================
    // 配对
    // ========================================================================

    pub async fn pair_from_qr(&self, service_uuid: &str, shared_secret: &str) -> Result<(), PairError> {
        let token = self.link.pair_from_qr(service_uuid, shared_secret).await?;
        self.spawn_setup(token);
        Ok(())
    }

    /// 二维码 JSON 文本
    pub async fn pair_qr_payload(&self, json: &str) -> Result<(), PairError> {
        let (service_uuid, shared_pin) = QrPayload::parse(json)?;
        self.pair_from_qr(&service_uuid, &shared_pin).await
    }

    pub async fn pair_from_store(&self) -> Result<(), PairError> {
        self.link.pair_from_store().await
    }

    pub async fn unpair(&self) -> Result<(), PairError> {
        self.link.unpair().await
    }

    /// 首连令牌触发后的顺序任务
    fn spawn_setup(&self, token: oneshot::Receiver<PeerAddress>) {
        let link = self.link.clone();
        let store = self.store.clone();
        let setup = self.setup.clone();
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            let peer = tokio::select! {
                _ = cancel.cancelled() => return,
                peer = token => match peer {
                    Ok(peer) => peer,
                    // 配对被替换或解除
                    Err(_) => {
                        debug!("First-connect token dropped");
                        return;
                    }
                },
            };
            run_setup(&link, &store, &setup, peer).await;
        });

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    // ========================================================================
    // 热点凭据
    // ========================================================================

    /// 校验、保存并尝试发送热点凭据
    ///
    /// 与当前保存值相同视为无效保存。对端不在线时返回 [`SaveOutcome::Deferred`]，
    /// 凭据会在下次绑定成功后自动发送。
    pub async fn save_hotspot_credentials(
        &self,
        ssid: &str,
        password: &str,
    ) -> Result<SaveOutcome, SaveError> {
        let creds = HotspotCredentials::new(ssid, password)?;

        let current = self
            .store
            .load()
            .await
            .map_err(|e| SaveError::Store(e.to_string()))?;
        if current.ssid == creds.ssid && current.password == creds.password {
            debug!("Hotspot credentials unchanged");
            return Ok(SaveOutcome::Unchanged);
        }

        self.store
            .update(|r| r.replace_credentials(&creds.ssid, &creds.password))
            .await
            .map_err(|e| SaveError::Store(e.to_string()))?;
        info!("Hotspot credentials saved for '{}'", creds.ssid);

        match self.link.send_credentials(&creds).await {
            Ok(()) => Ok(SaveOutcome::Sent),
            Err(LinkError::HotspotShareFailed) => {
                info!("Peer not connected, credentials deferred");
                Ok(SaveOutcome::Deferred)
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn run_setup(
    link: &LinkManager,
    store: &RecordStore,
    setup: &EventBus<SetupEvent>,
    peer: PeerAddress,
) {
    info!("First connection with {}, exchanging credentials", peer);

    let record = match store.load().await {
        Ok(record) => record,
        Err(e) => {
            warn!("Failed to load record during setup: {}", e);
            setup.emit(SetupEvent::Failed(e.to_string()));
            return;
        }
    };

    if record.has_hotspot_credentials() {
        let creds = HotspotCredentials {
            ssid: record.ssid,
            password: record.password,
        };
        match link.send_credentials(&creds).await {
            Ok(()) => {}
            Err(LinkError::HotspotShareFailed) => {
                setup.emit(SetupEvent::CredentialsDeferred);
            }
            Err(e) => {
                warn!("Credential exchange failed: {}", e);
                setup.emit(SetupEvent::Failed(e.to_string()));
                return;
            }
        }
    } else {
        debug!("No hotspot credentials saved yet");
    }

    match store.update(|r| r.is_setup_complete = true).await {
        Ok(_) => {
            info!("Setup complete with {}", peer);
            setup.emit(SetupEvent::Complete(peer));
        }
        Err(e) => {
            warn!("Failed to persist setup completion: {}", e);
            setup.emit(SetupEvent::Failed(e.to_string()));
        }
    }
}
