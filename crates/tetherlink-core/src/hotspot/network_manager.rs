//! 基于 NetworkManager 的共享能力

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use log::{debug, info, warn};

use super::nm_dbus::NmClient;
use super::{
    CapabilityResolution, HotspotCredentials, TetherError, TetheringCallback, TetheringCapability,
    TransportKind,
};
use crate::config::{AppSettings, HotspotBand};
use crate::store::RecordStore;

/// 热点连接配置的固定 ID
pub const HOTSPOT_CONNECTION_ID: &str = "tetherlink-hotspot";

const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(15);

pub struct NmTethering {
    client: Arc<NmClient>,
    store: RecordStore,
    interface: String,
    band: HotspotBand,
}

impl NmTethering {
    pub fn new(client: NmClient, store: RecordStore, settings: &AppSettings) -> Self {
        Self {
            client: Arc::new(client),
            store,
            interface: settings.wifi_interface.clone(),
            band: settings.hotspot_band,
        }
    }

    /// 连接系统 NetworkManager；不可用时降级为 `Unsupported`
    pub async fn resolve(store: RecordStore, settings: &AppSettings) -> CapabilityResolution {
        match NmClient::new().await {
            Ok(client) => {
                CapabilityResolution::Supported(Arc::new(Self::new(client, store, settings)))
            }
            Err(e) => CapabilityResolution::Unsupported(format!("NetworkManager unavailable: {e:#}")),
        }
    }

    async fn bring_up(
        client: &NmClient,
        store: &RecordStore,
        interface: &str,
        band: HotspotBand,
    ) -> anyhow::Result<()> {
        let record = store.load().await?;
        let creds = HotspotCredentials::new(record.ssid, record.password)
            .context("No usable hotspot credentials saved")?;

        // 旧配置可能带着过期的凭据
        client.delete_connection_by_name(HOTSPOT_CONNECTION_ID).await?;

        let conn = client
            .create_hotspot(HOTSPOT_CONNECTION_ID, &creds.ssid, &creds.password, band, interface)
            .await?;
        let device = client
            .wifi_device(interface)
            .await?
            .with_context(|| format!("WiFi interface {interface} not found"))?;

        let active = client.activate_connection(&conn, &device).await?;
        client.wait_for_activation(&active, ACTIVATION_TIMEOUT).await?;
        info!("Hotspot {} up on {}", creds.ssid, interface);
        Ok(())
    }
}

#[async_trait]
impl TetheringCapability for NmTethering {
    async fn tethered_interfaces(&self) -> anyhow::Result<Vec<String>> {
        self.client.active_ap_interfaces().await
    }

    fn start_tethering(
        &self,
        kind: TransportKind,
        exclusive: bool,
        callback: Arc<dyn TetheringCallback>,
    ) -> Result<(), TetherError> {
        if kind != TransportKind::Wifi {
            return Err(TetherError::Unsupported(format!(
                "{kind:?} tethering is not provided by NetworkManager"
            )));
        }

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| TetherError::Unsupported(format!("no async runtime: {e}")))?;

        debug!("Dispatching hotspot start (exclusive={})", exclusive);
        let client = self.client.clone();
        let store = self.store.clone();
        let interface = self.interface.clone();
        let band = self.band;

        handle.spawn(async move {
            match Self::bring_up(&client, &store, &interface, band).await {
                Ok(()) => callback.on_tethering_started(),
                Err(e) => {
                    warn!("Hotspot start failed: {:#}", e);
                    // 清理半途创建的配置
                    let _ = client.delete_connection_by_name(HOTSPOT_CONNECTION_ID).await;
                    callback.on_tethering_failed();
                }
            }
        });

        Ok(())
    }

    async fn stop_tethering(&self, kind: TransportKind) -> Result<(), TetherError> {
        if kind != TransportKind::Wifi {
            return Err(TetherError::Unsupported(format!("{kind:?}")));
        }

        self.client
            .deactivate_by_id(HOTSPOT_CONNECTION_ID)
            .await
            .map_err(|e| TetherError::Failed(format!("{e:#}")))?;
        self.client
            .delete_connection_by_name(HOTSPOT_CONNECTION_ID)
            .await
            .map_err(|e| TetherError::Failed(format!("{e:#}")))?;
        Ok(())
    }
}
