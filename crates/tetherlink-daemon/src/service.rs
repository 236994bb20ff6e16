//! Core Service - 平台绑定与引擎组装

use std::sync::Arc;

use anyhow::Result;
use tetherlink_core::store::RecordStore;
use tetherlink_core::{
    AppSettings, Engine, EngineDeps, FileStore, LinkReport, LinkTransport, ModemWatcher,
    NmTethering, PairError, PairingStore, SetupEvent, SysfsBattery,
};

/// 构建平台绑定、启动引擎并恢复已保存的配对
pub async fn start(settings: &AppSettings) -> Result<Arc<Engine>> {
    tracing::info!("核心服务初始化...");

    let store_path = settings.store_path();
    tracing::info!("Pairing record: {:?}", store_path);
    let store: Arc<dyn PairingStore> = Arc::new(FileStore::new(store_path));

    let transport = transport(settings).await?;
    let tethering = NmTethering::resolve(RecordStore::new(store.clone()), settings).await;

    let battery = SysfsBattery::new();
    if !battery.is_present() {
        tracing::warn!("No battery found under /sys/class/power_supply");
    }

    let engine = Engine::init(
        EngineDeps {
            transport,
            store,
            tethering,
            battery: Arc::new(battery),
        },
        settings,
    );

    if !engine.hotspot_supported() {
        tracing::warn!("Hotspot control unavailable, enable requests will be rejected");
    }

    match ModemWatcher::new().await {
        Ok(watcher) => {
            watcher.spawn(
                engine.sampler().clone(),
                settings.modem_poll_interval(),
                engine.cancel_token(),
            );
        }
        Err(e) => tracing::warn!("Modem telemetry unavailable: {:#}", e),
    }

    match engine.pair_from_store().await {
        Ok(()) => tracing::info!("Restored saved pairing"),
        Err(PairError::MissingCredentials) => tracing::info!("Not paired yet, waiting for QR pairing"),
        Err(e) => tracing::warn!("Failed to restore pairing: {}", e),
    }

    Ok(engine)
}

#[cfg(feature = "bluez")]
async fn transport(settings: &AppSettings) -> Result<Arc<dyn LinkTransport>> {
    let transport = tetherlink_core::BluezTransport::new(settings.adapter.as_deref()).await?;
    tracing::info!("Using Bluetooth adapter {}", transport.adapter_name());
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "bluez"))]
async fn transport(_settings: &AppSettings) -> Result<Arc<dyn LinkTransport>> {
    anyhow::bail!("tetherlink-daemon was built without BlueZ support; rebuild with `--features bluez`")
}

/// 把链路和首连事件写进日志
pub async fn log_reports(engine: Arc<Engine>) {
    let mut reports = engine.subscribe_reports();
    let mut setup = engine.subscribe_setup();
    let mut status = engine.subscribe_status();

    loop {
        tokio::select! {
            Some(report) = reports.recv() => match report {
                LinkReport::Error(e) => tracing::warn!("Link error: {}", e),
                LinkReport::TetheringUnsupported => tracing::warn!("Peer requested hotspot, but tethering is unsupported"),
                other => tracing::debug!("Link report: {:?}", other),
            },
            Some(event) = setup.recv() => match event {
                SetupEvent::Complete(peer) => tracing::info!("Setup complete with {}", peer),
                SetupEvent::CredentialsDeferred => tracing::info!("Hotspot credentials will be sent on next connection"),
                SetupEvent::Failed(reason) => tracing::error!("Setup failed: {}", reason),
            },
            Some(s) = status.recv() => tracing::info!("状态: {:?}", s),
            else => break,
        }
    }
}
