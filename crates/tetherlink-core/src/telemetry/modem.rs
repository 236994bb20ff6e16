//! ModemManager 信号/制式来源
//!
//! 定期读取第一个调制解调器的 `SignalQuality`（百分比）和
//! `AccessTechnologies`（位掩码），转换后交给 [`TelemetrySampler`]。

use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zbus::Connection;
use zbus::proxy;
use zbus::zvariant::OwnedObjectPath;

use super::{RadioTechnology, TelemetrySampler};

const MM_SERVICE: &str = "org.freedesktop.ModemManager1";
const MM_PATH: &str = "/org/freedesktop/ModemManager1";

#[proxy(
    interface = "org.freedesktop.ModemManager1.Modem",
    default_service = "org.freedesktop.ModemManager1"
)]
trait Modem {
    /// (百分比, 是否为最新值)
    #[zbus(property)]
    fn signal_quality(&self) -> zbus::Result<(u32, bool)>;

    #[zbus(property)]
    fn access_technologies(&self) -> zbus::Result<u32>;
}

/// 信号百分比映射为原始等级 0–4
pub fn signal_bucket(percent: u32) -> i32 {
    match percent {
        0..=19 => 0,
        20..=39 => 1,
        40..=59 => 2,
        60..=79 => 3,
        _ => 4,
    }
}

pub struct ModemWatcher {
    connection: Connection,
}

impl ModemWatcher {
    pub async fn new() -> Result<Self> {
        let connection = Connection::system()
            .await
            .context("Failed to connect to system D-Bus")?;
        Ok(Self { connection })
    }

    async fn first_modem(&self) -> Result<Option<OwnedObjectPath>> {
        let manager = zbus::fdo::ObjectManagerProxy::builder(&self.connection)
            .destination(MM_SERVICE)?
            .path(MM_PATH)?
            .build()
            .await?;

        let objects = manager
            .get_managed_objects()
            .await
            .context("ModemManager not available")?;

        let mut paths: Vec<OwnedObjectPath> = objects.into_keys().collect();
        paths.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(paths.into_iter().next())
    }

    /// 读取一次并推给采样器
    pub async fn poll_once(&self, sampler: &TelemetrySampler) -> Result<()> {
        let Some(path) = self.first_modem().await? else {
            debug!("No modem present");
            return Ok(());
        };

        let modem = ModemProxy::builder(&self.connection)
            .path(&path)?
            .build()
            .await?;

        let (percent, recent) = modem.signal_quality().await?;
        let mask = modem.access_technologies().await?;
        debug!(
            "Modem {}: signal={}% (recent={}), access_tech=0x{:x}",
            path.as_str(),
            percent,
            recent,
            mask
        );

        sampler.on_signal_level(signal_bucket(percent));
        let (tech, override_type) = RadioTechnology::from_access_technologies(mask);
        sampler.on_network_type(tech, override_type);
        Ok(())
    }

    /// 启动轮询任务；采样器关闭时跳过 D-Bus 读取
    pub fn spawn(
        self,
        sampler: TelemetrySampler,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Modem watcher started (every {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !sampler.is_enabled() {
                            continue;
                        }
                        if let Err(e) = self.poll_once(&sampler).await {
                            warn!("Modem poll failed: {:#}", e);
                        }
                    }
                }
            }
            info!("Modem watcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_buckets() {
        assert_eq!(signal_bucket(0), 0);
        assert_eq!(signal_bucket(19), 0);
        assert_eq!(signal_bucket(20), 1);
        assert_eq!(signal_bucket(59), 2);
        assert_eq!(signal_bucket(79), 3);
        assert_eq!(signal_bucket(80), 4);
        assert_eq!(signal_bucket(100), 4);
    }

    #[tokio::test]
    #[ignore = "requires system D-Bus and ModemManager"]
    async fn test_first_modem() {
        let watcher = ModemWatcher::new().await.unwrap();
        println!("Modem: {:?}", watcher.first_modem().await.unwrap());
    }
}
