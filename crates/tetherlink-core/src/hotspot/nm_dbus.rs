//! NetworkManager D-Bus 客户端
//!
//! 热点 = `mode=ap` 的无线连接配置。流程：写入配置，绑定到 WiFi 设备激活，
//! 轮询 `Connection.Active.State` 直到 ACTIVATED。
//!
//! ```ignore
//! let nm = NmClient::new().await?;
//! let conn = nm.create_hotspot("tetherlink-hotspot", "Home", "longpassword1", HotspotBand::Bg, "wlan0").await?;
//! let device = nm.wifi_device("wlan0").await?.expect("no wlan0");
//! let active = nm.activate_connection(&conn, &device).await?;
//! nm.wait_for_activation(&active, Duration::from_secs(15)).await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{debug, info};
use zbus::proxy;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

use crate::config::HotspotBand;

const NM_DEVICE_TYPE_WIFI: u32 = 2;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[proxy(
    interface = "org.freedesktop.NetworkManager",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager"
)]
trait NetworkManager {
    fn get_devices(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    fn activate_connection(
        &self,
        connection: &ObjectPath<'_>,
        device: &ObjectPath<'_>,
        specific_object: &ObjectPath<'_>,
    ) -> zbus::Result<OwnedObjectPath>;

    fn deactivate_connection(&self, active_connection: &ObjectPath<'_>) -> zbus::Result<()>;

    #[zbus(property)]
    fn version(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn active_connections(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Settings",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager/Settings"
)]
trait Settings {
    fn add_connection(
        &self,
        connection: HashMap<&str, HashMap<&str, Value<'_>>>,
    ) -> zbus::Result<OwnedObjectPath>;

    fn list_connections(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Settings.Connection",
    default_service = "org.freedesktop.NetworkManager"
)]
trait Profile {
    fn get_settings(&self) -> zbus::Result<HashMap<String, HashMap<String, OwnedValue>>>;

    fn delete(&self) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Device",
    default_service = "org.freedesktop.NetworkManager"
)]
trait Device {
    #[zbus(property)]
    fn interface(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn device_type(&self) -> zbus::Result<u32>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Connection.Active",
    default_service = "org.freedesktop.NetworkManager"
)]
trait Active {
    #[zbus(property)]
    fn id(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn state(&self) -> zbus::Result<u32>;

    /// 对应的配置路径
    #[zbus(property)]
    fn connection(&self) -> zbus::Result<OwnedObjectPath>;

    #[zbus(property)]
    fn devices(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
}

/// `NMActiveConnectionState`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    Unknown,
    Activating,
    Activated,
    Deactivating,
    Deactivated,
}

impl From<u32> for ActiveState {
    fn from(raw: u32) -> Self {
        match raw {
            1 => Self::Activating,
            2 => Self::Activated,
            3 => Self::Deactivating,
            4 => Self::Deactivated,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ActiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Deactivating => "deactivating",
            Self::Deactivated => "deactivated",
        };
        f.write_str(name)
    }
}

type Section<'a> = HashMap<&'a str, Value<'a>>;

fn section<'a>(entries: impl IntoIterator<Item = (&'a str, Value<'a>)>) -> Section<'a> {
    entries.into_iter().collect()
}

/// AP 模式热点的连接配置
///
/// 空密码 → 开放网络，不带 `802-11-wireless-security`。
/// `ipv4.method=shared` 让 NM 负责 DHCP 与 NAT。
pub fn build_hotspot_settings<'a>(
    id: &'a str,
    ssid: &'a str,
    password: &'a str,
    band: HotspotBand,
    interface: &'a str,
) -> HashMap<&'a str, Section<'a>> {
    let mut profile = HashMap::from([
        (
            "connection",
            section([
                ("id", Value::from(id)),
                ("type", Value::from("802-11-wireless")),
                ("autoconnect", Value::from(false)),
                ("interface-name", Value::from(interface)),
            ]),
        ),
        (
            "802-11-wireless",
            section([
                ("ssid", Value::from(ssid.as_bytes())),
                ("mode", Value::from("ap")),
                ("band", Value::from(band.nm_value())),
            ]),
        ),
        ("ipv4", section([("method", Value::from("shared"))])),
        ("ipv6", section([("method", Value::from("ignore"))])),
    ]);

    if !password.is_empty() {
        profile.insert(
            "802-11-wireless-security",
            section([
                ("key-mgmt", Value::from("wpa-psk")),
                ("psk", Value::from(password)),
            ]),
        );
    }

    profile
}

fn string_setting(
    settings: &HashMap<String, HashMap<String, OwnedValue>>,
    group: &str,
    key: &str,
) -> Option<String> {
    match settings.get(group)?.get(key)?.deref() {
        Value::Str(text) => Some(text.to_string()),
        _ => None,
    }
}

pub struct NmClient {
    bus: zbus::Connection,
}

impl NmClient {
    /// 连接系统总线并确认 NetworkManager 在线
    pub async fn new() -> Result<Self> {
        let bus = zbus::Connection::system()
            .await
            .context("System D-Bus unavailable")?;
        let version = NetworkManagerProxy::new(&bus)
            .await?
            .version()
            .await
            .context("NetworkManager is not running")?;
        info!("NetworkManager {} reachable", version);
        Ok(Self { bus })
    }

    async fn root(&self) -> Result<NetworkManagerProxy<'_>> {
        Ok(NetworkManagerProxy::new(&self.bus).await?)
    }

    async fn device(&self, path: &ObjectPath<'_>) -> Result<DeviceProxy<'_>> {
        Ok(DeviceProxy::builder(&self.bus).path(path.to_owned())?.build().await?)
    }

    async fn active(&self, path: &ObjectPath<'_>) -> Result<ActiveProxy<'_>> {
        Ok(ActiveProxy::builder(&self.bus).path(path.to_owned())?.build().await?)
    }

    async fn profile(&self, path: &ObjectPath<'_>) -> Result<ProfileProxy<'_>> {
        Ok(ProfileProxy::builder(&self.bus).path(path.to_owned())?.build().await?)
    }

    /// 按接口名查找 WiFi 设备的对象路径
    pub async fn wifi_device(&self, interface: &str) -> Result<Option<OwnedObjectPath>> {
        for path in self.root().await?.get_devices().await? {
            let device = self.device(&path).await?;
            if device.device_type().await.ok() == Some(NM_DEVICE_TYPE_WIFI)
                && device.interface().await.is_ok_and(|name| name == interface)
            {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    pub async fn create_hotspot(
        &self,
        id: &str,
        ssid: &str,
        password: &str,
        band: HotspotBand,
        interface: &str,
    ) -> Result<OwnedObjectPath> {
        let path = SettingsProxy::new(&self.bus)
            .await?
            .add_connection(build_hotspot_settings(id, ssid, password, band, interface))
            .await
            .with_context(|| format!("AddConnection for {id} rejected"))?;
        debug!("Hotspot profile stored at {}", path.as_str());
        Ok(path)
    }

    pub async fn activate_connection(
        &self,
        profile: &OwnedObjectPath,
        device: &OwnedObjectPath,
    ) -> Result<OwnedObjectPath> {
        let active = self
            .root()
            .await?
            .activate_connection(profile, device, &ObjectPath::from_static_str_unchecked("/"))
            .await
            .context("ActivateConnection failed")?;
        debug!("Activation started: {}", active.as_str());
        Ok(active)
    }

    /// 停用 id 匹配的活动连接；返回是否命中
    pub async fn deactivate_by_id(&self, id: &str) -> Result<bool> {
        let root = self.root().await?;
        for path in root.active_connections().await? {
            if self.active(&path).await?.id().await.is_ok_and(|name| name == id) {
                root.deactivate_connection(&path).await?;
                debug!("Deactivated {}", id);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// 删除 id 匹配的已保存配置；返回是否命中
    pub async fn delete_connection_by_name(&self, id: &str) -> Result<bool> {
        let listed = SettingsProxy::new(&self.bus).await?.list_connections().await?;
        for path in listed {
            let profile = self.profile(&path).await?;
            let Ok(settings) = profile.get_settings().await else {
                continue;
            };
            if string_setting(&settings, "connection", "id").as_deref() == Some(id) {
                profile.delete().await?;
                debug!("Removed profile {}", id);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// 已激活的 AP 连接所在的接口名
    pub async fn active_ap_interfaces(&self) -> Result<Vec<String>> {
        let mut found = Vec::new();

        for path in self.root().await?.active_connections().await? {
            let active = self.active(&path).await?;
            if ActiveState::from(active.state().await.unwrap_or(0)) != ActiveState::Activated {
                continue;
            }

            let settings_path: ObjectPath<'_> = active.connection().await?.into();
            let profile = self.profile(&settings_path).await?;
            let is_ap = profile
                .get_settings()
                .await
                .ok()
                .and_then(|s| string_setting(&s, "802-11-wireless", "mode"))
                .is_some_and(|mode| mode == "ap");
            if !is_ap {
                continue;
            }

            for device_path in active.devices().await.unwrap_or_default() {
                if let Ok(name) = self.device(&device_path).await?.interface().await {
                    found.push(name);
                }
            }
        }

        Ok(found)
    }

    /// 轮询直到 ACTIVATED；进入 deactivating/deactivated 或超时即失败
    pub async fn wait_for_activation(&self, path: &OwnedObjectPath, limit: Duration) -> Result<()> {
        let active = self.active(path).await?;
        let mut seen = ActiveState::Unknown;

        let polled = tokio::time::timeout(limit, async {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;
                let state = ActiveState::from(active.state().await.unwrap_or(0));
                if state != seen {
                    debug!("Activation {} -> {}", seen, state);
                    seen = state;
                }
                match state {
                    ActiveState::Activated => return Ok(()),
                    ActiveState::Deactivating | ActiveState::Deactivated => {
                        bail!("activation aborted ({state})")
                    }
                    _ => {}
                }
            }
        })
        .await;

        match polled {
            Ok(result) => result,
            Err(_) => bail!("activation timed out after {:?} (last state: {})", limit, seen),
        }
    }
}
