//! 应用配置和持久化
//!
//! BLE 适配器、热点接口、遥测周期、重连策略等设置，从 TOML 文件读取。

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::logging::LogLevel;

/// 连接重试次数上限
pub const MAX_CONNECT_RETRIES: u8 = 3;

/// 电池采样周期（秒）
pub const DEFAULT_BATTERY_INTERVAL_SECS: u64 = 300;

/// WiFi 频段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HotspotBand {
    /// 2.4GHz
    #[default]
    Bg,
    /// 5GHz
    A,
}

impl HotspotBand {
    /// NetworkManager `802-11-wireless.band` 取值
    pub fn nm_value(&self) -> &'static str {
        match self {
            HotspotBand::Bg => "bg",
            HotspotBand::A => "a",
        }
    }
}

/// 应用设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// BLE 适配器名称（如 hci0），为空时使用默认适配器
    pub adapter: Option<String>,
    /// 热点使用的 WiFi 接口
    pub wifi_interface: String,
    /// 热点频段
    pub hotspot_band: HotspotBand,
    /// 电池采样周期
    pub battery_interval_secs: u64,
    /// 蜂窝信号轮询周期
    pub modem_poll_secs: u64,
    /// 连接失败后的立即重试次数（上限 3）
    pub max_connect_retries: u8,
    /// 链路断开后自动重新扫描
    pub auto_reconnect: bool,
    /// 日志级别
    pub log_level: LogLevel,
    /// 配对记录路径（默认 `$XDG_DATA_HOME/tetherlink/record.json`）
    pub store_path: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            adapter: None,
            wifi_interface: "wlan0".to_string(),
            hotspot_band: HotspotBand::Bg,
            battery_interval_secs: DEFAULT_BATTERY_INTERVAL_SECS,
            modem_poll_secs: 10,
            max_connect_retries: MAX_CONNECT_RETRIES,
            auto_reconnect: true,
            log_level: LogLevel::Info,
            store_path: None,
        }
    }
}

impl AppSettings {
    /// `$XDG_CONFIG_HOME/tetherlink/settings.toml`
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tetherlink")
            .join("settings.toml")
    }

    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// 文件缺失或无法解析时回退到默认值
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!("Cannot read {}: {}, using defaults", path.display(), e);
                return Self::default();
            }
        };

        toml::from_str(&content)
            .inspect(|_| debug!("Settings loaded from {}", path.display()))
            .unwrap_or_else(|e| {
                warn!("Invalid settings in {}: {}, using defaults", path.display(), e);
                Self::default()
            })
    }

    /// 实际生效的重试次数，永远不超过 [`MAX_CONNECT_RETRIES`]
    pub fn connect_retries(&self) -> u8 {
        self.max_connect_retries.min(MAX_CONNECT_RETRIES)
    }

    pub fn battery_interval(&self) -> Duration {
        Duration::from_secs(self.battery_interval_secs.max(1))
    }

    pub fn modem_poll_interval(&self) -> Duration {
        Duration::from_secs(self.modem_poll_secs.max(1))
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(crate::store::FileStore::default_path)
    }
}
