//! Tetherlink Core Library
//!
//! 手机与桌面端的配对、链路维护、热点凭据交换和遥测上报引擎
//!
//! # 模块
//!
//! - **ble**: 链路传输抽象、GATT 编解码、BlueZ 实现（`bluez` feature）
//! - **crypto**: 由共享 PIN 派生的 AES-256-CBC 凭据加密
//! - **hotspot**: 热点开关控制与 NetworkManager 绑定
//! - **telemetry**: 信号/网络类型/电量采样
//! - **link**: 扫描、连接、绑定、重试与连接状态机
//! - **engine**: 以上组件的组装和生命周期
//!
//! # 使用示例
//!
//! ```ignore
//! use tetherlink_core::store::RecordStore;
//! use tetherlink_core::{AppSettings, BluezTransport, Engine, EngineDeps, FileStore, NmTethering};
//!
//! let settings = AppSettings::load();
//! let store: Arc<dyn PairingStore> = Arc::new(FileStore::new(settings.store_path()));
//! let engine = Engine::init(
//!     EngineDeps {
//!         transport: Arc::new(BluezTransport::new().await?),
//!         store: store.clone(),
//!         tethering: NmTethering::resolve(RecordStore::new(store), &settings).await,
//!         battery: Arc::new(SysfsBattery::new()),
//!     },
//!     &settings,
//! );
//!
//! // 扫码配对
//! engine.pair_from_qr("c3b9b9e9-be4e-4abf-9200-770f88b59977", pin).await?;
//!
//! // 保存热点凭据，连上后自动发送
//! engine.save_hotspot_credentials("Home", "longpassword1").await?;
//!
//! engine.shutdown().await;
//! ```

pub mod ble;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod hotspot;
pub mod ipc;
pub mod link;
pub mod logging;
pub mod observable;
pub mod store;
pub mod telemetry;

// Engine re-exports
pub use engine::{Engine, EngineDeps, SaveError, SaveOutcome, SetupEvent};

// Link re-exports
pub use ble::mock::MockTransport;
pub use ble::{LinkTransport, PeerAddress, PeerCommand};
pub use link::{ConnectStatus, LinkError, LinkReport, PairError, PairingSession};

// Platform re-exports
pub use config::AppSettings;
pub use crypto::CredentialCipher;
pub use hotspot::{CapabilityResolution, HotspotController, HotspotCredentials, NmTethering};
pub use store::{FileStore, MemoryStore, PairingStore, PersistedRecord};
pub use telemetry::{ModemWatcher, SysfsBattery, TelemetrySampler};

#[cfg(feature = "bluez")]
pub use ble::bluez::BluezTransport;
