//! 热点控制器
//!
//! 通过平台的特权能力启动/停止网络共享（WiFi 热点）。
//!
//! # 平台能力
//!
//! 共享接口在不同平台/系统版本上差异很大，因此抽象为 [`TetheringCapability`]，
//! 在运行时解析为 [`CapabilityResolution::Supported`] 或
//! [`CapabilityResolution::Unsupported`]。能力缺失不会导致编译或启动失败，
//! 只会在调用时降级为日志 + 返回 `false`。
//!
//! # 开关保护
//!
//! 在共享已经开启时再次调用 start，某些平台会把共享关掉。
//! 因此 [`HotspotController::start_tethering`] 在已有共享接口时直接返回 `false`。

pub mod credentials;
pub mod network_manager;
pub mod nm_dbus;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::{debug, info, warn};

pub use credentials::{CredentialsError, HotspotCredentials};
pub use network_manager::NmTethering;

/// 共享的传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Wifi,
    Usb,
    Bluetooth,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TetherError {
    #[error("Tethering unsupported: {0}")]
    Unsupported(String),

    #[error("Tethering failed: {0}")]
    Failed(String),
}

/// 共享启动结果回调
pub trait TetheringCallback: Send + Sync {
    fn on_tethering_started(&self);
    fn on_tethering_failed(&self);
}

/// 平台特权共享能力
#[async_trait]
pub trait TetheringCapability: Send + Sync {
    /// 当前正在共享的接口名
    async fn tethered_interfaces(&self) -> anyhow::Result<Vec<String>>;

    /// 派发启动请求，结果通过 `callback` 异步返回
    ///
    /// 返回 `Err` 表示请求根本无法派发。
    fn start_tethering(
        &self,
        kind: TransportKind,
        exclusive: bool,
        callback: Arc<dyn TetheringCallback>,
    ) -> Result<(), TetherError>;

    async fn stop_tethering(&self, kind: TransportKind) -> Result<(), TetherError>;
}

/// 运行时解析结果
pub enum CapabilityResolution {
    Supported(Arc<dyn TetheringCapability>),
    Unsupported(String),
}

/// 本引擎开启的共享所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnState {
    Off,
    /// 已派发，等待平台回调
    Starting,
    /// 启动途中收到 stop，回调到达后立即关闭
    Cancelled,
    On,
}

type SharedState = Arc<Mutex<OwnState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, OwnState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 平台回调的包装：更新 [`OwnState`]，被取消的启动在完成后立刻关掉
struct MarkStarted {
    state: SharedState,
    capability: Arc<dyn TetheringCapability>,
    inner: Arc<dyn TetheringCallback>,
}

impl TetheringCallback for MarkStarted {
    fn on_tethering_started(&self) {
        let cancelled = {
            let mut state = lock(&self.state);
            let cancelled = *state == OwnState::Cancelled;
            *state = if cancelled { OwnState::Off } else { OwnState::On };
            cancelled
        };

        if !cancelled {
            self.inner.on_tethering_started();
            return;
        }

        info!("Tethering came up after stop was requested, shutting it down");
        let capability = self.capability.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = capability.stop_tethering(TransportKind::Wifi).await {
                        warn!("Failed to stop tethering: {}", e);
                    }
                });
            }
            Err(e) => warn!("Cannot stop late tethering without a runtime: {}", e),
        }
    }

    fn on_tethering_failed(&self) {
        let cancelled = {
            let mut state = lock(&self.state);
            let cancelled = *state == OwnState::Cancelled;
            *state = OwnState::Off;
            cancelled
        };
        if !cancelled {
            self.inner.on_tethering_failed();
        }
    }
}

pub struct HotspotController {
    capability: Option<Arc<dyn TetheringCapability>>,
    unsupported_reason: Option<String>,
    state: SharedState,
}

impl HotspotController {
    pub fn new(resolution: CapabilityResolution) -> Self {
        let (capability, unsupported_reason) = match resolution {
            CapabilityResolution::Supported(cap) => (Some(cap), None),
            CapabilityResolution::Unsupported(reason) => {
                warn!("Tethering capability unavailable: {}", reason);
                (None, Some(reason))
            }
        };

        Self {
            capability,
            unsupported_reason,
            state: Arc::new(Mutex::new(OwnState::Off)),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.capability.is_some()
    }

    pub fn is_started_by_us(&self) -> bool {
        *lock(&self.state) == OwnState::On
    }

    /// 是否存在正在共享的接口
    pub async fn is_tether_active(&self) -> bool {
        let Some(capability) = &self.capability else {
            return false;
        };

        match capability.tethered_interfaces().await {
            Ok(interfaces) => {
                debug!("Tethered interfaces: {:?}", interfaces);
                !interfaces.is_empty()
            }
            Err(e) => {
                warn!("Failed to query tethered interfaces: {}", e);
                false
            }
        }
    }

    /// 启动 WiFi 共享
    ///
    /// 已在共享、已有启动在途或无法派发请求时返回 `false`，此时不会调用 `callback`。
    pub async fn start_tethering(&self, callback: Arc<dyn TetheringCallback>) -> bool {
        let Some(capability) = &self.capability else {
            warn!(
                "TetheringUnsupported: {}",
                self.unsupported_reason.as_deref().unwrap_or("no capability")
            );
            return false;
        };

        if self.is_tether_active().await {
            info!("Tethering already active, not toggling");
            return false;
        }

        {
            let mut state = lock(&self.state);
            if matches!(*state, OwnState::Starting | OwnState::Cancelled) {
                info!("Tethering start already in flight");
                return false;
            }
            // 平台可能在派发过程中同步回调
            *state = OwnState::Starting;
        }

        let callback = Arc::new(MarkStarted {
            state: self.state.clone(),
            capability: capability.clone(),
            inner: callback,
        });

        match capability.start_tethering(TransportKind::Wifi, true, callback) {
            Ok(()) => {
                info!("Tethering start dispatched");
                true
            }
            Err(e) => {
                *lock(&self.state) = OwnState::Off;
                warn!("TetheringUnsupported: {}", e);
                false
            }
        }
    }

    /// 停止由本引擎开启的共享；未开启时为空操作
    ///
    /// 启动仍在途时只做标记，平台回调成功后再关闭。
    pub async fn stop_tethering(&self) {
        let previous = {
            let mut state = lock(&self.state);
            let previous = *state;
            *state = match previous {
                OwnState::Starting | OwnState::Cancelled => OwnState::Cancelled,
                OwnState::Off | OwnState::On => OwnState::Off,
            };
            previous
        };

        match previous {
            OwnState::Off => {
                debug!("Tethering not started by us, nothing to stop");
                return;
            }
            OwnState::Starting | OwnState::Cancelled => {
                info!("Tethering start in flight, stopping once it completes");
                return;
            }
            OwnState::On => {}
        }

        let Some(capability) = &self.capability else {
            return;
        };

        match capability.stop_tethering(TransportKind::Wifi).await {
            Ok(()) => info!("Tethering stopped"),
            Err(e) => warn!("Failed to stop tethering: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 可编程的假能力：记录调用次数，按配置同步回调成功/失败
    struct FakeCapability {
        interfaces: Mutex<Vec<String>>,
        start_calls: AtomicUsize,
        stop_calls: AtomicUsize,
        dispatch_error: Option<TetherError>,
        succeed: bool,
        /// 为 true 时回调留到 [`FakeCapability::finish_start`]
        deferred: bool,
        pending: Mutex<Option<Arc<dyn TetheringCallback>>>,
    }

    impl FakeCapability {
        fn new(succeed: bool) -> Self {
            Self {
                interfaces: Mutex::new(Vec::new()),
                start_calls: AtomicUsize::new(0),
                stop_calls: AtomicUsize::new(0),
                dispatch_error: None,
                succeed,
                deferred: false,
                pending: Mutex::new(None),
            }
        }

        fn deferred() -> Self {
            Self {
                deferred: true,
                ..Self::new(true)
            }
        }

        /// 平台完成启动：接口上线，然后回调
        fn finish_start(&self) {
            let callback = self.pending.lock().unwrap().take().expect("no start pending");
            self.interfaces.lock().unwrap().push("wlan0".to_string());
            callback.on_tethering_started();
        }
    }

    #[async_trait]
    impl TetheringCapability for FakeCapability {
        async fn tethered_interfaces(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.interfaces.lock().unwrap().clone())
        }

        fn start_tethering(
            &self,
            _kind: TransportKind,
            _exclusive: bool,
            callback: Arc<dyn TetheringCallback>,
        ) -> Result<(), TetherError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = &self.dispatch_error {
                return Err(e.clone());
            }
            if self.deferred {
                *self.pending.lock().unwrap() = Some(callback);
            } else if self.succeed {
                self.interfaces.lock().unwrap().push("wlan0".to_string());
                callback.on_tethering_started();
            } else {
                callback.on_tethering_failed();
            }
            Ok(())
        }

        async fn stop_tethering(&self, _kind: TransportKind) -> Result<(), TetherError> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.interfaces.lock().unwrap().clear();
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingCallback {
        started: AtomicUsize,
        failed: AtomicUsize,
    }

    impl TetheringCallback for RecordingCallback {
        fn on_tethering_started(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_tethering_failed(&self) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_start_when_already_active_is_noop() {
        let cap = Arc::new(FakeCapability::new(true));
        cap.interfaces.lock().unwrap().push("ap0".to_string());
        let controller = HotspotController::new(CapabilityResolution::Supported(cap.clone()));
        let cb = Arc::new(RecordingCallback::default());

        assert!(!controller.start_tethering(cb.clone()).await);
        assert_eq!(cap.start_calls.load(Ordering::SeqCst), 0);
        assert_eq!(cb.started.load(Ordering::SeqCst), 0);
        assert!(!controller.is_started_by_us());
    }

    #[tokio::test]
    async fn test_start_success_marks_started_by_us() {
        let cap = Arc::new(FakeCapability::new(true));
        let controller = HotspotController::new(CapabilityResolution::Supported(cap.clone()));
        let cb = Arc::new(RecordingCallback::default());

        assert!(controller.start_tethering(cb.clone()).await);
        assert_eq!(cb.started.load(Ordering::SeqCst), 1);
        assert!(controller.is_started_by_us());
        assert!(controller.is_tether_active().await);

        controller.stop_tethering().await;
        assert_eq!(cap.stop_calls.load(Ordering::SeqCst), 1);
        assert!(!controller.is_started_by_us());
    }

    #[tokio::test]
    async fn test_start_failure_invokes_failed_callback() {
        let cap = Arc::new(FakeCapability::new(false));
        let controller = HotspotController::new(CapabilityResolution::Supported(cap));
        let cb = Arc::new(RecordingCallback::default());

        assert!(controller.start_tethering(cb.clone()).await);
        assert_eq!(cb.failed.load(Ordering::SeqCst), 1);
        assert!(!controller.is_started_by_us());
    }

    #[tokio::test]
    async fn test_dispatch_failure_returns_false() {
        let mut cap = FakeCapability::new(true);
        cap.dispatch_error = Some(TetherError::Unsupported("signature mismatch".to_string()));
        let controller = HotspotController::new(CapabilityResolution::Supported(Arc::new(cap)));
        let cb = Arc::new(RecordingCallback::default());

        assert!(!controller.start_tethering(cb.clone()).await);
        assert_eq!(cb.started.load(Ordering::SeqCst), 0);
        assert_eq!(cb.failed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsupported_platform_degrades() {
        let controller = HotspotController::new(CapabilityResolution::Unsupported(
            "NetworkManager not running".to_string(),
        ));
        let cb = Arc::new(RecordingCallback::default());

        assert!(!controller.is_supported());
        assert!(!controller.is_tether_active().await);
        assert!(!controller.start_tethering(cb).await);
        // 未开启时停止是空操作
        controller.stop_tethering().await;
    }

    #[tokio::test]
    async fn test_stop_without_start_does_not_touch_platform() {
        let cap = Arc::new(FakeCapability::new(true));
        cap.interfaces.lock().unwrap().push("ap0".to_string());
        let controller = HotspotController::new(CapabilityResolution::Supported(cap.clone()));

        controller.stop_tethering().await;
        assert_eq!(cap.stop_calls.load(Ordering::SeqCst), 0);
        assert!(controller.is_tether_active().await);
    }

    #[tokio::test]
    async fn test_stop_while_starting_shuts_down_late_start() {
        let cap = Arc::new(FakeCapability::deferred());
        let controller = HotspotController::new(CapabilityResolution::Supported(cap.clone()));
        let cb = Arc::new(RecordingCallback::default());

        assert!(controller.start_tethering(cb.clone()).await);
        controller.stop_tethering().await;
        assert_eq!(cap.stop_calls.load(Ordering::SeqCst), 0);

        cap.finish_start();
        for _ in 0..10 {
            if cap.stop_calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(cap.stop_calls.load(Ordering::SeqCst), 1);
        assert!(!controller.is_tether_active().await);
        assert!(!controller.is_started_by_us());
        assert_eq!(cb.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_start_while_in_flight_is_rejected() {
        let cap = Arc::new(FakeCapability::deferred());
        let controller = HotspotController::new(CapabilityResolution::Supported(cap.clone()));
        let cb = Arc::new(RecordingCallback::default());

        assert!(controller.start_tethering(cb.clone()).await);
        assert!(!controller.start_tethering(cb.clone()).await);
        assert_eq!(cap.start_calls.load(Ordering::SeqCst), 1);

        cap.finish_start();
        assert_eq!(cb.started.load(Ordering::SeqCst), 1);
        assert!(controller.is_started_by_us());

        controller.stop_tethering().await;
        assert_eq!(cap.stop_calls.load(Ordering::SeqCst), 1);
    }
}
