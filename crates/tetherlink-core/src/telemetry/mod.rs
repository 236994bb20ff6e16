//! 遥测采样
//!
//! 在桌面端打开“查看手机信息”时，观察信号强度、网络类型和电量，
//! 只在值变化时通过共享的 sink 上报。每条报告只带变化的通道，
//! 其余通道为哨兵值（`-1` / `""`）。
//!
//! 关闭时所有基线重置为哨兵值，因此重新打开后第一次观察到的值一定会上报。
//! 电量另有定时器（默认 5 分钟）并在打开时立即无条件上报一次。

pub mod battery;
pub mod modem;
pub mod network_type;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use battery::SysfsBattery;
pub use modem::ModemWatcher;
pub use network_type::{OverrideNetworkType, RadioTechnology, network_category};

/// 信号等级/电量的“未设置”哨兵
pub const UNSET: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySample {
    /// 0–3，或 [`UNSET`]
    pub signal_level: i32,
    /// 分类字符串，`""` 表示未变化
    pub network_type: String,
    /// 0–100，或 [`UNSET`]
    pub battery_percent: i32,
}

impl TelemetrySample {
    fn empty() -> Self {
        Self {
            signal_level: UNSET,
            network_type: String::new(),
            battery_percent: UNSET,
        }
    }

    pub fn signal(level: i32) -> Self {
        Self {
            signal_level: level,
            ..Self::empty()
        }
    }

    pub fn network(category: &str) -> Self {
        Self {
            network_type: category.to_string(),
            ..Self::empty()
        }
    }

    pub fn battery(percent: i32) -> Self {
        Self {
            battery_percent: percent,
            ..Self::empty()
        }
    }
}

/// 原始信号等级 0–4 压缩为 0–3
pub fn compress_signal_level(raw: i32) -> i32 {
    let scaled = ((raw as f64 + 1.0) / 5.0 * 4.0 + 0.5).floor() as i32 - 1;
    scaled.clamp(0, 3)
}

/// 报告出口
///
/// `push` 在采样器锁内调用，实现不能回调采样器。
pub trait TelemetrySink: Send + Sync {
    fn push(&self, sample: TelemetrySample);
}

impl TelemetrySink for mpsc::UnboundedSender<TelemetrySample> {
    fn push(&self, sample: TelemetrySample) {
        // 接收端已关闭说明链路管理器已退出
        let _ = self.send(sample);
    }
}

/// 电量来源
pub trait BatterySource: Send + Sync {
    fn read_percent(&self) -> Option<i32>;
}

struct Baselines {
    signal_level: i32,
    network_type: String,
    battery_percent: i32,
}

impl Default for Baselines {
    fn default() -> Self {
        Self {
            signal_level: UNSET,
            network_type: String::new(),
            battery_percent: UNSET,
        }
    }
}

#[derive(Default)]
struct SamplerState {
    enabled: bool,
    baselines: Baselines,
    timer: Option<CancellationToken>,
}

struct SamplerInner {
    sink: Arc<dyn TelemetrySink>,
    battery: Arc<dyn BatterySource>,
    battery_interval: Duration,
    state: Mutex<SamplerState>,
}

impl SamplerInner {
    fn lock(&self) -> MutexGuard<'_, SamplerState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn on_battery_percent(&self, percent: i32) {
        let percent = percent.clamp(0, 100);
        let mut state = self.lock();
        if !state.enabled || state.baselines.battery_percent == percent {
            return;
        }
        state.baselines.battery_percent = percent;
        self.sink.push(TelemetrySample::battery(percent));
    }
}

/// 遥测采样器
#[derive(Clone)]
pub struct TelemetrySampler {
    inner: Arc<SamplerInner>,
}

impl TelemetrySampler {
    pub fn new(
        sink: Arc<dyn TelemetrySink>,
        battery: Arc<dyn BatterySource>,
        battery_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SamplerInner {
                sink,
                battery,
                battery_interval,
                state: Mutex::new(SamplerState::default()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// 打开/关闭采样，重复设置同一值为空操作
    pub fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.enable();
        } else {
            self.disable();
        }
    }

    fn enable(&self) {
        {
            let mut state = self.inner.lock();
            if state.enabled {
                return;
            }
            state.enabled = true;
            state.baselines = Baselines::default();

            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let cancel = CancellationToken::new();
                    state.timer = Some(cancel.clone());
                    handle.spawn(battery_loop(self.inner.clone(), cancel));
                }
                Err(e) => warn!("No runtime for battery timer: {}", e),
            }
        }
        debug!("Telemetry enabled");

        // 打开时立即上报一次电量，不做变化检测
        if let Some(percent) = self.inner.battery.read_percent() {
            let percent = percent.clamp(0, 100);
            let mut state = self.inner.lock();
            // 读取期间可能已被关闭
            if !state.enabled {
                return;
            }
            state.baselines.battery_percent = percent;
            self.inner.sink.push(TelemetrySample::battery(percent));
        }
    }

    fn disable(&self) {
        let mut state = self.inner.lock();
        if !state.enabled {
            return;
        }
        state.enabled = false;
        state.baselines = Baselines::default();
        if let Some(cancel) = state.timer.take() {
            cancel.cancel();
        }
        debug!("Telemetry disabled");
    }

    /// 原始信号等级 (0–4)
    pub fn on_signal_level(&self, raw: i32) {
        let level = compress_signal_level(raw);
        let mut state = self.inner.lock();
        if !state.enabled || state.baselines.signal_level == level {
            return;
        }
        state.baselines.signal_level = level;
        self.inner.sink.push(TelemetrySample::signal(level));
    }

    pub fn on_network_type(&self, tech: RadioTechnology, override_type: OverrideNetworkType) {
        let category = network_category(tech, override_type);
        let mut state = self.inner.lock();
        if !state.enabled || state.baselines.network_type == category {
            return;
        }
        state.baselines.network_type = category.to_string();
        // "" 在线路上等同于“未变化”，只更新基线，恢复到已知制式时会再次上报
        if !category.is_empty() {
            self.inner.sink.push(TelemetrySample::network(category));
        }
    }

    pub fn on_battery_percent(&self, percent: i32) {
        self.inner.on_battery_percent(percent);
    }
}

async fn battery_loop(inner: Arc<SamplerInner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.battery_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // 跳过立即触发的第一次 tick，打开时已经采样过
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Some(percent) = inner.battery.read_percent() {
                    inner.on_battery_percent(percent);
                }
            }
        }
    }
}
