//! Tetherlink Daemon
//!
//! 后台守护进程，负责：
//! - BLE 扫描/连接/绑定（BlueZ）
//! - 热点开关（NetworkManager）
//! - 信号与电量采样（ModemManager / sysfs）
//! - 通过 Unix Socket 与 CLI 通信

mod ipc;
mod service;

use std::sync::Arc;

use anyhow::Result;
use tetherlink_core::AppSettings;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（tetherlink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let settings = AppSettings::load();

    // 初始化日志，RUST_LOG 优先
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.directive())),
        )
        .try_init();

    tracing::info!("Tetherlink Daemon starting...");

    let engine = service::start(&settings).await?;
    let stop = Arc::new(Notify::new());

    // 启动 IPC 服务器
    let ipc_handle = tokio::spawn(ipc::run_ipc_server(engine.clone(), stop.clone()));
    let reports_handle = tokio::spawn(service::log_reports(engine.clone()));

    tokio::select! {
        res = ipc_handle => {
            tracing::error!("IPC server exited: {:?}", res);
        }
        _ = stop.notified() => {
            tracing::info!("Stop requested over IPC");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    engine.shutdown().await;
    reports_handle.abort();
    let _ = std::fs::remove_file(tetherlink_core::ipc::socket_path());
    tracing::info!("Tetherlink Daemon stopped");
    Ok(())
}
