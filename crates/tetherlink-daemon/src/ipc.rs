//! IPC Server - Unix Domain Socket 通信

use std::sync::Arc;

use anyhow::Result;
use tetherlink_core::ipc::{IpcRequest, IpcResponse, StatusInfo, socket_path};
use tetherlink_core::{Engine, SaveError, SaveOutcome};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

pub async fn run_ipc_server(engine: Arc<Engine>, stop: Arc<Notify>) -> Result<()> {
    let path = socket_path();

    // 删除旧的 socket 文件
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    tracing::info!("IPC 服务器已启动: {:?}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let engine = engine.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, engine, stop).await {
                        tracing::debug!("IPC client error: {:#}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("接受连接失败: {}", e);
            }
        }
    }
}

async fn handle_client(stream: UnixStream, engine: Arc<Engine>, stop: Arc<Notify>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => {
                tracing::debug!("收到请求: {:?}", request);
                let stopping = request == IpcRequest::Stop;
                let response = dispatch(&engine, request).await;
                if stopping {
                    stop.notify_one();
                }
                response
            }
            Err(e) => IpcResponse::error(format!("Invalid request: {}", e)),
        };

        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
        line.clear();
    }

    Ok(())
}

async fn dispatch(engine: &Engine, request: IpcRequest) -> IpcResponse {
    match request {
        IpcRequest::Status => match status(engine).await {
            Ok(info) => IpcResponse::Status(info),
            Err(e) => IpcResponse::error(format!("Failed to read status: {:#}", e)),
        },
        IpcRequest::Pair {
            service_uuid,
            shared_pin,
        } => match engine.pair_from_qr(&service_uuid, &shared_pin).await {
            Ok(()) => IpcResponse::ok(format!("已配对，正在扫描 {}", service_uuid)),
            Err(e) => IpcResponse::error(e.to_string()),
        },
        IpcRequest::PairQr { payload } => match engine.pair_qr_payload(&payload).await {
            Ok(()) => IpcResponse::ok("已配对，正在扫描"),
            Err(e) => IpcResponse::error(e.to_string()),
        },
        IpcRequest::SaveHotspot { ssid, password } => {
            match engine.save_hotspot_credentials(&ssid, &password).await {
                Ok(SaveOutcome::Unchanged) => IpcResponse::ok("热点凭据未变化"),
                Ok(SaveOutcome::Sent) => IpcResponse::ok("热点凭据已发送"),
                Ok(SaveOutcome::Deferred) => IpcResponse::ok("热点凭据已保存，连接后发送"),
                Err(SaveError::Invalid(e)) => IpcResponse::error(format!("无效的热点凭据: {}", e)),
                Err(e) => IpcResponse::error(e.to_string()),
            }
        }
        IpcRequest::Unpair => match engine.unpair().await {
            Ok(()) => IpcResponse::ok("已解除配对"),
            Err(e) => IpcResponse::error(e.to_string()),
        },
        IpcRequest::Stop => {
            tracing::info!("停止守护进程");
            IpcResponse::ok("已停止")
        }
    }
}

async fn status(engine: &Engine) -> Result<StatusInfo> {
    let record = engine.record().await?;
    let link = engine.link();

    Ok(StatusInfo {
        status: engine.status(),
        paired: record.has_pairing(),
        setup_complete: record.is_setup_complete,
        peer: link.device_link().await.map(|l| l.peer.to_string()),
        scanning: link.is_scanning().await,
        hotspot_supported: engine.hotspot_supported(),
        ssid: record.ssid,
    })
}
