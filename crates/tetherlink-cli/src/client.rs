//! 守护进程 socket 客户端：一行 JSON 请求，一行 JSON 响应

use anyhow::{Context, Result, bail};
use tetherlink_core::ipc::{IpcRequest, IpcResponse, socket_path};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

pub async fn send_request(request: IpcRequest) -> Result<IpcResponse> {
    let path = socket_path();
    let mut stream = BufReader::new(UnixStream::connect(&path).await.with_context(|| {
        format!(
            "cannot reach tetherlink-daemon at {} (is it running?)",
            path.display()
        )
    })?);

    let mut frame = serde_json::to_vec(&request)?;
    frame.push(b'\n');
    stream.get_mut().write_all(&frame).await?;

    let mut reply = String::new();
    if stream.read_line(&mut reply).await? == 0 {
        bail!("daemon closed the connection without replying");
    }
    let response: IpcResponse = serde_json::from_str(&reply).context("malformed daemon reply")?;

    match &response {
        IpcResponse::Ok { message } => println!("✅ {}", message),
        IpcResponse::Error { message } => eprintln!("❌ {}", message),
        IpcResponse::Status(_) => {}
    }

    Ok(response)
}
