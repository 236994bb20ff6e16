//! Tetherlink CLI
//!
//! 命令行客户端，通过 Unix Socket 与守护进程通信

mod client;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tetherlink_core::ipc::{IpcRequest, IpcResponse};

#[derive(Parser)]
#[command(name = "tetherlink", version, about = "手机热点与桌面端的配对和共享")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 使用服务 UUID 和共享 PIN 配对
    Pair {
        /// 桌面端广播的服务 UUID
        service_uuid: String,
        /// 共享 PIN（UUID 格式）
        shared_pin: String,
    },
    /// 使用二维码 JSON 配对
    PairQr {
        /// `{"serviceUUID": "...", "sharedPIN": "..."}`
        payload: String,
    },
    /// 保存热点凭据，连接后发送给桌面端
    Hotspot {
        ssid: String,
        #[arg(default_value = "")]
        password: String,
    },
    /// 查看当前状态
    Status,
    /// 解除配对
    Unpair,
    /// 停止守护进程
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Pair {
            service_uuid,
            shared_pin,
        } => {
            println!("🔗 配对: {}", service_uuid);
            client::send_request(IpcRequest::Pair {
                service_uuid,
                shared_pin,
            })
            .await?;
        }
        Commands::PairQr { payload } => {
            client::send_request(IpcRequest::PairQr { payload }).await?;
        }
        Commands::Hotspot { ssid, password } => {
            println!("📶 热点: {}", ssid);
            client::send_request(IpcRequest::SaveHotspot { ssid, password }).await?;
        }
        Commands::Status => {
            let resp = client::send_request(IpcRequest::Status).await?;
            if let IpcResponse::Status(info) = resp {
                println!("状态: {:?}", info.status);
                println!("已配对: {}", if info.paired { "是" } else { "否" });
                println!("首次配置完成: {}", if info.setup_complete { "是" } else { "否" });
                if let Some(peer) = &info.peer {
                    println!("桌面端: {}", peer);
                } else if info.scanning {
                    println!("桌面端: 扫描中...");
                }
                if !info.ssid.is_empty() {
                    println!("热点: {}", info.ssid);
                }
                if !info.hotspot_supported {
                    println!("⚠️  当前系统不支持热点控制");
                }
            }
        }
        Commands::Unpair => {
            client::send_request(IpcRequest::Unpair).await?;
        }
        Commands::Stop => {
            println!("⏹️  停止守护进程");
            client::send_request(IpcRequest::Stop).await?;
        }
    }

    Ok(())
}
