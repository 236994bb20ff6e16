//! 守护进程与 CLI 之间的 IPC 消息
//!
//! Unix Domain Socket 上每行一个 JSON 对象，按 `type` 字段区分。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::link::ConnectStatus;

pub fn socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("tetherlink.sock")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IpcRequest {
    Status,
    Pair {
        service_uuid: String,
        shared_pin: String,
    },
    /// 二维码 JSON 原文
    PairQr { payload: String },
    SaveHotspot { ssid: String, password: String },
    Unpair,
    Stop,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IpcResponse {
    Ok { message: String },
    Error { message: String },
    Status(StatusInfo),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    pub status: ConnectStatus,
    pub paired: bool,
    pub setup_complete: bool,
    pub peer: Option<String>,
    pub scanning: bool,
    pub hotspot_supported: bool,
    /// 已保存的 SSID，未保存时为空
    pub ssid: String,
}

impl IpcResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        IpcResponse::Ok {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        IpcResponse::Error {
            message: message.into(),
        }
    }
}
