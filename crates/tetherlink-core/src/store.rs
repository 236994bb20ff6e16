//! 配对记录持久化
//!
//! 持久化记录是一个扁平的键值结构（JSON 对象），键名与桌面端约定一致：
//! `serviceUUID`, `sharedPIN`, `ssid`, `password`, `isSetupComplete`，
//! 以及用于检测无效保存的上一次凭据快照 `previousSsid` / `previousPassword`。
//! 缺失的键按空字符串 / `false` 处理。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedRecord {
    #[serde(rename = "serviceUUID")]
    pub service_uuid: String,
    #[serde(rename = "sharedPIN")]
    pub shared_pin: String,
    pub ssid: String,
    pub password: String,
    #[serde(rename = "isSetupComplete")]
    pub is_setup_complete: bool,
    #[serde(rename = "previousSsid")]
    pub previous_ssid: String,
    #[serde(rename = "previousPassword")]
    pub previous_password: String,
}

impl PersistedRecord {
    pub fn has_pairing(&self) -> bool {
        !self.service_uuid.is_empty() && !self.shared_pin.is_empty()
    }

    pub fn has_hotspot_credentials(&self) -> bool {
        !self.ssid.is_empty()
    }

    /// 保存新凭据，旧值移入 previous 快照
    pub fn replace_credentials(&mut self, ssid: &str, password: &str) {
        self.previous_ssid = std::mem::replace(&mut self.ssid, ssid.to_string());
        self.previous_password = std::mem::replace(&mut self.password, password.to_string());
    }

    /// 清除配对信息，保留热点凭据
    pub fn clear_pairing(&mut self) {
        self.service_uuid.clear();
        self.shared_pin.clear();
        self.is_setup_complete = false;
    }
}

/// 外部键值存储接口
#[async_trait]
pub trait PairingStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<PersistedRecord>;
    async fn save(&self, record: &PersistedRecord) -> anyhow::Result<()>;
}

/// 串行化 load-modify-save 的存储句柄
///
/// 配对、凭据保存、首连流程都会改写同一条记录，所有写入都经过这里。
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<dyn PairingStore>,
    write_lock: Arc<Mutex<()>>,
}

impl RecordStore {
    pub fn new(inner: Arc<dyn PairingStore>) -> Self {
        Self {
            inner,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load(&self) -> anyhow::Result<PersistedRecord> {
        self.inner.load().await
    }

    /// 读取记录、应用修改并写回，返回写入后的记录
    pub async fn update<F>(&self, f: F) -> anyhow::Result<PersistedRecord>
    where
        F: FnOnce(&mut PersistedRecord) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self.inner.load().await?;
        f(&mut record);
        self.inner.save(&record).await?;
        Ok(record)
    }
}

/// 基于 JSON 文件的存储
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 默认路径: `$XDG_DATA_HOME/tetherlink/record.json`
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tetherlink")
            .join("record.json")
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl PairingStore for FileStore {
    async fn load(&self) -> anyhow::Result<PersistedRecord> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No pairing record at {:?}, starting empty", self.path);
                return Ok(PersistedRecord::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };

        match serde_json::from_str(&content) {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!("Corrupt pairing record {:?}: {}, treating as empty", self.path, e);
                Ok(PersistedRecord::default())
            }
        }
    }

    async fn save(&self, record: &PersistedRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(record)?;

        // 原子写入: 临时文件 + rename
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        debug!("Saved pairing record to {:?}", self.path);
        Ok(())
    }
}

/// 内存存储（测试和临时运行）
#[derive(Default)]
pub struct MemoryStore {
    record: Mutex<PersistedRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: PersistedRecord) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }
}

#[async_trait]
impl PairingStore for MemoryStore {
    async fn load(&self) -> anyhow::Result<PersistedRecord> {
        Ok(self.record.lock().await.clone())
    }

    async fn save(&self, record: &PersistedRecord) -> anyhow::Result<()> {
        *self.record.lock().await = record.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_names() {
        let record = PersistedRecord {
            service_uuid: "c3b9b9e9-be4e-4abf-9200-770f88b59977".to_string(),
            shared_pin: "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee".to_string(),
            ssid: "Home".to_string(),
            password: "longpassword1".to_string(),
            is_setup_complete: true,
            ..Default::default()
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"serviceUUID\":"));
        assert!(json.contains("\"sharedPIN\":"));
        assert!(json.contains("\"isSetupComplete\":true"));
        assert!(!json.contains("service_uuid"));
    }

    #[test]
    fn test_missing_keys_default_to_empty() {
        let record: PersistedRecord = serde_json::from_str(r#"{"ssid":"Home"}"#).unwrap();
        assert_eq!(record.ssid, "Home");
        assert!(record.service_uuid.is_empty());
        assert!(!record.is_setup_complete);
        assert!(!record.has_pairing());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("tetherlink-test-{}", uuid::Uuid::new_v4()));
        let store = FileStore::new(dir.join("record.json"));

        assert_eq!(store.load().await.unwrap(), PersistedRecord::default());

        let record = PersistedRecord {
            service_uuid: "c3b9b9e9-be4e-4abf-9200-770f88b59977".to_string(),
            shared_pin: "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee".to_string(),
            ..Default::default()
        };
        store.save(&record).await.unwrap();
        assert_eq!(store.load().await.unwrap(), record);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_replace_credentials_keeps_snapshot() {
        let mut record = PersistedRecord::default();
        record.replace_credentials("Home", "longpassword1");
        record.replace_credentials("Office", "anotherpass");

        assert_eq!(record.ssid, "Office");
        assert_eq!(record.password, "anotherpass");
        assert_eq!(record.previous_ssid, "Home");
        assert_eq!(record.previous_password, "longpassword1");
    }

    #[tokio::test]
    async fn test_update_applies_changes() {
        let store = RecordStore::new(Arc::new(MemoryStore::new()));
        store.update(|r| r.ssid = "Home".to_string()).await.unwrap();
        let record = store
            .update(|r| r.is_setup_complete = true)
            .await
            .unwrap();

        assert_eq!(record.ssid, "Home");
        assert!(record.is_setup_complete);
    }
}
