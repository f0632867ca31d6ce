use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use serde_json::Value;
use tokio::sync::Mutex;
use wom_common::RuntimeConfig;

/// On-disk state under the data directory: `runtime.json` for settings and
/// `devices.json` for the last configuration pushed by the server.
#[derive(Clone)]
pub struct ConfigStore {
    runtime_path: Arc<PathBuf>,
    devices_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl ConfigStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            devices_path: Arc::new(data_dir.join("devices.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_env() -> Self {
        let data_dir = std::env::var("WOM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.wom"));
        Self::new(data_dir)
    }

    pub async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// `None` when no configuration has been cached yet.
    pub async fn load_devices(&self) -> anyhow::Result<Option<Value>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.devices_path.as_ref()).await {
            Ok(raw) => Ok(Some(serde_json::from_slice::<Value>(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save_devices(&self, document: &Value) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.devices_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("wom-{tag}-{:016x}", rand::random::<u64>()))
}
