// 配置存储：启动时加载，请求期间按需读取最新快照，支持运行时重新加载。
use crate::config::{config_path_default, load_config_from, override_path_default, Config};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<Config>>,
    base_path: Option<PathBuf>,
    override_path: Option<PathBuf>,
    version: Arc<AtomicU64>,
}

impl ConfigStore {
    pub fn new() -> Self {
        let base_path = config_path_default();
        let override_path = override_path_default();
        let config = load_config_from(&base_path, Some(&override_path));
        Self {
            inner: Arc::new(RwLock::new(config)),
            base_path: Some(base_path),
            override_path: Some(override_path),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    /// In-memory store with no backing file; `reload` keeps the current value.
    pub fn from_config(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            base_path: None,
            override_path: None,
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get(&self) -> Config {
        self.inner.read().await.clone()
    }

    pub async fn update<F>(&self, updater: F) -> Config
    where
        F: FnOnce(&mut Config),
    {
        let mut guard = self.inner.write().await;
        updater(&mut guard);
        let updated = guard.clone();
        drop(guard);
        self.version.fetch_add(1, Ordering::SeqCst);
        updated
    }

    pub async fn reload(&self) -> Config {
        let Some(base_path) = self.base_path.as_deref() else {
            return self.get().await;
        };
        let config = load_config_from(base_path, self.override_path.as_deref());
        let mut guard = self.inner.write().await;
        *guard = config.clone();
        drop(guard);
        self.version.fetch_add(1, Ordering::SeqCst);
        info!(path = %base_path.display(), "config reloaded");
        config
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_bumps_version_and_is_visible() {
        let store = ConfigStore::from_config(Config::default());
        assert_eq!(store.version(), 0);
        store
            .update(|config| config.channels.onebot.base.http_url = "http://bot".to_string())
            .await;
        assert_eq!(store.version(), 1);
        assert_eq!(store.get().await.channels.onebot.base.http_url, "http://bot");
        store.reload().await;
        assert_eq!(store.get().await.channels.onebot.base.http_url, "http://bot");
    }
}
