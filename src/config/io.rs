use std::env::current_exe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::{Mutex, PoisonError};
use directories_next::ProjectDirs;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{info, warn};
use std::fs::OpenOptions;
use std::str;

use crate::config::types::Config;
use crate::error::ConfigError;

// <executable name>.json next to the executable
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "ble-session", "ble-session").map(|dirs| {
        dirs.config_dir().join("ble-session.json")
    })
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    match get_portable_config_path().filter(|path| path.is_file()) {
        Some(path) => Ok(path),
        None => {
            info!("No portable config file; using the local config directory instead.");
            get_local_config_path().ok_or(ConfigError::NoConfigPath)
        },
    }
}

pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    /// Holding the returned guard keeps other instances from using the same config file.
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<std::fs::File>, ConfigError> {
        self.rw_lock.try_write().map_err(|source| ConfigError::CanNotLock { source })
    }
}

struct ConfigIOInner {
    file: std::fs::File,
}

#[derive(Clone)]
pub struct ConfigIO {
    inner: Arc<Mutex<ConfigIOInner>>,
}

impl ConfigIO {
    pub fn new_sync() -> Result<Self, ConfigError> {
        let path = get_config_path()?;
        info!("Using config file {}", path.to_string_lossy());
        Self::open(path)
    }

    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        let directory = path.parent().ok_or(ConfigError::NoConfigPath)?;
        std::fs::create_dir_all(directory)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .append(false)
            .create(true)
            .open(path)?;

        let inner = ConfigIOInner {
            file,
        };
        Ok(ConfigIO { inner: Arc::new(Mutex::new(inner)) })
    }

    pub fn locker(&self) -> Result<ConfigIOLocker, ConfigError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        Ok(ConfigIOLocker {
            rw_lock: RwLock::new(inner.file.try_clone()?),
        })
    }

    // a clone of the locked handle; the original stays open for the lifetime of ConfigIO
    fn get_file(&self) -> Result<File, ConfigError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(File::from_std(inner.file.try_clone()?))
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        let mut file = self.get_file()?;
        info!("Reading config file");

        let mut content = vec![];
        file.rewind().await?;
        file.read_to_end(&mut content).await?;

        if content.is_empty() {
            return Ok(Config::default());
        }

        let content = str::from_utf8(&content)?;
        Ok(serde_json::from_str(content)?)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let mut file = self.get_file()?;
        info!("Saving config");

        let content = serde_json::to_string_pretty(config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
        std::env::temp_dir()
            .join(format!("ble-session-test-{}-{}", std::process::id(), nanos))
            .join(name)
    }

    #[tokio::test]
    async fn empty_file_reads_as_defaults() {
        let io = ConfigIO::open(scratch_path("empty.json")).expect("open");
        assert_eq!(io.read().await.expect("read"), Config::default());
    }

    #[tokio::test]
    async fn saved_config_reads_back() {
        let io = ConfigIO::open(scratch_path("saved.json")).expect("open");
        let config = Config { scan_seconds: 7, rssi_failure_fatal: false, ..Config::default() };

        io.save(&config).await.expect("save");
        assert_eq!(io.read().await.expect("read"), config);
    }

    #[tokio::test]
    async fn invalid_json_is_reported() {
        let path = scratch_path("broken.json");
        let io = ConfigIO::open(path.clone()).expect("open");
        std::fs::write(&path, "{ not json").expect("write");

        assert!(matches!(io.read().await, Err(ConfigError::JsonError { .. })));
    }
}
