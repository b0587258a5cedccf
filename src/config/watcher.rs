//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::{load_config, ConfigOverrides};
use crate::config::schema::ProxyConfig;

/// Reloads the configuration file whenever it changes on disk.
pub struct ConfigWatcher {
    path: PathBuf,
    overrides: ConfigOverrides,
    update_tx: mpsc::UnboundedSender<ProxyConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiver the reloaded configs arrive on.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ProxyConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                overrides: ConfigOverrides::default(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Applies `overrides` to every reloaded config before it is published.
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Starts watching. The returned handle must be kept alive.
    ///
    /// The parent directory is watched so editors that replace the file
    /// (write to a temp file, then rename) are still seen.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self {
            path,
            overrides,
            update_tx,
        } = self;
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(ToOwned::to_owned);
        let target = path.clone();
        let mut last_applied: Option<ProxyConfig> = None;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create()) {
                        return;
                    }
                    if !event.paths.iter().any(|p| p.file_name() == file_name.as_deref()) {
                        return;
                    }
                    let loaded = load_config(&target).map(|mut config| {
                        overrides.apply(&mut config);
                        config
                    });
                    match loaded {
                        Ok(config) if last_applied.as_ref() == Some(&config) => {}
                        Ok(config) => {
                            tracing::info!(path = ?target, "Configuration reloaded");
                            last_applied = Some(config.clone());
                            let _ = update_tx.send(config);
                        }
                        Err(e) => {
                            tracing::error!(path = ?target, error = %e, "Failed to reload config, keeping current configuration");
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&directory, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn reloads_valid_changes_only() {
        let dir = std::env::temp_dir().join(format!("intercept-proxy-watch-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("proxy.toml");
        fs::write(&path, "[interception]\ndecrypt_https = false\n").unwrap();

        let (watcher, mut updates) = ConfigWatcher::new(&path);
        let _handle = watcher.run().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        fs::write(&path, "[listener]\nmax_connections = 0\n").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        fs::write(&path, "[interception]\nhandle_upgrade = true\n").unwrap();

        let reloaded = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let config = updates.recv().await.unwrap();
                assert_ne!(config.listener.max_connections, 0, "invalid config published");
                if config.interception.handle_upgrade {
                    return config;
                }
            }
        })
        .await
        .unwrap();
        assert!(!reloaded.interception.decrypt_https);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn reloads_keep_command_line_overrides() {
        let dir = std::env::temp_dir().join(format!("intercept-proxy-overrides-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("proxy.toml");
        fs::write(&path, "[listener]\nbind_address = \"0.0.0.0:8080\"\n").unwrap();

        let (watcher, mut updates) = ConfigWatcher::new(&path);
        let _handle = watcher
            .with_overrides(ConfigOverrides {
                bind_address: Some("127.0.0.1:9999".to_owned()),
            })
            .run()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        fs::write(
            &path,
            "[listener]\nbind_address = \"0.0.0.0:8080\"\n[interception]\nhandle_upgrade = true\n",
        )
        .unwrap();

        let reloaded = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let config = updates.recv().await.unwrap();
                if config.interception.handle_upgrade {
                    return config;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(reloaded.listener.bind_address, "127.0.0.1:9999");

        let _ = fs::remove_dir_all(&dir);
    }
}
