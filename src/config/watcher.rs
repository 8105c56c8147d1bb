//! Hot reload of the keepalive policy.
//!
//! The config file is watched with `notify`. On every modification the file
//! is reloaded and validated, and its `[keepalive]` section is pushed into the
//! policy store. Other sections are only read at startup; changes to them are
//! logged and otherwise ignored.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::loader::{load_config, ConfigError};
use crate::config::schema::{KeepaliveSection, ProxyConfig, UpstreamConfig};
use crate::keepalive::{PolicyError, PolicyStore};

/// Outcome of one reload attempt.
#[derive(Debug)]
pub enum Reload {
    /// Policy swapped in.
    Applied,
    /// Policy unchanged.
    Unchanged,
}

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Pushes keepalive policy changes from the config file into a store.
#[derive(Debug, Clone)]
pub struct PolicyReloader {
    path: PathBuf,
    store: Arc<PolicyStore>,
    upstreams: Vec<UpstreamConfig>,
}

impl PolicyReloader {
    /// `startup` is the config the process was started with.
    pub fn new(path: &Path, store: Arc<PolicyStore>, startup: &ProxyConfig) -> Self {
        Self {
            path: path.to_path_buf(),
            store,
            upstreams: startup.upstreams.clone(),
        }
    }

    /// Reload the file once.
    pub fn reload(&self) -> Result<Reload, ReloadError> {
        let config = load_config(&self.path)?;
        if !same_upstreams(&self.upstreams, &config.upstreams) {
            tracing::warn!(path = ?self.path, "Upstream changes need a restart, ignoring them");
        }
        self.apply(&config.keepalive)
    }

    fn apply(&self, section: &KeepaliveSection) -> Result<Reload, ReloadError> {
        let policy = section.policy();
        if *self.store.load() == policy {
            return Ok(Reload::Unchanged);
        }
        self.store.refresh(policy)?;
        Ok(Reload::Applied)
    }

    /// Start watching. Reloads run until the returned watcher is dropped.
    pub fn watch(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    match self.reload() {
                        Ok(Reload::Applied) => tracing::info!(path = ?self.path, "Keepalive policy reloaded"),
                        Ok(Reload::Unchanged) => tracing::debug!(path = ?self.path, "Config changed, keepalive policy unchanged"),
                        Err(e) => tracing::error!(error = %e, "Config reload failed, keeping current policy"),
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}

fn same_upstreams(a: &[UpstreamConfig], b: &[UpstreamConfig]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.name == y.name && x.address == y.address && x.connections == y.connections
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keepalive::KeepalivePolicy;

    fn temp_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("sidecar-{}-{}.toml", name, std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn reload_applies_keepalive_section() {
        let path = temp_config("reload-apply", "[keepalive]\nfail_count_to_close = 3\n");
        let store = Arc::new(PolicyStore::default());
        let reloader = PolicyReloader::new(&path, store.clone(), &ProxyConfig::default());

        assert!(matches!(reloader.reload().unwrap(), Reload::Applied));
        assert_eq!(store.load().fail_count_to_close, 3);
        assert!(matches!(reloader.reload().unwrap(), Reload::Unchanged));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn invalid_file_keeps_current_policy() {
        let path = temp_config("reload-invalid", "[keepalive]\ntick_count_if_succ = 0\n");
        let store = Arc::new(PolicyStore::default());
        let reloader = PolicyReloader::new(&path, store.clone(), &ProxyConfig::default());

        assert!(reloader.reload().is_err());
        assert_eq!(*store.load(), KeepalivePolicy::default());

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn upstream_comparison() {
        let a = vec![UpstreamConfig {
            name: "orders".into(),
            address: "127.0.0.1:1".into(),
            connections: 1,
        }];
        let mut b = a.clone();
        assert!(same_upstreams(&a, &b));
        b[0].connections = 2;
        assert!(!same_upstreams(&a, &b));
    }
}
