//! Hot-reloadable component configuration backed by a single YAML file.
//!
//! Each reloadable component registers under a string key. Setting a
//! component's config applies defaults, compares against the last-seen value
//! and only on change calls the component's `reload` before persisting the
//! whole map back to disk. Components never hold a pointer back to the repo;
//! reload is a one-way call.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A component that can pick up a changed configuration at runtime.
/// Implementations that own a ticker reset it to the new interval.
pub trait Reloadable: Send + Sync {
    fn reload(&self, config: serde_yaml::Value) -> Result<()>;
}

struct Inner {
    values: BTreeMap<String, serde_yaml::Value>,
    reloadables: BTreeMap<String, Arc<dyn Reloadable>>,
}

/// Configuration repository. All writes are serialized by the inner mutex, so
/// callers of [`ConfigRepo::set_component_config`] observe a linear order.
pub struct ConfigRepo {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl ConfigRepo {
    /// Opens (creating if missing) the YAML config file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create config directory {}", parent.display()))?;
        }
        let values = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read config file {}", path.display()))?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("parse config file {}", path.display()))?
            }
        } else {
            std::fs::write(&path, "")
                .with_context(|| format!("create config file {}", path.display()))?;
            BTreeMap::new()
        };
        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                values,
                reloadables: BTreeMap::new(),
            }),
        })
    }

    pub fn register_reloadable(&self, name: &str, reloadable: Arc<dyn Reloadable>) {
        self.inner
            .lock()
            .reloadables
            .insert(name.to_string(), reloadable);
    }

    /// Reads a component config, falling back to (and persisting) the default
    /// when the key is absent.
    pub fn component_config<T>(&self, name: &str) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let existing = { self.inner.lock().values.get(name).cloned() };
        match existing {
            Some(value) => {
                serde_yaml::from_value(value).with_context(|| format!("decode config `{name}`"))
            }
            None => {
                let default = T::default();
                self.set_component_config(name, &default)?;
                Ok(default)
            }
        }
    }

    /// Applies a component config: on change, reloads the registered
    /// component and rewrites the backing file.
    pub fn set_component_config<T>(&self, name: &str, config: &T) -> Result<()>
    where
        T: Serialize,
    {
        let value = serde_yaml::to_value(config).context("encode component config")?;
        let mut inner = self.inner.lock();
        if inner.values.get(name) == Some(&value) {
            return Ok(());
        }
        if let Some(reloadable) = inner.reloadables.get(name).cloned() {
            reloadable
                .reload(value.clone())
                .with_context(|| format!("reload component `{name}`"))?;
        }
        inner.values.insert(name.to_string(), value);
        let raw = serde_yaml::to_string(&inner.values).context("encode config file")?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("write config file {}", self.path.display()))?;
        Ok(())
    }
}

/// Component keys as they appear in the YAML file and the config API paths.
pub mod component {
    pub const TMDB: &str = "tmdb";
    pub const DOWNLOADER: &str = "downloader";
    pub const DOWNLOAD_MANAGER: &str = "download_manager";
    pub const SUBSCRIBER: &str = "subscriber";
    pub const TRANSFER: &str = "transfer";
    pub const NOTICE: &str = "notice";
    pub const SUBTITLE: &str = "subtitle";
    pub const SCRAPER: &str = "scraper";
    pub const AUTH: &str = "auth";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default, PartialEq, Serialize, serde::Deserialize)]
    struct Sample {
        interval: u64,
        name: String,
    }

    struct Counter(AtomicUsize);

    impl Reloadable for Counter {
        fn reload(&self, _config: serde_yaml::Value) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn reload_fires_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ConfigRepo::open(dir.path().join("config.yaml")).unwrap();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        repo.register_reloadable("sample", counter.clone());

        let cfg = Sample {
            interval: 30,
            name: "a".into(),
        };
        repo.set_component_config("sample", &cfg).unwrap();
        repo.set_component_config("sample", &cfg).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        repo.set_component_config(
            "sample",
            &Sample {
                interval: 10,
                name: "a".into(),
            },
        )
        .unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_key_yields_persisted_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let repo = ConfigRepo::open(&path).unwrap();
        let cfg: Sample = repo.component_config("sample").unwrap();
        assert_eq!(cfg, Sample::default());

        let reopened = ConfigRepo::open(&path).unwrap();
        let cfg: Sample = reopened.component_config("sample").unwrap();
        assert_eq!(cfg, Sample::default());
    }
}
