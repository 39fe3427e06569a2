use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};

use super::models::{
    directory_config_path, marker_dir, AppSettings, AppSettingsUpdate, DirectoryConfig,
    DirectoryConfigUpdate, DirectoryEntry, DirectoryList,
};
use super::notifier::{EventBus, Observable, StoreEvent};
use crate::config::ServiceConfig;
use crate::core::validation::{validate_directory_entry, FormError};

/// Owner of the registry, every directory config and the app settings.
///
/// Values are loaded lazily, cached for the life of the process and written
/// through to disk on every mutation. Readers get clones; nothing outside the
/// store holds a writable reference.
pub struct ConfigStore {
    registry_path: PathBuf,
    app_settings_path: PathBuf,
    registry: OnceCell<Observable<DirectoryList>>,
    registry_lock: Mutex<()>,
    app_settings: OnceCell<Observable<AppSettings>>,
    app_settings_lock: Mutex<()>,
    directories: RwLock<HashMap<PathBuf, Arc<DirectorySlot>>>,
    events: EventBus<StoreEvent>,
}

/// Cache cell for one directory config.
///
/// The `OnceCell` makes concurrent first reads share a single load; a failed
/// load leaves it empty so the next caller retries.
struct DirectorySlot {
    config: OnceCell<Observable<DirectoryConfig>>,
    update_lock: Mutex<()>,
}

impl DirectorySlot {
    fn new() -> Self {
        Self {
            config: OnceCell::new(),
            update_lock: Mutex::new(()),
        }
    }

    async fn load(&self, directory: &Path) -> Result<&Observable<DirectoryConfig>> {
        self.config
            .get_or_try_init(|| async {
                let config = load_directory_config(directory).await?;
                Ok::<_, anyhow::Error>(Observable::new(directory.display().to_string(), config))
            })
            .await
    }
}

impl ConfigStore {
    pub fn new(registry_path: PathBuf, app_settings_path: PathBuf) -> Self {
        Self {
            registry_path,
            app_settings_path,
            registry: OnceCell::new(),
            registry_lock: Mutex::new(()),
            app_settings: OnceCell::new(),
            app_settings_lock: Mutex::new(()),
            directories: RwLock::new(HashMap::new()),
            events: EventBus::default(),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.registry_path(), config.app_settings_path())
    }

    /// Mutation events emitted after each committed change
    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    // Registry

    async fn registry_observable(&self) -> &Observable<DirectoryList> {
        self.registry
            .get_or_init(|| async {
                Observable::new("directories", load_registry(&self.registry_path).await)
            })
            .await
    }

    /// Current registry; a missing or corrupt document reads as empty.
    pub async fn registry(&self) -> DirectoryList {
        self.registry_observable().await.get()
    }

    pub async fn subscribe_registry(&self) -> watch::Receiver<DirectoryList> {
        self.registry_observable().await.subscribe()
    }

    /// Validate and append `entry`. Returns the validation failure, if any,
    /// without touching the registry.
    pub async fn add_directory_entry(&self, entry: DirectoryEntry) -> Result<Option<FormError>> {
        let _guard = self.registry_lock.lock().await;
        let observable = self.registry_observable().await;
        let mut registry = observable.get();

        if let Some(errors) = validate_directory_entry(&entry, &registry).await {
            debug!(name = %entry.name, "Directory entry rejected: {:?}", errors.form_errors);
            return Ok(Some(errors));
        }

        info!(name = %entry.name, path = %entry.path.display(), "Adding directory");
        registry.directories.push(entry);
        observable.publish(registry.clone());
        self.save_registry(&registry).await?;

        self.events.publish(StoreEvent::RegistryChanged);
        Ok(None)
    }

    /// Drop the entry named `name`. Absent names are not an error.
    pub async fn remove_directory_entry(&self, name: &str) -> Result<()> {
        let _guard = self.registry_lock.lock().await;
        let observable = self.registry_observable().await;
        let mut registry = observable.get();

        let before = registry.directories.len();
        registry.directories.retain(|d| d.name != name);
        if registry.directories.len() != before {
            info!(name, "Removing directory");
        }

        observable.publish(registry.clone());
        self.save_registry(&registry).await?;

        self.events.publish(StoreEvent::RegistryChanged);
        Ok(())
    }

    pub async fn directory_path(&self, name: &str) -> Result<PathBuf> {
        self.registry()
            .await
            .find(name)
            .map(|d| d.path.clone())
            .with_context(|| format!("Unknown directory: {}", name))
    }

    async fn save_registry(&self, registry: &DirectoryList) -> Result<()> {
        ensure_parent_dir(&self.registry_path).await?;
        write_json_atomic(&self.registry_path, registry)
            .await
            .context("Failed to save directory list")
    }

    // Directory configs

    async fn slot(&self, directory: &Path) -> Arc<DirectorySlot> {
        if let Some(slot) = self.directories.read().await.get(directory) {
            return Arc::clone(slot);
        }

        let mut directories = self.directories.write().await;
        Arc::clone(
            directories
                .entry(directory.to_path_buf())
                .or_insert_with(|| Arc::new(DirectorySlot::new())),
        )
    }

    /// Cached config for `directory`, loading it on first access.
    ///
    /// Fails when the marker directory is unreadable; the failure is not cached.
    pub async fn directory_config(&self, directory: &Path) -> Result<DirectoryConfig> {
        let slot = self.slot(directory).await;
        Ok(slot.load(directory).await?.get())
    }

    pub async fn directory_config_by_name(&self, name: &str) -> Result<DirectoryConfig> {
        let directory = self.directory_path(name).await?;
        self.directory_config(&directory).await
    }

    pub async fn subscribe_directory_config(&self, name: &str) -> Result<watch::Receiver<DirectoryConfig>> {
        let directory = self.directory_path(name).await?;
        let slot = self.slot(&directory).await;
        Ok(slot.load(&directory).await?.subscribe())
    }

    /// Merge `update` into the cached config, persist it and notify.
    ///
    /// Updates to one path apply in call order. On a write failure the cache
    /// already holds the merged value and the error is returned.
    pub async fn update_directory_config(&self, directory: &Path, update: DirectoryConfigUpdate) -> Result<()> {
        self.update_directory_config_if(directory, |_| true, update).await?;
        Ok(())
    }

    /// Like [`update_directory_config`](Self::update_directory_config), but only
    /// when `predicate` holds for the current value. The check and the write
    /// happen under the same per-path lock. Returns whether the update applied.
    pub async fn update_directory_config_if<P>(
        &self,
        directory: &Path,
        predicate: P,
        update: DirectoryConfigUpdate,
    ) -> Result<bool>
    where
        P: FnOnce(&DirectoryConfig) -> bool,
    {
        let slot = self.slot(directory).await;
        let _guard = slot.update_lock.lock().await;
        let observable = slot.load(directory).await?;

        let current = observable.get();
        if !predicate(&current) {
            return Ok(false);
        }

        let merged = current.merged(update);
        observable.publish(merged.clone());

        write_json_atomic(&directory_config_path(directory), &merged)
            .await
            .with_context(|| format!("Failed to save directory config for {}", directory.display()))?;

        self.events.publish(StoreEvent::DirectoryConfigChanged(directory.to_path_buf()));
        Ok(true)
    }

    // App settings

    async fn app_settings_observable(&self) -> &Observable<AppSettings> {
        self.app_settings
            .get_or_init(|| async {
                Observable::new("appConfig", load_document_or_default(&self.app_settings_path, "app settings").await)
            })
            .await
    }

    pub async fn app_settings(&self) -> AppSettings {
        self.app_settings_observable().await.get()
    }

    pub async fn subscribe_app_settings(&self) -> watch::Receiver<AppSettings> {
        self.app_settings_observable().await.subscribe()
    }

    pub async fn update_app_settings(&self, update: AppSettingsUpdate) -> Result<()> {
        let _guard = self.app_settings_lock.lock().await;
        let observable = self.app_settings_observable().await;

        let mut settings = observable.get();
        settings.apply(update);
        observable.publish(settings.clone());

        ensure_parent_dir(&self.app_settings_path).await?;
        write_json_atomic(&self.app_settings_path, &settings)
            .await
            .context("Failed to save app settings")?;

        self.events.publish(StoreEvent::AppSettingsChanged);
        Ok(())
    }
}

/// Registry load. Accepts the `{ "directories": [...] }` document as well as a
/// bare array of entries.
async fn load_registry(path: &Path) -> DirectoryList {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("No directory list at {}, starting empty", path.display());
            return DirectoryList::default();
        }
        Err(e) => {
            warn!("Failed to read directory list, using default: {}", e);
            return DirectoryList::default();
        }
    };

    if let Ok(list) = serde_json::from_str::<DirectoryList>(&content) {
        debug!("Loaded {} directories", list.directories.len());
        return list;
    }

    match serde_json::from_str::<Vec<DirectoryEntry>>(&content) {
        Ok(directories) => DirectoryList { directories },
        Err(e) => {
            warn!("Failed to parse directory list, using default: {}", e);
            DirectoryList::default()
        }
    }
}

async fn load_directory_config(directory: &Path) -> Result<DirectoryConfig> {
    let marker = marker_dir(directory);
    tokio::fs::read_dir(&marker)
        .await
        .with_context(|| format!("Failed to access config directory {}", marker.display()))?;

    Ok(load_document_or_default(&directory_config_path(directory), "directory config").await)
}

async fn load_document_or_default<T>(path: &Path, what: &str) -> T
where
    T: DeserializeOwned + Default,
{
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("No {} at {}, using default", what, path.display());
            return T::default();
        }
        Err(e) => {
            warn!("Failed to read {} at {}, using default: {}", what, path.display(), e);
            return T::default();
        }
    };

    serde_json::from_str(&content).unwrap_or_else(|e| {
        warn!("Failed to parse {} at {}, using default: {}", what, path.display(), e);
        T::default()
    })
}

async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Pretty JSON via temp file, fsync, rename.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    debug!("Saving document atomically to: {}", path.display());

    let json = serde_json::to_string_pretty(value)
        .context("Failed to serialize document")?;

    tokio::fs::write(&temp_path, &json).await
        .context("Failed to write temporary file")?;

    let temp_file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&temp_path)
        .await?;

    temp_file.sync_all().await
        .context("Failed to sync temporary file")?;

    drop(temp_file);

    tokio::fs::rename(&temp_path, path).await
        .context("Failed to rename temporary file")?;

    Ok(())
}
