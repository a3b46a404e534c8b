//! The source registry.
//!
//! Owns every [`SourceHandle`] and the cached layout set. One call to
//! [`SourceRegistry::tick`] is one refresh cycle:
//!
//! 1. discover new snapshot files in the source folder (when watching)
//! 2. refresh all handles concurrently and wait for every one of them
//! 3. evict long-missing files (only when a TTL is configured)
//! 4. recompute the layout set and notify listeners
//!
//! A failing source never stops the others; its error lands in the
//! [`TickReport`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use measync_core::{is_snapshot_path, DataModel, RegistryConfig};
use measync_protocol::Endpoint;

use crate::error::RegistryError;
use crate::notify::ChangeListener;
use crate::source::{SourceError, SourceHandle, SourceId};

/// What happened during one tick.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Per-source refresh failures.
    pub errors: Vec<(SourceId, SourceError)>,
    /// Files picked up by folder discovery.
    pub discovered: Vec<SourceId>,
    /// Sources removed after being missing longer than the TTL.
    pub evicted: Vec<SourceId>,
    pub layout_changed: bool,
    /// Folder discovery failure; the tick still refreshed known sources.
    pub folder_error: Option<String>,
}

impl TickReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.folder_error.is_none()
    }
}

/// Registry of data sources.
pub struct SourceRegistry {
    config: RegistryConfig,
    handles: BTreeMap<SourceId, SourceHandle>,
    layout: BTreeSet<String>,
    listeners: Vec<Box<dyn ChangeListener>>,
    ticks: u64,
}

impl SourceRegistry {
    /// Empty registry. Nothing is discovered until the first tick.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            handles: BTreeMap::new(),
            layout: BTreeSet::new(),
            listeners: Vec::new(),
            ticks: 0,
        }
    }

    /// Validate `config`, register its live sources and, when folder watching
    /// is on, every snapshot already in the source folder.
    pub fn init(config: RegistryConfig) -> Result<Self, RegistryError> {
        config.validate()?;
        let mut registry = Self::new(config);
        registry.add_live_sources()?;
        if registry.config.watch_folder {
            let found = registry.add_from_source_folder()?;
            info!(
                "Found {} snapshot(s) in {}",
                found.len(),
                registry.config.source_folder.display()
            );
        }
        Ok(registry)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Replace the configuration and notify listeners.
    ///
    /// Live sources named by the new configuration are added; existing
    /// sources are left alone.
    pub fn apply_config(&mut self, config: RegistryConfig) -> Result<(), RegistryError> {
        config.validate()?;
        self.config = config;
        self.add_live_sources()?;
        info!("Registry configuration updated");
        for listener in &mut self.listeners {
            listener.on_config_changed(&self.config);
        }
        Ok(())
    }

    /// Update one option by name, as in [`RegistryConfig::set_option`].
    pub fn set_option(&mut self, name: &str, value: &serde_json::Value) -> Result<(), RegistryError> {
        let mut config = self.config.clone();
        config.set_option(name, value)?;
        self.apply_config(config)
    }

    pub fn add_listener(&mut self, listener: Box<dyn ChangeListener>) {
        self.listeners.push(listener);
    }

    /// Register a source. Returns `false` if it was already known.
    pub fn add_source(&mut self, id: SourceId) -> bool {
        if self.handles.contains_key(&id) {
            return false;
        }
        info!("Adding source {}", id);
        let poll_timeout = Duration::from_millis(self.config.live_poll_timeout_ms);
        self.handles.insert(id.clone(), SourceHandle::new(id, poll_timeout));
        true
    }

    /// Drop a source. Returns `false` if it was not known.
    pub fn remove_source(&mut self, id: &SourceId) -> bool {
        let removed = self.handles.remove(id).is_some();
        if removed {
            info!("Removed source {}", id);
        }
        removed
    }

    /// Add every snapshot file in the source folder that is not known yet.
    ///
    /// Returns the newly added sources, in path order.
    pub fn add_from_source_folder(&mut self) -> Result<Vec<SourceId>, RegistryError> {
        let folder = self.config.source_folder.clone();
        let entries = std::fs::read_dir(&folder).map_err(|source| RegistryError::Folder {
            path: folder.clone(),
            source,
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_snapshot_path(path, &self.config.extensions))
            .collect();
        paths.sort();

        let mut added = Vec::new();
        for path in paths {
            let id = SourceId::file(path);
            if self.add_source(id.clone()) {
                added.push(id);
            }
        }
        Ok(added)
    }

    /// Run one refresh cycle.
    pub async fn tick(&mut self) -> TickReport {
        self.ticks += 1;
        let mut report = TickReport::default();

        if self.config.watch_folder {
            match self.add_from_source_folder() {
                Ok(added) => report.discovered = added,
                Err(e) => {
                    warn!("Folder discovery failed: {}", e);
                    report.folder_error = Some(e.to_string());
                }
            }
        }

        let results = join_all(self.handles.iter_mut().map(|(id, handle)| async move {
            let result = handle.refresh().await;
            (id.clone(), result)
        }))
        .await;

        for (id, result) in results {
            if let Err(e) = result {
                warn!("Refresh of {} failed: {}", id, e);
                report.errors.push((id, e));
            }
        }

        if let Some(ttl) = self.config.evict_stale_after_ms {
            report.evicted = self.evict_missing(Duration::from_millis(ttl));
        }

        let layout = self.compute_layout();
        if layout != self.layout {
            debug!("Layout changed: {:?}", layout);
            self.layout = layout;
            report.layout_changed = true;
            for listener in &mut self.listeners {
                listener.on_layout_changed(&self.layout);
            }
        }

        for listener in &mut self.listeners {
            listener.on_data_refreshed();
        }

        debug!(
            "Tick {}: {} source(s), {} error(s), {} discovered",
            self.ticks,
            self.handles.len(),
            report.errors.len(),
            report.discovered.len()
        );
        report
    }

    /// Cached union of graph keys as of the last tick.
    pub fn layout(&self) -> &BTreeSet<String> {
        &self.layout
    }

    pub fn source(&self, id: &SourceId) -> Option<&SourceHandle> {
        self.handles.get(id)
    }

    /// Current data of one source.
    pub fn data(&self, id: &SourceId) -> Option<Arc<DataModel>> {
        self.handles.get(id).map(|h| h.current_data())
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceHandle> {
        self.handles.values()
    }

    pub fn contains(&self, id: &SourceId) -> bool {
        self.handles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Number of ticks run so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    fn add_live_sources(&mut self) -> Result<(), RegistryError> {
        let endpoints = self
            .config
            .live_sources
            .iter()
            .map(|raw| Endpoint::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        for endpoint in endpoints {
            self.add_source(SourceId::Live(endpoint));
        }
        Ok(())
    }

    fn evict_missing(&mut self, ttl: Duration) -> Vec<SourceId> {
        let expired: Vec<SourceId> = self
            .handles
            .values()
            .filter(|h| h.missing_since().is_some_and(|since| since.elapsed() >= ttl))
            .map(|h| h.id().clone())
            .collect();

        for id in &expired {
            info!("Evicting {} after {:?} missing", id, ttl);
            self.handles.remove(id);
        }
        expired
    }

    fn compute_layout(&self) -> BTreeSet<String> {
        self.handles.values().flat_map(|h| h.graph_keys()).collect()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.handles.keys().collect::<Vec<_>>())
            .field("layout", &self.layout)
            .field("ticks", &self.ticks)
            .finish()
    }
}
