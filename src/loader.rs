//! Assembles navigation from the menu registry and the plugin manifest pack.
//!
//! Bootstrap fetches every document up front. Only once all of them have been
//! fetched and validated does it touch the [`UiSink`], so a failed fetch never
//! leaves a half-registered UI behind.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{KernelError, Result};
use crate::gate::{AppMode, FeatureGate};
use crate::merge;
use crate::registry::Manifest;
use crate::source::{fetch_typed, DocumentSource};

/// Where a navigation entry is anchored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Anchor {
    Topbar,
    ProjectPanel,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MenuRegistryEntry {
    pub anchor: Anchor,
    #[serde(default)]
    pub order: f64,
    #[serde(default)]
    pub manifest_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_path: Option<String>,
}

/// The menu registry document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MenuRegistry {
    #[serde(default)]
    pub entries: Vec<MenuRegistryEntry>,
}

/// The manifest pack document: URLs of plugin manifests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ManifestPack {
    #[serde(default)]
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginMenuEntry {
    pub anchor: Anchor,
    #[serde(default)]
    pub tab_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<f64>,
    #[serde(default)]
    pub requires: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginUi {
    #[serde(default)]
    pub menu_entries: Vec<PluginMenuEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginSettings {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub defaults: Value,
}

/// A plugin manifest referenced from the manifest pack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    #[serde(default)]
    pub plugin_id: String,
    #[serde(default)]
    pub ui: PluginUi,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<PluginSettings>,
}

impl PluginManifest {
    /// The menu entry for `anchor`/`tab_id`, or the first entry.
    pub fn menu_entry(&self, anchor: &Anchor, tab_id: Option<&str>) -> Option<&PluginMenuEntry> {
        self.ui
            .menu_entries
            .iter()
            .find(|e| &e.anchor == anchor && tab_id.is_some_and(|t| t == e.tab_id))
            .or_else(|| self.ui.menu_entries.first())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopbarEntry {
    pub id: String,
    pub title: String,
    pub tab_id: Option<String>,
    pub order: f64,
}

/// What a tab shows when the UI renders it.
#[derive(Debug, Clone, PartialEq)]
pub enum TabRender {
    Plugin { plugin_id: String, tab_id: String },
    Placeholder { text: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TabRegistration {
    pub anchor: Anchor,
    pub tab_id: String,
    pub title: String,
    pub icon: Option<String>,
    pub order: f64,
    pub settings_path: Option<String>,
    pub allowed: bool,
    pub requires: Vec<String>,
    pub render: TabRender,
}

/// The UI layer the loader registers navigation into.
pub trait UiSink {
    fn register_topbar(&mut self, entry: TopbarEntry);

    fn register_tab(&mut self, tab: TabRegistration);

    /// Merge plugin defaults into the project config without overwriting.
    fn ensure_defaults(
        &mut self,
        project_config: &mut Value,
        settings_path: &str,
        defaults: &Value,
    ) -> bool {
        merge::ensure_defaults_at(project_config, settings_path, defaults)
    }

    fn render_placeholder(&mut self, text: &str) -> TabRender {
        TabRender::Placeholder {
            text: text.to_string(),
        }
    }

    fn finalize(&mut self);
}

/// A sink that just records what it was given.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub topbar: Vec<TopbarEntry>,
    pub tabs: Vec<TabRegistration>,
    pub finalized: usize,
}

impl UiSink for CollectingSink {
    fn register_topbar(&mut self, entry: TopbarEntry) {
        self.topbar.push(entry);
    }

    fn register_tab(&mut self, tab: TabRegistration) {
        self.tabs.push(tab);
    }

    fn finalize(&mut self) {
        self.finalized += 1;
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    pub app_mode: AppMode,
    pub project_config: Value,
    pub registry_url: String,
    pub pack_url: String,
}

#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub registry: MenuRegistry,
    pub manifests: BTreeMap<String, PluginManifest>,
    pub gate: FeatureGate,
    /// The project config with plugin defaults filled in.
    pub project_config: Value,
}

#[derive(Clone)]
pub struct Loader {
    source: Arc<dyn DocumentSource>,
}

impl Loader {
    pub fn new(source: Arc<dyn DocumentSource>) -> Self {
        Self { source }
    }

    pub async fn bootstrap<S: UiSink + ?Sized>(
        &self,
        request: BootstrapRequest,
        sink: &mut S,
    ) -> Result<Bootstrap> {
        let BootstrapRequest {
            app_mode,
            mut project_config,
            registry_url,
            pack_url,
        } = request;

        let registry: MenuRegistry =
            fetch_typed(self.source.as_ref(), &registry_url, "menu registry").await?;
        let pack: ManifestPack =
            fetch_typed(self.source.as_ref(), &pack_url, "manifest pack").await?;
        let manifests = self.fetch_manifests(&pack).await?;
        tracing::info!(
            entries = registry.entries.len(),
            plugins = manifests.len(),
            "navigation documents loaded"
        );

        let gate = FeatureGate::new(app_mode, &project_config);

        let mut topbar: Vec<&MenuRegistryEntry> = Vec::new();
        let mut panels: Vec<&MenuRegistryEntry> = Vec::new();
        for entry in &registry.entries {
            match entry.anchor {
                Anchor::Topbar => topbar.push(entry),
                Anchor::ProjectPanel => panels.push(entry),
                Anchor::Other => {
                    tracing::warn!(manifest_id = %entry.manifest_id, "skipping entry with unknown anchor")
                }
            }
        }
        topbar.sort_by(|a, b| a.order.total_cmp(&b.order));
        panels.sort_by(|a, b| a.order.total_cmp(&b.order));

        for entry in topbar {
            let id = if entry.manifest_id.is_empty() {
                entry.tab_id.clone().unwrap_or_default()
            } else {
                entry.manifest_id.clone()
            };
            sink.register_topbar(TopbarEntry {
                id,
                title: entry.title.clone(),
                tab_id: entry.tab_id.clone(),
                order: entry.order,
            });
        }

        for entry in panels {
            let tab = match manifests.get(&entry.manifest_id) {
                None => {
                    tracing::warn!(manifest_id = %entry.manifest_id, "panel references a missing manifest");
                    let render =
                        sink.render_placeholder(&format!("missing manifest: {}", entry.manifest_id));
                    TabRegistration {
                        anchor: entry.anchor.clone(),
                        tab_id: entry
                            .tab_id
                            .clone()
                            .unwrap_or_else(|| entry.manifest_id.clone()),
                        title: entry.title.clone(),
                        icon: None,
                        order: entry.order,
                        settings_path: entry.settings_path.clone(),
                        allowed: true,
                        requires: Vec::new(),
                        render,
                    }
                }
                Some(manifest) => panel_tab(entry, manifest, &gate, &mut project_config, sink),
            };
            sink.register_tab(tab);
        }

        sink.finalize();

        Ok(Bootstrap {
            registry,
            manifests,
            gate,
            project_config,
        })
    }

    /// Fetch module manifests for `keys`; `{key}` in `url_pattern` is replaced
    /// by each module key.
    pub async fn fetch_module_manifests<S: AsRef<str>>(
        &self,
        url_pattern: &str,
        keys: &[S],
    ) -> Result<Vec<Manifest>> {
        try_join_all(keys.iter().map(|key| async move {
            let url = url_pattern.replace("{key}", key.as_ref());
            Manifest::from_value(self.source.fetch_json(&url).await?)
        }))
        .await
    }

    async fn fetch_manifests(&self, pack: &ManifestPack) -> Result<BTreeMap<String, PluginManifest>> {
        let fetched = try_join_all(pack.plugins.iter().map(|url| async move {
            let manifest: PluginManifest =
                fetch_typed(self.source.as_ref(), url, "plugin manifest").await?;
            if manifest.plugin_id.trim().is_empty() {
                return Err(KernelError::configuration(format!(
                    "plugin manifest at {} has no pluginId",
                    url
                )));
            }
            Ok(manifest)
        }))
        .await?;

        let mut manifests = BTreeMap::new();
        for manifest in fetched {
            let id = manifest.plugin_id.clone();
            if manifests.insert(id.clone(), manifest).is_some() {
                tracing::warn!(plugin_id = %id, "duplicate plugin manifest, keeping the last one");
            }
        }
        Ok(manifests)
    }
}

fn panel_tab<S: UiSink + ?Sized>(
    entry: &MenuRegistryEntry,
    manifest: &PluginManifest,
    gate: &FeatureGate,
    project_config: &mut Value,
    sink: &mut S,
) -> TabRegistration {
    let menu_entry = manifest.menu_entry(&entry.anchor, entry.tab_id.as_deref());
    let requires = menu_entry.map(|m| m.requires.clone()).unwrap_or_default();
    let allowed = gate.can_all(requires.as_slice());

    let settings_path = entry
        .settings_path
        .clone()
        .or_else(|| manifest.settings.as_ref().map(|s| s.path.clone()))
        .filter(|p| !p.is_empty());
    if let (Some(path), Some(settings)) = (&settings_path, &manifest.settings) {
        if !settings.defaults.is_null()
            && sink.ensure_defaults(project_config, path, &settings.defaults)
        {
            tracing::debug!(plugin_id = %manifest.plugin_id, path = %path, "plugin defaults merged");
        }
    }

    let tab_id = entry
        .tab_id
        .clone()
        .or_else(|| menu_entry.map(|m| m.tab_id.clone()))
        .unwrap_or_else(|| manifest.plugin_id.clone());
    let title = if entry.title.is_empty() {
        menu_entry.map(|m| m.title.clone()).unwrap_or_default()
    } else {
        entry.title.clone()
    };

    TabRegistration {
        anchor: entry.anchor.clone(),
        tab_id: tab_id.clone(),
        title,
        icon: menu_entry.and_then(|m| m.icon.clone()),
        order: entry.order,
        settings_path,
        allowed,
        requires,
        render: TabRender::Plugin {
            plugin_id: manifest.plugin_id.clone(),
            tab_id,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_menu_entry_falls_back_to_first() {
        let manifest: PluginManifest = serde_json::from_value(json!({
            "pluginId": "cranes",
            "ui": { "menuEntries": [
                { "anchor": "projectPanel", "tabId": "overview", "title": "Overview" },
                { "anchor": "projectPanel", "tabId": "radius", "title": "Radius" }
            ]}
        }))
        .unwrap();

        let picked = manifest.menu_entry(&Anchor::ProjectPanel, Some("radius")).unwrap();
        assert_eq!(picked.title, "Radius");

        let fallback = manifest.menu_entry(&Anchor::ProjectPanel, Some("nope")).unwrap();
        assert_eq!(fallback.title, "Overview");

        let fallback = manifest.menu_entry(&Anchor::Topbar, Some("radius")).unwrap();
        assert_eq!(fallback.title, "Overview");
    }

    #[test]
    fn test_unknown_anchor_deserialises_as_other() {
        let entry: MenuRegistryEntry =
            serde_json::from_value(json!({ "anchor": "sidebar", "title": "X" })).unwrap();
        assert_eq!(entry.anchor, Anchor::Other);
    }
}
