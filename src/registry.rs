//! Module registry: manifests, dependency-ordered activation and the menu model.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::EventBus;
use crate::error::{GraphError, KernelError, Result};
use crate::store::Store;

/// Group that receives menu items whose declared group is not configured.
pub const DEFAULT_MENU_GROUP: &str = "tools";

/// Static descriptor of a module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub menu: Option<MenuPlacement>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Manifest {
    pub fn new(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            schema: None,
            key: key.into(),
            label: label.into(),
            menu: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_menu(mut self, group: &str, icon: &str, order: f64) -> Self {
        self.menu = Some(MenuPlacement {
            group: group.to_string(),
            icon: icon.to_string(),
            order,
        });
        self
    }

    pub fn depends_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Decode and validate a manifest document.
    pub fn from_value(value: Value) -> Result<Self> {
        let manifest: Manifest = serde_json::from_value(value).map_err(|source| {
            KernelError::InvalidDocument {
                what: "module manifest",
                source,
            }
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(KernelError::configuration("module manifest is missing 'key'"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MenuPlacement {
    pub group: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub order: f64,
}

/// Shared context handed to module initializers.
#[derive(Clone)]
pub struct ModuleContext {
    pub bus: EventBus,
    pub store: Store,
    pub project_config: Value,
}

pub type Initializer = Box<dyn Fn(&ModuleContext) -> anyhow::Result<()> + Send + Sync>;

/// What a caller hands to [`ModuleRegistry::register`].
pub struct ModuleDescriptor {
    pub manifest: Manifest,
    pub init: Option<Initializer>,
}

impl ModuleDescriptor {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            init: None,
        }
    }

    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: Fn(&ModuleContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.init = Some(Box::new(init));
        self
    }
}

pub struct ModuleEntry {
    manifest: Manifest,
    init: Option<Initializer>,
    is_inited: bool,
}

impl ModuleEntry {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn is_inited(&self) -> bool {
        self.is_inited
    }
}

impl fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("key", &self.manifest.key)
            .field("has_init", &self.init.is_some())
            .field("is_inited", &self.is_inited)
            .finish()
    }
}

/// One configured menu group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MenuGroupConfig {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub order: f64,
}

/// UI configuration the menu model is derived against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiConfig {
    #[serde(default)]
    pub groups: Vec<MenuGroupConfig>,
    #[serde(default = "default_menu_group")]
    pub fallback_group: String,
}

fn default_menu_group() -> String {
    DEFAULT_MENU_GROUP.to_string()
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            fallback_group: default_menu_group(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub module_key: String,
    pub label: String,
    pub icon: String,
    pub order: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MenuGroup {
    pub key: String,
    pub label: String,
    pub order: f64,
    pub items: Vec<MenuItem>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MenuModel {
    pub groups: Vec<MenuGroup>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

#[derive(Default)]
pub struct ModuleRegistry {
    entries: HashMap<String, ModuleEntry>,
    registration_order: Vec<String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<()> {
        let ModuleDescriptor { manifest, init } = descriptor;
        manifest.validate()?;
        if self.entries.contains_key(&manifest.key) {
            return Err(KernelError::configuration(format!(
                "module '{}' is already registered",
                manifest.key
            )));
        }

        tracing::debug!(key = %manifest.key, "module registered");
        self.registration_order.push(manifest.key.clone());
        self.entries.insert(
            manifest.key.clone(),
            ModuleEntry {
                manifest,
                init,
                is_inited: false,
            },
        );
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&ModuleEntry> {
        self.entries.get(key)
    }

    pub fn is_inited(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|e| e.is_inited)
    }

    /// Manifests in registration order.
    pub fn list_manifests(&self) -> Vec<&Manifest> {
        self.registration_order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .map(|entry| &entry.manifest)
            .collect()
    }

    /// Order `active_keys` so every key follows its active dependencies.
    ///
    /// Depth-first with an explicit stack; keys are emitted in finish order.
    /// Dependencies outside the active set are ignored.
    pub fn resolve_order<S: AsRef<str>>(&self, active_keys: &[S]) -> Result<Vec<String>> {
        let active: HashSet<&str> = active_keys.iter().map(AsRef::as_ref).collect();
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut order = Vec::with_capacity(active.len());

        for root in active_keys.iter().map(AsRef::as_ref) {
            if marks.contains_key(root) {
                continue;
            }
            let entry = self.lookup(root)?;
            marks.insert(root, Mark::Visiting);
            let mut stack: Vec<(&str, &[String], usize)> =
                vec![(root, entry.manifest.dependencies.as_slice(), 0)];

            while let Some(&(key, deps, next)) = stack.last() {
                if next >= deps.len() {
                    stack.pop();
                    marks.insert(key, Mark::Done);
                    order.push(key.to_string());
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.2 += 1;
                }

                let dep = deps[next].as_str();
                if !active.contains(dep) {
                    continue;
                }
                match marks.get(dep) {
                    Some(Mark::Done) => {}
                    Some(Mark::Visiting) => {
                        return Err(GraphError::Cycle {
                            key: dep.to_string(),
                        }
                        .into());
                    }
                    None => {
                        let dep_entry = self.lookup(dep)?;
                        marks.insert(dep, Mark::Visiting);
                        stack.push((dep, dep_entry.manifest.dependencies.as_slice(), 0));
                    }
                }
            }
        }

        Ok(order)
    }

    /// Resolve the activation order and run each pending initializer once.
    pub fn activate<S: AsRef<str>>(
        &mut self,
        active_keys: &[S],
        context: &ModuleContext,
    ) -> Result<Vec<String>> {
        let order = self.resolve_order(active_keys)?;

        for key in &order {
            let Some(entry) = self.entries.get_mut(key) else {
                continue;
            };
            if entry.is_inited {
                continue;
            }
            if let Some(init) = &entry.init {
                init(context).map_err(|source| KernelError::ModuleInit {
                    key: key.clone(),
                    source,
                })?;
            }
            entry.is_inited = true;
            tracing::info!(key = %key, "module initialised");
        }

        Ok(order)
    }

    /// Derive the navigation menu for the active modules.
    pub fn compute_menu_model<S: AsRef<str>>(
        &self,
        ui_config: &UiConfig,
        active_keys: &[S],
    ) -> MenuModel {
        let mut configured: Vec<&MenuGroupConfig> = ui_config.groups.iter().collect();
        configured.sort_by(|a, b| a.order.total_cmp(&b.order));

        let known: HashSet<&str> = configured.iter().map(|g| g.key.as_str()).collect();
        let mut buckets: HashMap<&str, Vec<MenuItem>> = HashMap::new();
        let mut seen = HashSet::new();

        for key in active_keys.iter().map(AsRef::as_ref) {
            if !seen.insert(key) {
                continue;
            }
            let Some(entry) = self.entries.get(key) else {
                continue;
            };
            let Some(menu) = &entry.manifest.menu else {
                continue;
            };
            let group = if known.contains(menu.group.as_str()) {
                menu.group.as_str()
            } else {
                ui_config.fallback_group.as_str()
            };
            buckets.entry(group).or_default().push(MenuItem {
                module_key: entry.manifest.key.clone(),
                label: entry.manifest.label.clone(),
                icon: menu.icon.clone(),
                order: menu.order,
            });
        }

        let groups = configured
            .into_iter()
            .filter_map(|group| {
                let mut items = buckets.remove(group.key.as_str())?;
                items.sort_by(|a, b| a.order.total_cmp(&b.order).then_with(|| a.label.cmp(&b.label)));
                Some(MenuGroup {
                    key: group.key.clone(),
                    label: group.label.clone(),
                    order: group.order,
                    items,
                })
            })
            .collect();

        MenuModel { groups }
    }

    fn lookup(&self, key: &str) -> Result<&ModuleEntry> {
        self.entries.get(key).ok_or_else(|| {
            GraphError::UnregisteredModule {
                key: key.to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_with(manifests: Vec<Manifest>) -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        for manifest in manifests {
            registry.register(ModuleDescriptor::new(manifest)).unwrap();
        }
        registry
    }

    #[test]
    fn test_resolve_order_places_dependencies_first() {
        let registry = registry_with(vec![
            Manifest::new("cranes", "Cranes").depends_on(["site", "grid"]),
            Manifest::new("site", "Site").depends_on(["grid"]),
            Manifest::new("grid", "Grid"),
        ]);
        let order = registry.resolve_order(&["cranes", "site", "grid"]).unwrap();
        assert_eq!(order, vec!["grid", "site", "cranes"]);
    }

    #[test]
    fn test_inactive_dependencies_are_ignored() {
        let registry = registry_with(vec![
            Manifest::new("cranes", "Cranes").depends_on(["site", "not-registered"]),
            Manifest::new("site", "Site"),
        ]);
        let order = registry.resolve_order(&["cranes"]).unwrap();
        assert_eq!(order, vec!["cranes"]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let registry = registry_with(vec![
            Manifest::new("a", "A").depends_on(["b"]),
            Manifest::new("b", "B").depends_on(["c"]),
            Manifest::new("c", "C").depends_on(["a"]),
        ]);
        let err = registry.resolve_order(&["a", "b", "c"]).unwrap_err();
        match err {
            KernelError::Graph(GraphError::Cycle { key }) => {
                assert!(["a", "b", "c"].contains(&key.as_str()))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let registry = registry_with(vec![Manifest::new("a", "A").depends_on(["a"])]);
        let err = registry.resolve_order(&["a"]).unwrap_err();
        assert!(matches!(
            err,
            KernelError::Graph(GraphError::Cycle { ref key }) if key == "a"
        ));
    }

    #[test]
    fn test_unregistered_active_key() {
        let registry = registry_with(vec![Manifest::new("a", "A")]);
        let err = registry.resolve_order(&["a", "ghost"]).unwrap_err();
        assert!(matches!(
            err,
            KernelError::Graph(GraphError::UnregisteredModule { ref key }) if key == "ghost"
        ));
    }

    #[test]
    fn test_deep_chain_does_not_recurse() {
        let mut manifests = Vec::new();
        let mut keys = Vec::new();
        for i in 0..20_000 {
            let key = format!("m{i}");
            let mut manifest = Manifest::new(key.clone(), key.clone());
            if i > 0 {
                manifest = manifest.depends_on([format!("m{}", i - 1)]);
            }
            manifests.push(manifest);
            keys.push(key);
        }
        keys.reverse();
        let registry = registry_with(manifests);
        let order = registry.resolve_order(&keys).unwrap();
        assert_eq!(order.first().map(String::as_str), Some("m0"));
        assert_eq!(order.last().map(String::as_str), Some("m19999"));
    }

    #[test]
    fn test_manifest_from_value_requires_key() {
        let err = Manifest::from_value(json!({ "label": "No key" })).unwrap_err();
        assert!(matches!(err, KernelError::Configuration(_)));

        let manifest = Manifest::from_value(json!({
            "schema": "siteplan.module/1",
            "key": "site",
            "label": "Site",
            "menu": { "group": "plan", "icon": "map", "order": 2 },
            "dependencies": ["grid"]
        }))
        .unwrap();
        assert_eq!(manifest.key, "site");
        assert_eq!(manifest.menu.unwrap().order, 2.0);
    }
}
