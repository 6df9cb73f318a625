//! Persisted project documents and their schema upgrades.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const PROJECT_SCHEMA: &str = "siteplan.project/2";
pub const UI_SCHEMA: &str = "siteplan.ui/2";

const PROJECT_SCHEMA_V1: &str = "siteplan.project/1";
const UI_SCHEMA_V1: &str = "siteplan.ui/1";

/// One project's durable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    pub schema: String,
    pub meta: ProjectMeta,
    /// Loader-facing configuration.
    pub project: ProjectConfig,
    /// Merged default settings plus overrides. Also the config the feature
    /// gate and plugin defaults work against.
    #[serde(default)]
    pub settings: Value,
    /// Domain data.
    #[serde(default)]
    pub model: Value,
    #[serde(default)]
    pub runtime_hints: Value,
    /// Top-level fields not named above, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMeta {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_preset: Option<String>,
    #[serde(default)]
    pub version: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub project_type: Option<String>,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_pack: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One project's UI state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub schema: String,
    pub layout: UiLayout,
    #[serde(default)]
    pub inspector: Value,
    #[serde(default)]
    pub draft: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiLayout {
    pub active_panel: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UiState {
    pub fn new(active_panel: impl Into<String>) -> Self {
        Self {
            schema: UI_SCHEMA.to_string(),
            layout: UiLayout {
                active_panel: active_panel.into(),
                extra: Map::new(),
            },
            inspector: json!({ "selection": null }),
            draft: json!({}),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectIndexEntry {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert `entry` at the front, or refresh name and `updated_at` of the existing
/// entry with the same id. Returns whether the entry was new.
pub fn upsert_index(index: &mut Vec<ProjectIndexEntry>, entry: ProjectIndexEntry) -> bool {
    match index.iter_mut().find(|e| e.id == entry.id) {
        Some(existing) => {
            existing.name = entry.name;
            existing.updated_at = entry.updated_at;
            false
        }
        None => {
            index.insert(0, entry);
            true
        }
    }
}

struct DocumentMigration {
    from: &'static str,
    to: &'static str,
    apply: fn(&mut Map<String, Value>),
}

const PROJECT_MIGRATIONS: &[DocumentMigration] = &[DocumentMigration {
    from: PROJECT_SCHEMA_V1,
    to: PROJECT_SCHEMA,
    apply: project_v1_to_v2,
}];

const UI_MIGRATIONS: &[DocumentMigration] = &[DocumentMigration {
    from: UI_SCHEMA_V1,
    to: UI_SCHEMA,
    apply: ui_v1_to_v2,
}];

/// v1 kept settings under `config` and had no `model`, `runtimeHints` or
/// `meta.version`.
fn project_v1_to_v2(doc: &mut Map<String, Value>) {
    if !doc.contains_key("settings") {
        let settings = doc.remove("config").unwrap_or_else(|| json!({}));
        doc.insert("settings".into(), settings);
    }
    doc.entry("model").or_insert_with(|| json!({}));
    doc.entry("runtimeHints").or_insert_with(|| json!({}));
    doc.entry("project").or_insert_with(|| json!({ "modules": [] }));
    if let Some(Value::Object(meta)) = doc.get_mut("meta") {
        meta.entry("version").or_insert(json!(1));
    }
}

/// v1 kept the active panel at the top level as `panel`.
fn ui_v1_to_v2(doc: &mut Map<String, Value>) {
    let panel = doc.remove("panel");
    let layout = doc.entry("layout").or_insert_with(|| json!({}));
    if let (Value::Object(layout), Some(panel)) = (layout, panel) {
        layout.entry("activePanel").or_insert(panel);
    }
    doc.entry("inspector").or_insert_with(|| json!({ "selection": null }));
    doc.entry("draft").or_insert_with(|| json!({}));
}

/// Upgrade `doc` to `current`. Untagged documents are treated as `legacy`.
/// Returns `false` for unknown tags or non-object documents.
fn migrate(
    doc: &mut Value,
    current: &str,
    legacy: &str,
    migrations: &[DocumentMigration],
) -> bool {
    let Value::Object(map) = doc else {
        return false;
    };

    loop {
        let schema = map
            .get("schema")
            .and_then(Value::as_str)
            .unwrap_or(legacy)
            .to_string();
        if schema == current {
            return true;
        }
        let Some(step) = migrations.iter().find(|m| m.from == schema) else {
            tracing::warn!(schema = %schema, "no migration path for document schema");
            return false;
        };
        tracing::info!(from = step.from, to = step.to, "migrating document");
        (step.apply)(map);
        map.insert("schema".into(), Value::String(step.to.to_string()));
    }
}

/// Decode stored project text. Anything unreadable yields `None`.
pub fn decode_project(text: &str) -> Option<ProjectState> {
    decode(text, PROJECT_SCHEMA, PROJECT_SCHEMA_V1, PROJECT_MIGRATIONS, "project")
}

/// Decode stored UI text. Anything unreadable yields `None`.
pub fn decode_ui(text: &str) -> Option<UiState> {
    decode(text, UI_SCHEMA, UI_SCHEMA_V1, UI_MIGRATIONS, "ui")
}

fn decode<T: serde::de::DeserializeOwned>(
    text: &str,
    current: &str,
    legacy: &str,
    migrations: &[DocumentMigration],
    what: &str,
) -> Option<T> {
    let mut doc: Value = match serde_json::from_str(text) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!(what, "stored document is not valid JSON: {}", e);
            return None;
        }
    };
    if !migrate(&mut doc, current, legacy, migrations) {
        return None;
    }
    match serde_json::from_value(doc) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!(what, "stored document has an unexpected shape: {}", e);
            None
        }
    }
}
