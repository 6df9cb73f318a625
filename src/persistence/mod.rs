//! Project persistence: documents in key-value storage, the project index,
//! project creation from templates, and debounced autosave of store slices.

mod autosave;
mod documents;

pub use autosave::DebounceTask;
pub use documents::*;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::bus::{self, EventBus, Handler};
use crate::error::{KernelError, Result};
use crate::merge;
use crate::source::DocumentSource;
use crate::storage::KeyValueStorage;
use crate::store::Store;

/// Store slice holding the open project's [`ProjectState`].
pub const PROJECT_SLICE: &str = "project";
/// Store slice holding the open project's [`UiState`].
pub const UI_SLICE: &str = "ui";

pub const DEFAULT_AUTOSAVE_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Prefix of every storage key.
    pub namespace: String,
    /// Default settings documents, merged in order.
    pub default_documents: Vec<String>,
    /// Template document URL; `{template}` is replaced by the template key.
    pub template_url: String,
    /// Panel a freshly created project opens on.
    pub initial_panel: String,
    /// Manifest pack recorded in new projects.
    pub plugin_pack: Option<String>,
    pub autosave_delay: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            namespace: "siteplan".to_string(),
            default_documents: vec![
                "defaults/settings.json".to_string(),
                "defaults/features.json".to_string(),
            ],
            template_url: "templates/{template}.json".to_string(),
            initial_panel: "site".to_string(),
            plugin_pack: Some("plugins/pack.json".to_string()),
            autosave_delay: DEFAULT_AUTOSAVE_DELAY,
        }
    }
}

impl PersistenceConfig {
    pub fn project_key(&self, project_id: &str) -> String {
        format!("{}:project:{}", self.namespace, project_id)
    }

    pub fn ui_key(&self, project_id: &str) -> String {
        format!("{}:ui:{}", self.namespace, project_id)
    }

    pub fn index_key(&self) -> String {
        format!("{}:index", self.namespace)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateProjectInput {
    pub template_key: Option<String>,
    pub name: String,
    pub project_type: Option<String>,
    pub ui_preset: Option<String>,
    pub modules: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedProject {
    pub id: String,
    pub project: ProjectState,
    pub ui: UiState,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedProject {
    pub project: Option<ProjectState>,
    pub ui: Option<UiState>,
}

/// Outcome of writing one store slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWrite {
    Written,
    /// The slice was not in the store; nothing to write.
    Absent,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SaveReport {
    pub ok: bool,
    pub project: SlotWrite,
    pub ui: SlotWrite,
    pub saved_at: DateTime<Utc>,
}

struct AutosaveState {
    project_id: String,
    handler: Handler,
    task: Arc<DebounceTask>,
}

struct Inner {
    storage: Arc<dyn KeyValueStorage>,
    store: Store,
    bus: EventBus,
    source: Arc<dyn DocumentSource>,
    config: PersistenceConfig,
    autosave: Mutex<Option<AutosaveState>>,
}

#[derive(Clone)]
pub struct Persistence {
    inner: Arc<Inner>,
}

impl Persistence {
    /// `store` is expected to publish on `bus`; autosave listens there.
    pub fn new(
        storage: Arc<dyn KeyValueStorage>,
        store: Store,
        bus: EventBus,
        source: Arc<dyn DocumentSource>,
        config: PersistenceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                store,
                bus,
                source,
                config,
                autosave: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    // ============================================================
    // Reading
    // ============================================================

    /// Read both documents of a project. Missing or unreadable documents are
    /// `None`; this never fails.
    pub fn load(&self, project_id: &str) -> LoadedProject {
        let config = &self.inner.config;
        LoadedProject {
            project: self
                .read_text(&config.project_key(project_id))
                .and_then(|text| decode_project(&text)),
            ui: self
                .read_text(&config.ui_key(project_id))
                .and_then(|text| decode_ui(&text)),
        }
    }

    /// Load a project and put its documents into the store's slices.
    pub fn open_project(&self, project_id: &str) -> Result<LoadedProject> {
        let loaded = self.load(project_id);
        let Some(project) = &loaded.project else {
            return Err(KernelError::configuration(format!(
                "project '{}' not found",
                project_id
            )));
        };

        let store = &self.inner.store;
        store.set(PROJECT_SLICE, to_value(project, "project")?);
        if let Some(ui) = &loaded.ui {
            store.set(UI_SLICE, to_value(ui, "ui")?);
        }
        tracing::info!(project_id, "project opened");
        Ok(loaded)
    }

    pub fn list_projects(&self) -> Vec<ProjectIndexEntry> {
        self.read_index()
    }

    // ============================================================
    // Writing
    // ============================================================

    /// Write the `project` and `ui` slices for `project_id` and publish
    /// `persistence:status`.
    pub fn save_now(&self, project_id: &str) -> SaveReport {
        let config = &self.inner.config;
        let saved_at = Utc::now();
        let mut project_slice = self.inner.store.get(PROJECT_SLICE);
        if let Some(meta) = project_slice
            .as_mut()
            .and_then(|slice| slice.get_mut("meta"))
            .and_then(Value::as_object_mut)
        {
            if let Ok(stamp) = serde_json::to_value(saved_at) {
                meta.insert("updatedAt".to_string(), stamp);
            }
        }

        let project = self.write_slot(
            &config.project_key(project_id),
            project_slice.as_ref(),
            |text| decode_project(text).is_some(),
        );
        let ui = self.write_slot(
            &config.ui_key(project_id),
            self.inner.store.get(UI_SLICE).as_ref(),
            |text| decode_ui(text).is_some(),
        );

        let mut ok = project != SlotWrite::Failed && ui != SlotWrite::Failed;

        if project == SlotWrite::Written {
            if let Some(slice) = &project_slice {
                let created_at = slice
                    .pointer("/meta/createdAt")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map_or(saved_at, |d| d.with_timezone(&Utc));
                let name = slice
                    .pointer("/meta/name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let entry = ProjectIndexEntry {
                    id: project_id.to_string(),
                    name,
                    created_at,
                    updated_at: saved_at,
                };
                if let Err(e) = self.upsert_index_entry(entry) {
                    tracing::warn!(project_id, "failed to update project index: {}", e);
                    ok = false;
                }
            }
        }

        tracing::debug!(project_id, ok, ?project, ?ui, "save finished");
        self.inner.bus.publish(
            bus::PERSISTENCE_STATUS,
            &json!({
                "ok": ok,
                "projectId": project_id,
                "savedAt": saved_at.to_rfc3339(),
            }),
        );

        SaveReport {
            ok,
            project,
            ui,
            saved_at,
        }
    }

    /// Create a project from the default documents plus an optional template,
    /// persist it and record it in the index.
    pub async fn create_project(&self, input: CreateProjectInput) -> Result<CreatedProject> {
        let config = &self.inner.config;
        let id = generate_project_id();

        let mut documents = Vec::with_capacity(config.default_documents.len() + 1);
        for url in &config.default_documents {
            documents.push(self.inner.source.fetch_json(url).await?);
        }
        if let Some(template) = &input.template_key {
            let url = config.template_url.replace("{template}", template);
            documents.push(self.inner.source.fetch_json(&url).await?);
        }
        let settings = merge::merge_all(&documents);

        let now = Utc::now();
        let project = ProjectState {
            schema: PROJECT_SCHEMA.to_string(),
            meta: ProjectMeta {
                id: id.clone(),
                name: input.name,
                created_at: now,
                updated_at: now,
                template_key: input.template_key,
                ui_preset: input.ui_preset.clone(),
                version: 1,
                extra: Map::new(),
            },
            project: ProjectConfig {
                project_type: input.project_type,
                modules: input.modules,
                plugin_pack: config.plugin_pack.clone(),
                extra: Map::new(),
            },
            settings,
            model: json!({}),
            runtime_hints: json!({}),
            extra: Map::new(),
        };

        let ui = UiState::new(
            input
                .ui_preset
                .unwrap_or_else(|| config.initial_panel.clone()),
        );

        let storage = &self.inner.storage;
        storage.set_item(&config.project_key(&id), &to_text(&project, "project")?)?;
        storage.set_item(&config.ui_key(&id), &to_text(&ui, "ui")?)?;
        self.upsert_index_entry(ProjectIndexEntry {
            id: id.clone(),
            name: project.meta.name.clone(),
            created_at: now,
            updated_at: now,
        })?;

        tracing::info!(project_id = %id, name = %project.meta.name, "project created");
        Ok(CreatedProject { id, project, ui })
    }

    /// Remove a project's documents and its index entry. Returns whether the
    /// project was in the index.
    pub fn delete_project(&self, project_id: &str) -> Result<bool> {
        let config = &self.inner.config;
        let storage = &self.inner.storage;
        storage.remove_item(&config.project_key(project_id))?;
        storage.remove_item(&config.ui_key(project_id))?;

        let mut index = self.read_index();
        let before = index.len();
        index.retain(|e| e.id != project_id);
        let removed = index.len() != before;
        if removed {
            self.write_index(&index)?;
        }
        tracing::info!(project_id, removed, "project deleted");
        Ok(removed)
    }

    // ============================================================
    // Autosave
    // ============================================================

    /// Save `project_id` shortly after the `project` or `ui` slice changes.
    /// Calling this again while autosave is on does nothing.
    pub fn enable_autosave(&self, project_id: &str) -> Result<()> {
        let mut autosave = self.inner.autosave.lock().expect("autosave lock poisoned");
        if let Some(state) = autosave.as_ref() {
            tracing::debug!(active = %state.project_id, "autosave already enabled");
            return Ok(());
        }

        let task = DebounceTask::try_current()
            .map(Arc::new)
            .ok_or_else(|| KernelError::Runtime("autosave requires a tokio runtime".into()))?;

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let delay = self.inner.config.autosave_delay;
        let id = project_id.to_string();
        let timer = task.clone();
        let handler = bus::handler(move |payload| {
            let key = payload.get("key").and_then(Value::as_str).unwrap_or_default();
            if key != PROJECT_SLICE && key != UI_SLICE {
                return Ok(());
            }
            let weak = weak.clone();
            let id = id.clone();
            timer.schedule(delay, move || {
                if let Some(inner) = weak.upgrade() {
                    Persistence { inner }.save_now(&id);
                }
            });
            Ok(())
        });

        self.inner.bus.subscribe(bus::STORE_CHANGED, handler.clone());
        *autosave = Some(AutosaveState {
            project_id: project_id.to_string(),
            handler,
            task,
        });
        tracing::info!(project_id, "autosave enabled");
        Ok(())
    }

    /// Stop autosave and drop any pending write.
    pub fn disable_autosave(&self) {
        let state = self
            .inner
            .autosave
            .lock()
            .expect("autosave lock poisoned")
            .take();
        if let Some(state) = state {
            state.task.cancel();
            self.inner.bus.unsubscribe(bus::STORE_CHANGED, &state.handler);
            tracing::info!(project_id = %state.project_id, "autosave disabled");
        }
    }

    pub fn autosave_enabled(&self) -> bool {
        self.inner
            .autosave
            .lock()
            .expect("autosave lock poisoned")
            .is_some()
    }

    // ============================================================
    // Helpers
    // ============================================================

    fn read_text(&self, key: &str) -> Option<String> {
        match self.inner.storage.get_item(key) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(key, "storage read failed: {}", e);
                None
            }
        }
    }

    /// Write one slice. Text that `readable` rejects would be lost on the next
    /// `load`, so it is not written.
    fn write_slot<F>(&self, key: &str, slice: Option<&Value>, readable: F) -> SlotWrite
    where
        F: Fn(&str) -> bool,
    {
        let Some(slice) = slice else {
            return SlotWrite::Absent;
        };
        let text = match serde_json::to_string(slice) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(key, "failed to encode slice: {}", e);
                return SlotWrite::Failed;
            }
        };
        if !readable(&text) {
            tracing::warn!(key, "slice is not a readable document, not writing it");
            return SlotWrite::Failed;
        }
        match self.inner.storage.set_item(key, &text) {
            Ok(()) => SlotWrite::Written,
            Err(e) => {
                tracing::warn!(key, "failed to write slice: {}", e);
                SlotWrite::Failed
            }
        }
    }

    fn read_index(&self) -> Vec<ProjectIndexEntry> {
        let Some(text) = self.read_text(&self.inner.config.index_key()) else {
            return Vec::new();
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::warn!("project index is unreadable, starting over: {}", e);
            Vec::new()
        })
    }

    fn write_index(&self, index: &[ProjectIndexEntry]) -> Result<()> {
        let text = serde_json::to_string(index).map_err(|source| KernelError::InvalidDocument {
            what: "project index",
            source,
        })?;
        self.inner
            .storage
            .set_item(&self.inner.config.index_key(), &text)
    }

    fn upsert_index_entry(&self, entry: ProjectIndexEntry) -> Result<()> {
        let mut index = self.read_index();
        upsert_index(&mut index, entry);
        self.write_index(&index)
    }
}

/// `sp-<year>-<8 hex chars>`.
pub fn generate_project_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("sp-{}-{}", Utc::now().year(), &suffix[..8])
}

fn to_value<T: Serialize>(doc: &T, what: &'static str) -> Result<Value> {
    serde_json::to_value(doc).map_err(|source| KernelError::InvalidDocument { what, source })
}

fn to_text<T: Serialize>(doc: &T, what: &'static str) -> Result<String> {
    serde_json::to_string(doc).map_err(|source| KernelError::InvalidDocument { what, source })
}
