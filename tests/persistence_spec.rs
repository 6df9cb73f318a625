use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use siteplan_kernel::bus::{self, handler, EventBus};
use siteplan_kernel::persistence::*;
use siteplan_kernel::source::MemorySource;
use siteplan_kernel::storage::{KeyValueStorage, MemoryStorage, SqliteStorage};
use siteplan_kernel::store::Store;
use siteplan_kernel::KernelError;

struct Harness {
    storage: MemoryStorage,
    store: Store,
    bus: EventBus,
    source: MemorySource,
    persistence: Persistence,
}

fn documents() -> MemorySource {
    let source = MemorySource::new();
    source.insert(
        "defaults/settings.json",
        json!({ "units": "m", "grid": { "size": 1, "snap": true } }),
    );
    source.insert(
        "defaults/features.json",
        json!({ "features": { "flags": { "crane": false } } }),
    );
    source.insert(
        "templates/structure.json",
        json!({ "grid": { "size": 5 }, "features": { "flags": { "crane": true } } }),
    );
    source
}

fn setup() -> Harness {
    let storage = MemoryStorage::new();
    let bus = EventBus::new();
    let store = Store::with_bus(bus.clone());
    let source = documents();
    let persistence = Persistence::new(
        Arc::new(storage.clone()),
        store.clone(),
        bus.clone(),
        Arc::new(source.clone()),
        PersistenceConfig::default(),
    );
    Harness {
        storage,
        store,
        bus,
        source,
        persistence,
    }
}

fn hall_a() -> CreateProjectInput {
    CreateProjectInput {
        template_key: Some("structure".to_string()),
        name: "Hall A".to_string(),
        project_type: Some("structure".to_string()),
        ui_preset: None,
        modules: vec!["site".to_string(), "cranes".to_string()],
    }
}

fn status_events(bus: &EventBus) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(
        bus::PERSISTENCE_STATUS,
        handler(move |payload| {
            sink.lock().unwrap().push(payload.clone());
            Ok(())
        }),
    );
    seen
}

fn writes_to(storage: &MemoryStorage, key: &str) -> usize {
    storage.writes().iter().filter(|k| *k == key).count()
}

mod create_project {
    use super::*;

    #[tokio::test]
    async fn builds_settings_from_defaults_then_template() {
        let h = setup();
        let created = h.persistence.create_project(hall_a()).await.expect("create");

        assert_eq!(
            created.project.settings,
            json!({
                "units": "m",
                "grid": { "size": 5, "snap": true },
                "features": { "flags": { "crane": true } }
            })
        );
        assert_eq!(
            h.source.fetched(),
            vec![
                "defaults/settings.json",
                "defaults/features.json",
                "templates/structure.json"
            ]
        );
    }

    #[tokio::test]
    async fn round_trips_through_storage() {
        let h = setup();
        let created = h.persistence.create_project(hall_a()).await.expect("create");

        let loaded = h.persistence.load(&created.id);
        let project = loaded.project.expect("project document");
        let ui = loaded.ui.expect("ui document");

        assert_eq!(project, created.project);
        assert_eq!(project.schema, PROJECT_SCHEMA);
        assert_eq!(project.meta.name, "Hall A");
        assert_eq!(project.meta.template_key.as_deref(), Some("structure"));
        assert_eq!(project.project.project_type.as_deref(), Some("structure"));
        assert_eq!(project.project.modules, vec!["site", "cranes"]);
        assert_eq!(ui.schema, UI_SCHEMA);
        assert_eq!(ui.layout.active_panel, "site");
    }

    #[tokio::test]
    async fn records_the_project_in_the_index() {
        let h = setup();
        let first = h.persistence.create_project(hall_a()).await.expect("create");
        let second = h
            .persistence
            .create_project(CreateProjectInput {
                name: "Depot".to_string(),
                ..CreateProjectInput::default()
            })
            .await
            .expect("create");

        let index = h.persistence.list_projects();
        let ids: Vec<&str> = index.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);
        assert_eq!(index[1].name, "Hall A");
    }

    #[tokio::test]
    async fn opens_on_the_ui_preset_panel() {
        let h = setup();
        let created = h
            .persistence
            .create_project(CreateProjectInput {
                ui_preset: Some("logistics".to_string()),
                ..hall_a()
            })
            .await
            .expect("create");

        assert_eq!(created.project.meta.ui_preset.as_deref(), Some("logistics"));
        assert_eq!(created.ui.layout.active_panel, "logistics");
        let ui = h.persistence.load(&created.id).ui.expect("ui document");
        assert_eq!(ui.layout.active_panel, "logistics");
    }

    #[tokio::test]
    async fn fails_without_writing_when_the_template_is_missing() {
        let h = setup();
        let result = h
            .persistence
            .create_project(CreateProjectInput {
                template_key: Some("bridge".to_string()),
                ..hall_a()
            })
            .await;

        assert!(matches!(result, Err(KernelError::Fetch { status: 404, .. })));
        assert!(h.storage.writes().is_empty());
        assert!(h.persistence.list_projects().is_empty());
    }
}

mod load {
    use super::*;

    #[tokio::test]
    async fn returns_nothing_for_an_unknown_project() {
        let h = setup();
        assert_eq!(h.persistence.load("sp-2026-00000000"), LoadedProject::default());
        assert!(h.persistence.open_project("sp-2026-00000000").is_err());
    }

    #[tokio::test]
    async fn treats_corrupt_documents_as_missing() {
        let h = setup();
        let config = h.persistence.config().clone();
        h.storage.set_item(&config.project_key("broken"), "{ nope").unwrap();
        h.storage
            .set_item(&config.ui_key("broken"), r#"{"schema":"siteplan.ui/99"}"#)
            .unwrap();

        assert_eq!(h.persistence.load("broken"), LoadedProject::default());
    }

    #[tokio::test]
    async fn upgrades_version_one_documents() {
        let h = setup();
        let config = h.persistence.config().clone();
        h.storage
            .set_item(
                &config.project_key("legacy"),
                &json!({
                    "schema": "siteplan.project/1",
                    "meta": {
                        "id": "legacy",
                        "name": "Old yard",
                        "createdAt": "2024-03-01T08:00:00Z",
                        "updatedAt": "2024-03-02T08:00:00Z"
                    },
                    "config": { "units": "ft" }
                })
                .to_string(),
            )
            .unwrap();
        h.storage
            .set_item(&config.ui_key("legacy"), &json!({ "panel": "logistics" }).to_string())
            .unwrap();

        let loaded = h.persistence.load("legacy");
        let project = loaded.project.expect("migrated project");
        let ui = loaded.ui.expect("migrated ui");

        assert_eq!(project.schema, PROJECT_SCHEMA);
        assert_eq!(project.settings, json!({ "units": "ft" }));
        assert_eq!(project.meta.version, 1);
        assert_eq!(ui.layout.active_panel, "logistics");
    }

    #[tokio::test]
    async fn open_project_fills_the_store() {
        let h = setup();
        let created = h.persistence.create_project(hall_a()).await.expect("create");

        h.persistence.open_project(&created.id).expect("open");

        let project = h.store.get(PROJECT_SLICE).expect("project slice");
        assert_eq!(project["meta"]["name"], json!("Hall A"));
        assert_eq!(project["project"]["type"], json!("structure"));
        let ui = h.store.get(UI_SLICE).expect("ui slice");
        assert_eq!(ui["layout"]["activePanel"], json!("site"));
    }
}

mod save_now {
    use super::*;

    #[tokio::test]
    async fn writes_both_slots_and_reports_success() {
        let h = setup();
        let created = h.persistence.create_project(hall_a()).await.expect("create");
        h.persistence.open_project(&created.id).expect("open");
        let events = status_events(&h.bus);

        h.store.update(PROJECT_SLICE, |draft| {
            draft["meta"]["name"] = json!("Hall A (revised)");
        });
        let report = h.persistence.save_now(&created.id);

        assert!(report.ok);
        assert_eq!(report.project, SlotWrite::Written);
        assert_eq!(report.ui, SlotWrite::Written);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["ok"], json!(true));
        assert_eq!(events[0]["projectId"], json!(created.id));

        let reloaded = h.persistence.load(&created.id).project.unwrap();
        assert_eq!(reloaded.meta.name, "Hall A (revised)");
        assert_eq!(h.persistence.list_projects()[0].name, "Hall A (revised)");
    }

    #[tokio::test]
    async fn load_returns_exactly_what_was_saved() {
        let h = setup();
        let created = h.persistence.create_project(hall_a()).await.expect("create");
        h.persistence.open_project(&created.id).expect("open");

        h.store.update(PROJECT_SLICE, |draft| {
            draft["meta"]["description"] = json!("North hall extension");
            draft["project"]["license"] = json!("site-pro");
            draft["annotations"] = json!({ "reviewedBy": "planning office" });
        });
        h.store.update(UI_SLICE, |draft| {
            draft["layout"]["split"] = json!(0.4);
            draft["toolbar"] = json!({ "pinned": ["measure"] });
        });
        let report = h.persistence.save_now(&created.id);
        assert!(report.ok);

        let mut expected = h.store.get(PROJECT_SLICE).unwrap();
        expected["meta"]["updatedAt"] = serde_json::to_value(report.saved_at).unwrap();
        let loaded = h.persistence.load(&created.id);

        let project = loaded.project.expect("project document");
        assert_eq!(project.meta.extra["description"], json!("North hall extension"));
        assert_eq!(serde_json::to_value(&project).unwrap(), expected);
        assert_eq!(
            serde_json::to_value(loaded.ui.expect("ui document")).unwrap(),
            h.store.get(UI_SLICE).unwrap()
        );
    }

    #[tokio::test]
    async fn stamps_the_document_with_the_save_time() {
        let h = setup();
        let created = h.persistence.create_project(hall_a()).await.expect("create");
        h.persistence.open_project(&created.id).expect("open");
        let before = h.store.get(PROJECT_SLICE).unwrap();

        let report = h.persistence.save_now(&created.id);

        let project = h.persistence.load(&created.id).project.unwrap();
        assert_eq!(project.meta.updated_at, report.saved_at);
        assert_eq!(project.meta.created_at, created.project.meta.created_at);
        assert_eq!(h.persistence.list_projects()[0].updated_at, report.saved_at);
        assert_eq!(h.store.get(PROJECT_SLICE).unwrap(), before, "the store slice is left alone");
    }

    #[tokio::test]
    async fn refuses_a_project_slice_that_could_not_be_read_back() {
        let h = setup();
        let events = status_events(&h.bus);

        h.store.set(PROJECT_SLICE, json!({ "meta": { "name": "draft" } }));
        let report = h.persistence.save_now("sp-2026-0000beef");

        assert!(!report.ok);
        assert_eq!(report.project, SlotWrite::Failed);
        assert_eq!(report.ui, SlotWrite::Absent);
        assert!(h.storage.writes().is_empty());
        assert!(h.persistence.list_projects().is_empty());
        assert_eq!(events.lock().unwrap()[0]["ok"], json!(false));
    }

    #[tokio::test]
    async fn refuses_a_ui_slice_with_an_unknown_schema() {
        let h = setup();
        let created = h.persistence.create_project(hall_a()).await.expect("create");
        h.persistence.open_project(&created.id).expect("open");

        h.store.set(
            UI_SLICE,
            json!({ "schema": "siteplan.ui/9", "layout": { "activePanel": "cranes" } }),
        );
        let report = h.persistence.save_now(&created.id);

        assert!(!report.ok);
        assert_eq!(report.project, SlotWrite::Written);
        assert_eq!(report.ui, SlotWrite::Failed);
        let ui = h.persistence.load(&created.id).ui.expect("earlier ui document");
        assert_eq!(ui.layout.active_panel, "site");
    }

    #[tokio::test]
    async fn keeps_the_project_when_the_ui_write_fails() {
        let h = setup();
        let created = h.persistence.create_project(hall_a()).await.expect("create");
        h.persistence.open_project(&created.id).expect("open");
        h.storage.fail_writes_matching(":ui:");
        let events = status_events(&h.bus);

        h.store.update(PROJECT_SLICE, |draft| {
            draft["model"] = json!({ "cranes": 2 });
        });
        let report = h.persistence.save_now(&created.id);

        assert!(!report.ok);
        assert_eq!(report.project, SlotWrite::Written);
        assert_eq!(report.ui, SlotWrite::Failed);
        assert_eq!(events.lock().unwrap()[0]["ok"], json!(false));

        let reloaded = h.persistence.load(&created.id);
        assert_eq!(reloaded.project.unwrap().model, json!({ "cranes": 2 }));
        assert!(reloaded.ui.is_some(), "the earlier ui document survives");
    }

    #[tokio::test]
    async fn skips_slices_that_are_not_loaded() {
        let h = setup();
        let events = status_events(&h.bus);

        let report = h.persistence.save_now("sp-2026-feedbeef");

        assert!(report.ok);
        assert_eq!(report.project, SlotWrite::Absent);
        assert_eq!(report.ui, SlotWrite::Absent);
        assert!(h.storage.writes().is_empty());
        assert_eq!(events.lock().unwrap().len(), 1);
    }
}

mod autosave {
    use super::*;

    const SETTLE: Duration = Duration::from_millis(300);

    #[tokio::test(start_paused = true)]
    async fn coalesces_a_burst_of_changes_into_one_save() {
        let h = setup();
        let created = h.persistence.create_project(hall_a()).await.expect("create");
        h.persistence.open_project(&created.id).expect("open");
        let key = h.persistence.config().project_key(&created.id);
        let before = writes_to(&h.storage, &key);

        h.persistence.enable_autosave(&created.id).expect("autosave");
        for size in 1..=5 {
            h.store.update(PROJECT_SLICE, |draft| {
                draft["settings"]["grid"]["size"] = json!(size);
            });
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(SETTLE).await;

        assert_eq!(writes_to(&h.storage, &key), before + 1);
        let saved = h.persistence.load(&created.id).project.unwrap();
        assert_eq!(saved.settings["grid"]["size"], json!(5));
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_unrelated_slices() {
        let h = setup();
        let created = h.persistence.create_project(hall_a()).await.expect("create");
        h.persistence.open_project(&created.id).expect("open");
        let writes = h.storage.writes().len();

        h.persistence.enable_autosave(&created.id).expect("autosave");
        h.store.set("scratch", json!({ "cursor": [1, 2] }));
        tokio::time::sleep(SETTLE).await;

        assert_eq!(h.storage.writes().len(), writes);
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_drops_the_pending_save() {
        let h = setup();
        let created = h.persistence.create_project(hall_a()).await.expect("create");
        h.persistence.open_project(&created.id).expect("open");
        let writes = h.storage.writes().len();

        h.persistence.enable_autosave(&created.id).expect("autosave");
        h.store.update(UI_SLICE, |draft| {
            draft["layout"]["activePanel"] = json!("logistics");
        });
        h.persistence.disable_autosave();
        tokio::time::sleep(SETTLE).await;

        assert!(!h.persistence.autosave_enabled());
        assert_eq!(h.storage.writes().len(), writes);
        assert_eq!(h.bus.subscriber_count(bus::STORE_CHANGED), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn enabling_twice_subscribes_once() {
        let h = setup();
        h.persistence.enable_autosave("sp-2026-0000aaaa").expect("autosave");
        h.persistence.enable_autosave("sp-2026-0000aaaa").expect("autosave");

        assert!(h.persistence.autosave_enabled());
        assert_eq!(h.bus.subscriber_count(bus::STORE_CHANGED), 1);
    }

    #[test]
    fn needs_a_runtime() {
        let h = setup();
        let err = h.persistence.enable_autosave("sp-2026-0000aaaa").unwrap_err();
        assert!(matches!(err, KernelError::Runtime(_)));
        assert!(!h.persistence.autosave_enabled());
    }
}

mod delete_project {
    use super::*;

    #[tokio::test]
    async fn removes_documents_and_index_entry() {
        let h = setup();
        let created = h.persistence.create_project(hall_a()).await.expect("create");

        assert!(h.persistence.delete_project(&created.id).expect("delete"));

        assert_eq!(h.persistence.load(&created.id), LoadedProject::default());
        assert!(h.persistence.list_projects().is_empty());
        assert!(!h.persistence.delete_project(&created.id).expect("delete again"));
    }
}

mod sqlite_storage {
    use super::*;

    #[tokio::test]
    async fn projects_survive_reopening_the_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("siteplan.db");

        let id = {
            let storage = SqliteStorage::open(path.clone()).expect("open");
            storage.migrate().expect("migrate");
            let persistence = Persistence::new(
                Arc::new(storage),
                Store::new(),
                EventBus::new(),
                Arc::new(documents()),
                PersistenceConfig::default(),
            );
            persistence.create_project(hall_a()).await.expect("create").id
        };

        let storage = SqliteStorage::open(path).expect("reopen");
        storage.migrate().expect("migrate again");
        let prefix = format!("siteplan:project:{}", id);
        assert_eq!(storage.keys_with_prefix(&prefix).unwrap(), vec![prefix.clone()]);

        let persistence = Persistence::new(
            Arc::new(storage),
            Store::new(),
            EventBus::new(),
            Arc::new(documents()),
            PersistenceConfig::default(),
        );
        let project = persistence.load(&id).project.expect("project");
        assert_eq!(project.meta.name, "Hall A");
        assert_eq!(persistence.list_projects()[0].id, id);
    }
}
