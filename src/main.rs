use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use siteplan_kernel::bus::EventBus;
use siteplan_kernel::config::KernelConfig;
use siteplan_kernel::loader::{
    BootstrapRequest, Loader, TabRegistration, TabRender, TopbarEntry, UiSink,
};
use siteplan_kernel::persistence::{CreateProjectInput, Persistence, PROJECT_SLICE};
use siteplan_kernel::registry::{ModuleContext, ModuleDescriptor, ModuleRegistry, UiConfig};
use siteplan_kernel::source::fetch_typed;
use siteplan_kernel::store::Store;

#[derive(Parser)]
#[command(name = "siteplan")]
#[command(about = "Project store and module kernel for the site planning tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a project from the default documents and an optional template
    New {
        /// Project name
        #[arg(short, long)]
        name: String,

        /// Template key, e.g. `structure`
        #[arg(short, long)]
        template: Option<String>,

        /// Project type recorded in the project config
        #[arg(long = "type")]
        project_type: Option<String>,

        /// UI preset; the project opens on this panel
        #[arg(long)]
        preset: Option<String>,

        /// Active module keys
        #[arg(short, long = "module")]
        modules: Vec<String>,
    },
    /// List known projects, newest first
    List,
    /// Print a project's stored documents
    Show { id: String },
    /// Delete a project
    Delete { id: String },
    /// Open a project, activate its modules and assemble navigation
    Boot {
        id: String,

        #[arg(long, default_value = "menu/registry.json")]
        registry: String,

        /// Manifest pack; defaults to the one recorded in the project
        #[arg(long)]
        pack: Option<String>,

        #[arg(long, default_value = "ui/menu.json")]
        menu: String,

        #[arg(long, default_value = "modules/{key}.json")]
        modules: String,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "siteplan_kernel=info,siteplan=info".into()),
    );

    // stdout carries command output
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Prints what the loader registers.
struct ConsoleSink;

impl UiSink for ConsoleSink {
    fn register_topbar(&mut self, entry: TopbarEntry) {
        println!("topbar  {:>6}  {}  ({})", entry.order, entry.title, entry.id);
    }

    fn register_tab(&mut self, tab: TabRegistration) {
        let state = if tab.allowed { "open" } else { "locked" };
        let target = match &tab.render {
            TabRender::Plugin { plugin_id, .. } => plugin_id.clone(),
            TabRender::Placeholder { text } => format!("<{}>", text),
        };
        println!(
            "panel   {:>6}  {}  [{}]  {}",
            tab.order, tab.title, state, target
        );
    }

    fn finalize(&mut self) {
        println!("navigation ready");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = KernelConfig::from_env();
    let storage = Arc::new(config.open_storage()?);
    let source = config.document_source();
    let bus = EventBus::new();
    let store = Store::with_bus(bus.clone());
    let persistence = Persistence::new(
        storage,
        store.clone(),
        bus.clone(),
        source.clone(),
        config.persistence_config(),
    );

    match cli.command {
        Commands::New {
            name,
            template,
            project_type,
            preset,
            modules,
        } => {
            let created = persistence
                .create_project(CreateProjectInput {
                    template_key: template,
                    name,
                    project_type,
                    ui_preset: preset,
                    modules,
                })
                .await?;
            println!("{}", created.id);
        }
        Commands::List => {
            for entry in persistence.list_projects() {
                println!(
                    "{}  {}  (updated {})",
                    entry.id,
                    entry.name,
                    entry.updated_at.to_rfc3339()
                );
            }
        }
        Commands::Show { id } => {
            let loaded = persistence.load(&id);
            let doc = serde_json::json!({ "project": loaded.project, "ui": loaded.ui });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::Delete { id } => {
            if !persistence.delete_project(&id)? {
                println!("{} was not in the project index", id);
            }
        }
        Commands::Boot {
            id,
            registry,
            pack,
            menu,
            modules,
        } => {
            let loaded = persistence.open_project(&id)?;
            let project = loaded
                .project
                .with_context(|| format!("project {} has no readable document", id))?;

            let loader = Loader::new(source.clone());
            let mut modules_registry = ModuleRegistry::new();
            for manifest in loader
                .fetch_module_manifests(&modules, project.project.modules.as_slice())
                .await?
            {
                modules_registry.register(ModuleDescriptor::new(manifest))?;
            }
            let context = ModuleContext {
                bus: bus.clone(),
                store: store.clone(),
                project_config: project.settings.clone(),
            };
            let order = modules_registry.activate(project.project.modules.as_slice(), &context)?;
            println!("activated: {}", order.join(" -> "));

            let ui_config: UiConfig = fetch_typed(source.as_ref(), &menu, "ui config").await?;
            let menu_model = modules_registry.compute_menu_model(&ui_config, order.as_slice());
            for group in &menu_model.groups {
                println!("[{}]", group.label);
                for item in &group.items {
                    println!("  {}  {}", item.icon, item.label);
                }
            }

            let pack_url = pack
                .or_else(|| project.project.plugin_pack.clone())
                .context("no manifest pack given and none recorded in the project")?;
            let boot = loader
                .bootstrap(
                    BootstrapRequest {
                        app_mode: config.app_mode,
                        project_config: project.settings.clone(),
                        registry_url: registry,
                        pack_url,
                    },
                    &mut ConsoleSink,
                )
                .await?;

            if boot.project_config != project.settings {
                store.update(PROJECT_SLICE, |draft| {
                    draft["settings"] = boot.project_config.clone();
                });
                let report = persistence.save_now(&id);
                tracing::info!(ok = report.ok, "plugin defaults saved");
            }
        }
    }

    Ok(())
}
