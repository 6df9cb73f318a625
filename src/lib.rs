//! Module composition and project persistence kernel for the site planning tool.
//!
//! # Components
//!
//! - [`bus::EventBus`]: synchronous publish/subscribe, the channel everything reports on.
//! - [`gate::FeatureGate`]: decides whether a feature key is permitted.
//! - [`store::Store`]: keyed JSON state slices with change events.
//! - [`registry::ModuleRegistry`]: module manifests, activation order, menu model.
//! - [`loader::Loader`]: builds navigation from the menu registry and plugin manifests.
//! - [`persistence::Persistence`]: project documents, project index, autosave.
//!
//! Every component is an explicit value. Nothing is process-global; callers
//! wire instances together and tests build isolated sets.

pub mod bus;
pub mod config;
pub mod error;
pub mod gate;
pub mod loader;
pub mod merge;
pub mod persistence;
pub mod registry;
pub mod source;
pub mod storage;
pub mod store;

pub use error::{GraphError, KernelError, Result};
