//! Error types shared across the kernel.

use thiserror::Error;

/// Errors raised while resolving the module dependency graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle detected at module '{key}'")]
    Cycle { key: String },

    #[error("module '{key}' is active but was never registered")]
    UnregisteredModule { key: String },
}

/// Kernel errors.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("initializer for module '{key}' failed: {source}")]
    ModuleInit {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("fetch of {url} failed with status {status}")]
    Fetch { url: String, status: u16 },

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("document at {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {what} document: {source}")]
    InvalidDocument {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl KernelError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether this error came from the dependency graph.
    pub fn is_graph_error(&self) -> bool {
        matches!(self, Self::Graph(_))
    }
}

pub type Result<T, E = KernelError> = std::result::Result<T, E>;
