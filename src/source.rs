//! Where JSON documents come from.
//!
//! The loader and the project template builder only ever fetch whole JSON
//! documents by URL. [`HttpSource`] does that over HTTP, [`DirSource`] reads
//! them from a local asset directory and [`MemorySource`] serves them from
//! memory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{KernelError, Result};

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Fetch and decode the JSON document at `url`.
    async fn fetch_json(&self, url: &str) -> Result<Value>;
}

/// Fetch a document and decode it into `T`, rejecting malformed shapes.
pub async fn fetch_typed<T: DeserializeOwned>(
    source: &dyn DocumentSource,
    url: &str,
    what: &'static str,
) -> Result<T> {
    let value = source.fetch_json(url).await?;
    serde_json::from_value(value).map_err(|source| KernelError::InvalidDocument { what, source })
}

fn is_absolute_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// HTTP document source.
#[derive(Debug, Clone)]
pub struct HttpSource {
    base_url: Option<String>,
    client: Client,
}

impl HttpSource {
    pub fn new() -> Self {
        Self {
            base_url: None,
            client: Client::new(),
        }
    }

    /// Relative URLs are resolved against `base_url`.
    pub fn with_base(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into().trim_end_matches('/').to_string()),
            client: Client::new(),
        }
    }

    fn resolve(&self, url: &str) -> String {
        match &self.base_url {
            Some(base) if !is_absolute_url(url) => {
                format!("{}/{}", base, url.trim_start_matches('/'))
            }
            _ => url.to_string(),
        }
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentSource for HttpSource {
    async fn fetch_json(&self, url: &str) -> Result<Value> {
        let resolved = self.resolve(url);
        tracing::debug!(url = %resolved, "fetching document");

        let response = self
            .client
            .get(&resolved)
            .send()
            .await
            .map_err(|source| KernelError::Http {
                url: resolved.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(KernelError::Fetch {
                url: resolved,
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|source| KernelError::Http {
            url: resolved.clone(),
            source,
        })?;
        serde_json::from_slice(&body).map_err(|source| KernelError::Decode {
            url: resolved,
            source,
        })
    }
}

/// Reads documents from files under a root directory.
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, url: &str) -> PathBuf {
        match url.strip_prefix("file://") {
            Some(path) => PathBuf::from(path),
            None => self.root.join(url.trim_start_matches('/')),
        }
    }
}

#[async_trait]
impl DocumentSource for DirSource {
    async fn fetch_json(&self, url: &str) -> Result<Value> {
        let path = self.resolve(url);
        tracing::debug!(path = %path.display(), "reading document");

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KernelError::Fetch {
                    url: url.to_string(),
                    status: StatusCode::NOT_FOUND.as_u16(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|source| KernelError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

/// In-memory documents keyed by URL.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    documents: Arc<Mutex<HashMap<String, Value>>>,
    fetches: Arc<Mutex<Vec<String>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, document: Value) -> &Self {
        self.documents
            .lock()
            .expect("memory source lock poisoned")
            .insert(url.into(), document);
        self
    }

    /// URLs requested so far, in request order.
    pub fn fetched(&self) -> Vec<String> {
        self.fetches
            .lock()
            .expect("memory source lock poisoned")
            .clone()
    }
}

#[async_trait]
impl DocumentSource for MemorySource {
    async fn fetch_json(&self, url: &str) -> Result<Value> {
        self.fetches
            .lock()
            .expect("memory source lock poisoned")
            .push(url.to_string());
        self.documents
            .lock()
            .expect("memory source lock poisoned")
            .get(url)
            .cloned()
            .ok_or_else(|| KernelError::Fetch {
                url: url.to_string(),
                status: StatusCode::NOT_FOUND.as_u16(),
            })
    }
}
