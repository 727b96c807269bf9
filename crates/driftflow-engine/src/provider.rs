//! Provider capability definition

use crate::error::{EngineError, RemoteError, Result};
use crate::resource::{Attributes, ResourceId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Provider abstraction trait
///
/// A provider translates abstract resource operations into remote calls for
/// the resource types it owns. Every error must be classified as retryable
/// or fatal through [`RemoteError`]. Calls for unrelated resources may be
/// issued concurrently.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Tag used by declarations to select this provider (e.g. "local")
    fn name(&self) -> &str;

    /// Schema of a resource type; defaults to "every field updatable in place"
    fn schema(&self, _resource_type: &str) -> ResourceSchema {
        ResourceSchema::default()
    }

    /// Create the remote object, returning computed outputs
    async fn create(&self, id: &ResourceId, attributes: &Attributes) -> RemoteResult<Attributes>;

    /// Read the live object; `Ok(None)` when it no longer exists
    async fn read(&self, id: &ResourceId, current: &Attributes)
    -> RemoteResult<Option<Attributes>>;

    /// Apply `changed` fields of `desired` to the object described by `prior`
    async fn update(
        &self,
        id: &ResourceId,
        prior: &Attributes,
        desired: &Attributes,
        changed: &[String],
    ) -> RemoteResult<Attributes>;

    /// Destroy the object described by `prior`
    async fn delete(&self, id: &ResourceId, prior: &Attributes) -> RemoteResult<()>;
}

/// How a replacement is sequenced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceMode {
    /// New object first, old one destroyed afterwards
    #[default]
    CreateBeforeDestroy,
    /// Old and new objects cannot coexist; destroy strictly first
    DestroyBeforeCreate,
}

/// Provider-declared properties of a resource type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Fields whose change forces a replacement
    pub force_new: BTreeSet<String>,

    pub replace_mode: ReplaceMode,
}

impl ResourceSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_new<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.force_new.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn destroy_before_create(mut self) -> Self {
        self.replace_mode = ReplaceMode::DestroyBeforeCreate;
        self
    }

    pub fn forces_replacement(&self, field: &str) -> bool {
        self.force_new.contains(field)
    }
}

/// Providers indexed by tag
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        if self.providers.insert(name.clone(), provider).is_some() {
            tracing::warn!("Provider {} registered twice; keeping the last one", name);
        }
    }

    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ProviderNotFound(name.to_string()))
    }

    pub fn schema(&self, name: &str, resource_type: &str) -> Result<ResourceSchema> {
        Ok(self.get(name)?.schema(resource_type))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

/// Retry configuration for provider operations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first call included
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt + 1` (0-based), capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}
