use async_trait::async_trait;
use driftflow_engine::{
    Attributes, Engine, EngineOptions, ExecutorOptions, Provider, ProviderRegistry, RemoteError,
    RemoteResult, ResourceDeclaration, ResourceId, ResourceSchema, RetryConfig, StateStore,
};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const PROVIDER: &str = "scripted";

/// Provider with an in-memory "cloud" and per-call failure injection
#[derive(Default)]
pub struct ScriptedProvider {
    live: Mutex<HashMap<ResourceId, Attributes>>,
    failures: Mutex<HashMap<(String, ResourceId), VecDeque<RemoteError>>>,
    delays: Mutex<HashMap<ResourceId, Duration>>,
    log: Mutex<Vec<String>>,
    serial: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `op` call on `id` with `error`
    pub fn fail(&self, op: &str, id: &ResourceId, error: RemoteError) {
        self.failures
            .lock()
            .unwrap()
            .entry((op.to_string(), id.clone()))
            .or_default()
            .push_back(error);
    }

    pub fn delay(&self, id: &ResourceId, delay: Duration) {
        self.delays.lock().unwrap().insert(id.clone(), delay);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Position of `entry` in the call log
    pub fn position(&self, entry: &str) -> usize {
        self.log()
            .iter()
            .position(|l| l == entry)
            .unwrap_or_else(|| panic!("{} not called; log: {:?}", entry, self.log()))
    }

    pub fn calls(&self, entry: &str) -> usize {
        self.log().iter().filter(|l| *l == entry).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn live(&self, id: &ResourceId) -> Option<Attributes> {
        self.live.lock().unwrap().get(id).cloned()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Change a live object behind the engine's back
    pub fn set_live(&self, id: &ResourceId, key: &str, value: serde_json::Value) {
        if let Some(attrs) = self.live.lock().unwrap().get_mut(id) {
            attrs.insert(key.to_string(), value);
        }
    }

    pub fn remove_live(&self, id: &ResourceId) {
        self.live.lock().unwrap().remove(id);
    }

    async fn call(&self, op: &str, id: &ResourceId) -> RemoteResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.lock().unwrap().get(id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("{} {}", op, id));
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&(op.to_string(), id.clone()))
            .and_then(VecDeque::pop_front);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn schema(&self, resource_type: &str) -> ResourceSchema {
        match resource_type {
            "storage_account" => ResourceSchema::new().force_new(["location"]),
            "federated_credential" => ResourceSchema::new()
                .force_new(["application_id", "issuer", "subject"])
                .destroy_before_create(),
            _ => ResourceSchema::new(),
        }
    }

    async fn create(&self, id: &ResourceId, attributes: &Attributes) -> RemoteResult<Attributes> {
        self.call("create", id).await?;
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        let outputs = Attributes::from([("id".to_string(), json!(format!("/{}/{}", id, serial)))]);
        let mut live = attributes.clone();
        live.extend(outputs.clone());
        self.live.lock().unwrap().insert(id.clone(), live);
        Ok(outputs)
    }

    async fn read(&self, id: &ResourceId, _current: &Attributes) -> RemoteResult<Option<Attributes>> {
        self.call("read", id).await?;
        Ok(self.live(id))
    }

    async fn update(
        &self,
        id: &ResourceId,
        _prior: &Attributes,
        desired: &Attributes,
        changed: &[String],
    ) -> RemoteResult<Attributes> {
        self.call("update", id).await?;
        let mut live = self.live.lock().unwrap();
        let attrs = live.entry(id.clone()).or_default();
        for key in changed {
            match desired.get(key) {
                Some(value) => attrs.insert(key.clone(), value.clone()),
                None => attrs.remove(key),
            };
        }
        Ok(Attributes::new())
    }

    async fn delete(&self, id: &ResourceId, prior: &Attributes) -> RemoteResult<()> {
        self.call("delete", id).await?;
        let mut live = self.live.lock().unwrap();
        // A replacement may already own the slot; only drop the matching object
        if live.get(id).and_then(|a| a.get("id")) == prior.get("id") {
            live.remove(id);
        }
        Ok(())
    }
}

/// Project directory with its own state store
pub struct TestProject {
    pub root: TempDir,
    pub provider: Arc<ScriptedProvider>,
}

#[allow(dead_code)]
impl TestProject {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            provider: ScriptedProvider::new(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    pub fn store(&self) -> StateStore {
        StateStore::for_project(self.root.path())
    }

    pub fn engine(&self) -> Engine {
        self.engine_with(fast_options())
    }

    pub fn engine_with(&self, options: EngineOptions) -> Engine {
        let registry = ProviderRegistry::new().with(self.provider.clone());
        Engine::new(self.store(), registry, options)
    }
}

/// Options with millisecond backoff so retries do not slow tests down
pub fn fast_options() -> EngineOptions {
    EngineOptions {
        executor: ExecutorOptions {
            parallelism: 4,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                backoff_multiplier: 2.0,
            },
            call_timeout: Duration::from_secs(5),
        },
        lock_lease: Duration::from_secs(60),
        holder: "test".to_string(),
    }
}

pub fn id(resource_type: &str, name: &str) -> ResourceId {
    ResourceId::new(resource_type, name)
}

/// Storage account S, application A and federated credential F referencing A
pub fn saf() -> Vec<ResourceDeclaration> {
    vec![
        ResourceDeclaration::new("storage_account", "s", PROVIDER)
            .with_attribute("location", json!("westeurope"))
            .with_attribute("account_tier", json!("Standard")),
        ResourceDeclaration::new("application", "a", PROVIDER)
            .with_attribute("display_name", json!("api")),
        ResourceDeclaration::new("federated_credential", "f", PROVIDER)
            .with_reference("application_id", &id("application", "a"), "id")
            .with_attribute("issuer", json!("https://token.actions.githubusercontent.com"))
            .with_attribute("subject", json!("repo:org/api:ref:refs/heads/main")),
    ]
}

/// Replace the attribute `key` of the declaration `name`
pub fn with_attr(
    mut decls: Vec<ResourceDeclaration>,
    name: &str,
    key: &str,
    value: serde_json::Value,
) -> Vec<ResourceDeclaration> {
    for decl in decls.iter_mut().filter(|d| d.name == name) {
        decl.attributes.insert(key.to_string(), value.clone());
    }
    decls
}
