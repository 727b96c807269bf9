//! Test doubles shared by unit tests

use crate::error::RemoteError;
use crate::provider::{Provider, ProviderRegistry, RemoteResult, ResourceSchema};
use crate::resource::{Attributes, ResourceId};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Provider that echoes attributes back and can be scripted to fail
#[derive(Default)]
pub struct MockProvider {
    failures: Mutex<VecDeque<RemoteError>>,
    calls: Mutex<Vec<String>>,
}

impl MockProvider {
    /// Fail the next provider call, whatever the operation
    pub fn fail_next(&self, error: RemoteError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> RemoteResult<()> {
        self.calls.lock().unwrap().push(call);
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
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

    async fn create(&self, id: &ResourceId, _attributes: &Attributes) -> RemoteResult<Attributes> {
        self.record(format!("create {}", id))?;
        Ok(Attributes::from([(
            "id".to_string(),
            serde_json::json!(format!("/mock/{}", id)),
        )]))
    }

    async fn read(&self, id: &ResourceId, current: &Attributes) -> RemoteResult<Option<Attributes>> {
        self.record(format!("read {}", id))?;
        Ok(Some(current.clone()))
    }

    async fn update(
        &self,
        id: &ResourceId,
        _prior: &Attributes,
        _desired: &Attributes,
        _changed: &[String],
    ) -> RemoteResult<Attributes> {
        self.record(format!("update {}", id))?;
        Ok(Attributes::new())
    }

    async fn delete(&self, id: &ResourceId, _prior: &Attributes) -> RemoteResult<()> {
        self.record(format!("delete {}", id))
    }
}

pub fn registry() -> ProviderRegistry {
    mock_registry().1
}

/// Registry plus a handle on its mock for scripting and inspection
pub fn mock_registry() -> (Arc<MockProvider>, ProviderRegistry) {
    let mock = Arc::new(MockProvider::default());
    let registry = ProviderRegistry::new().with(mock.clone());
    (mock, registry)
}
