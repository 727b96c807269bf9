//! Local provider implementation

use crate::error::{LocalProviderError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use driftflow_engine::{
    Attributes, Provider, RemoteResult, ResourceId, ResourceSchema,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;

pub const PROVIDER_NAME: &str = "local";

const ID_PREFIX: &str = "/local/";

/// Resource types this provider understands
const STORAGE_ACCOUNT: &str = "storage_account";
const APPLICATION: &str = "application";
const FEDERATED_CREDENTIAL: &str = "federated_credential";
const ROLE_ASSIGNMENT: &str = "role_assignment";

/// An object as persisted under the provider root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalObject {
    pub id: String,
    pub resource: ResourceId,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Provider that keeps every object as a JSON file below `root`
///
/// Object ids look like `/local/<type>/<name>/<serial>`, so a replacement
/// object can coexist with the one it replaces.
pub struct LocalProvider {
    root: PathBuf,
    serial: AtomicU64,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            serial: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn next_object_id(&self, id: &ResourceId) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        let serial = self.serial.fetch_add(1, Ordering::SeqCst);
        format!(
            "{}{}/{}/{:x}{:04x}",
            ID_PREFIX, id.resource_type, id.name, nanos, serial
        )
    }

    fn object_path(&self, object_id: &str) -> Result<PathBuf> {
        let relative = object_id
            .strip_prefix(ID_PREFIX)
            .filter(|r| !r.split('/').any(|part| part.is_empty() || part == ".."))
            .ok_or_else(|| LocalProviderError::ObjectNotFound(object_id.to_string()))?;
        Ok(self.root.join(format!("{}.json", relative)))
    }

    fn object_id(id: &ResourceId, attributes: &Attributes) -> Result<String> {
        attributes
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| LocalProviderError::MissingObjectId(id.clone()))
    }

    async fn load(&self, object_id: &str) -> Result<Option<LocalObject>> {
        let path = self.object_path(object_id)?;
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, object: &LocalObject) -> Result<()> {
        let path = self.object_path(&object.id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(object)?;
        fs::write(&path, content).await?;
        Ok(())
    }

    /// Directory holding the objects of `id`; the address must not escape `root`
    fn resource_dir(&self, id: &ResourceId) -> Result<PathBuf> {
        id.validate()
            .map_err(|e| LocalProviderError::InvalidAddress(e.to_string()))?;
        Ok(self.root.join(&id.resource_type).join(&id.name))
    }

    /// Every stored object of one resource
    async fn objects_of(&self, id: &ResourceId) -> Result<Vec<LocalObject>> {
        let dir = self.resource_dir(id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let content = fs::read_to_string(entry.path()).await?;
            objects.push(serde_json::from_str(&content)?);
        }
        Ok(objects)
    }

    /// Objects of one resource type, across all names
    async fn objects_of_type(&self, resource_type: &str) -> Result<Vec<LocalObject>> {
        let dir = self.root.join(resource_type);
        let mut names = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut objects = Vec::new();
        while let Some(entry) = names.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                let id = ResourceId::new(resource_type, name);
                objects.extend(self.objects_of(&id).await?);
            }
        }
        Ok(objects)
    }

    fn validate(id: &ResourceId, attributes: &Attributes) -> Result<()> {
        id.validate()
            .map_err(|e| LocalProviderError::InvalidAddress(e.to_string()))?;
        let required: &[&'static str] = match id.resource_type.as_str() {
            STORAGE_ACCOUNT => &["location"],
            APPLICATION => &[],
            FEDERATED_CREDENTIAL => &["application_id", "issuer", "subject"],
            ROLE_ASSIGNMENT => &["principal_id", "role", "scope"],
            other => return Err(LocalProviderError::UnsupportedType(other.to_string())),
        };

        for attribute in required {
            if !attributes.contains_key(*attribute) {
                return Err(LocalProviderError::MissingAttribute {
                    resource_type: id.resource_type.clone(),
                    attribute,
                });
            }
        }
        Ok(())
    }

    /// Computed attributes returned to the engine
    fn outputs(id: &ResourceId, object_id: &str) -> Attributes {
        let mut outputs = Attributes::new();
        outputs.insert("id".to_string(), json!(object_id));
        match id.resource_type.as_str() {
            STORAGE_ACCOUNT => {
                outputs.insert(
                    "primary_blob_endpoint".to_string(),
                    json!(format!("https://{}.blob.local/", id.name)),
                );
            }
            APPLICATION => {
                let suffix = object_id.rsplit('/').next().unwrap_or_default();
                outputs.insert(
                    "client_id".to_string(),
                    json!(format!("{}-{}", id.name, suffix)),
                );
            }
            _ => {}
        }
        outputs
    }

    /// A trust relationship may only exist once per application, issuer and subject
    async fn check_credential_unique(&self, id: &ResourceId, attributes: &Attributes) -> Result<()> {
        let key = |attrs: &Attributes| {
            (
                attrs.get("application_id").cloned(),
                attrs.get("issuer").cloned(),
                attrs.get("subject").cloned(),
            )
        };
        let wanted = key(attributes);
        for existing in self.objects_of_type(FEDERATED_CREDENTIAL).await? {
            if key(&existing.attributes) == wanted {
                return Err(LocalProviderError::Conflict(format!(
                    "federated credential {} already trusts this issuer and subject for {}",
                    existing.resource, id
                )));
            }
        }
        Ok(())
    }

    async fn create_object(&self, id: &ResourceId, attributes: &Attributes) -> Result<Attributes> {
        Self::validate(id, attributes)?;
        if id.resource_type == FEDERATED_CREDENTIAL {
            self.check_credential_unique(id, attributes).await?;
        }

        let object_id = self.next_object_id(id);
        let outputs = Self::outputs(id, &object_id);
        let mut stored = attributes.clone();
        stored.extend(outputs.clone());

        let now = Utc::now();
        self.store(&LocalObject {
            id: object_id.clone(),
            resource: id.clone(),
            attributes: stored,
            created_at: now,
            updated_at: now,
        })
        .await?;

        tracing::info!("Created {} as {}", id, object_id);
        Ok(outputs)
    }

    async fn update_object(
        &self,
        id: &ResourceId,
        prior: &Attributes,
        desired: &Attributes,
        changed: &[String],
    ) -> Result<Attributes> {
        let object_id = Self::object_id(id, prior)?;
        let mut object = self
            .load(&object_id)
            .await?
            .ok_or_else(|| LocalProviderError::ObjectNotFound(object_id.clone()))?;

        for field in changed {
            match desired.get(field) {
                Some(value) => object.attributes.insert(field.clone(), value.clone()),
                None => object.attributes.remove(field),
            };
        }
        Self::validate(id, &object.attributes)?;
        object.updated_at = Utc::now();
        self.store(&object).await?;

        tracing::info!("Updated {} ({})", id, changed.join(", "));
        Ok(Self::outputs(id, &object_id))
    }

    async fn delete_object(&self, id: &ResourceId, prior: &Attributes) -> Result<()> {
        let object_id = match Self::object_id(id, prior) {
            Ok(object_id) => object_id,
            // Nothing was ever created remotely
            Err(LocalProviderError::MissingObjectId(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match fs::remove_file(self.object_path(&object_id)?).await {
            Ok(()) => {
                tracing::info!("Deleted {} ({})", id, object_id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_object(&self, id: &ResourceId, current: &Attributes) -> Result<Option<Attributes>> {
        let object_id = match Self::object_id(id, current) {
            Ok(object_id) => object_id,
            Err(LocalProviderError::MissingObjectId(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(self.load(&object_id).await?.map(|o| o.attributes))
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn schema(&self, resource_type: &str) -> ResourceSchema {
        match resource_type {
            STORAGE_ACCOUNT => ResourceSchema::new().force_new(["location", "account_kind"]),
            FEDERATED_CREDENTIAL => ResourceSchema::new()
                .force_new(["application_id", "issuer", "subject"])
                .destroy_before_create(),
            ROLE_ASSIGNMENT => ResourceSchema::new().force_new(["principal_id", "role", "scope"]),
            _ => ResourceSchema::new(),
        }
    }

    async fn create(&self, id: &ResourceId, attributes: &Attributes) -> RemoteResult<Attributes> {
        Ok(self.create_object(id, attributes).await?)
    }

    async fn read(&self, id: &ResourceId, current: &Attributes) -> RemoteResult<Option<Attributes>> {
        Ok(self.read_object(id, current).await?)
    }

    async fn update(
        &self,
        id: &ResourceId,
        prior: &Attributes,
        desired: &Attributes,
        changed: &[String],
    ) -> RemoteResult<Attributes> {
        Ok(self.update_object(id, prior, desired, changed).await?)
    }

    async fn delete(&self, id: &ResourceId, prior: &Attributes) -> RemoteResult<()> {
        Ok(self.delete_object(id, prior).await?)
    }
}
