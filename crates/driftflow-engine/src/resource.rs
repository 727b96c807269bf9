//! Resource identities, declarations and attribute values

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Marker key for a reference inside a declaration attribute
pub const REF_KEY: &str = "$ref";
/// Marker key for an attribute that is only known after apply
pub const UNKNOWN_KEY: &str = "$unknown";

/// Concrete attribute values (state snapshots, provider outputs)
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Identity of a resource: type plus logical name, displayed as `type.name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    pub resource_type: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Check that the identity survives a `type.name` round trip and is safe
    /// to use as a path segment
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| -> Result<()> {
            Err(EngineError::InvalidDeclaration(format!(
                "invalid resource address `{}`: {}",
                self, reason
            )))
        };

        if self.resource_type.is_empty() || self.name.is_empty() {
            return invalid("type and name must not be empty");
        }
        if self.resource_type.contains('.') {
            return invalid("type must not contain `.`");
        }
        for part in [&self.resource_type, &self.name] {
            if part.contains(['/', '\\']) || part.chars().any(char::is_control) {
                return invalid("path separators and control characters are not allowed");
            }
        }
        if self.name == "." || self.name == ".." {
            return invalid("name must not be `.` or `..`");
        }
        Ok(())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((resource_type, name)) if !resource_type.is_empty() && !name.is_empty() => {
                let id = Self::new(resource_type, name);
                id.validate()?;
                Ok(id)
            }
            _ => Err(EngineError::InvalidDeclaration(format!(
                "resource address must look like `type.name`, got `{}`",
                s
            ))),
        }
    }
}

impl TryFrom<String> for ResourceId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

/// Value of a desired attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    /// Literal value
    Known(serde_json::Value),
    /// Provisional value, computed by the provider during apply
    Unknown,
    /// Output of another node in the same graph
    Reference { node: ResourceId, output: String },
}

impl AttributeValue {
    /// Lift a declaration value into an attribute value.
    ///
    /// `{"$ref": "type.name", "output": "field"}` becomes a reference and
    /// `{"$unknown": true}` becomes [`AttributeValue::Unknown`]. Markers are
    /// only recognized at the top level of an attribute.
    pub fn from_declared(value: serde_json::Value) -> Result<Self> {
        if let Some(obj) = value.as_object() {
            if let Some(target) = obj.get(REF_KEY) {
                let target = target.as_str().ok_or_else(|| {
                    EngineError::InvalidDeclaration(format!("`{}` must be a string", REF_KEY))
                })?;
                let output = obj.get("output").and_then(|v| v.as_str()).ok_or_else(|| {
                    EngineError::InvalidDeclaration(format!(
                        "reference to `{}` is missing its `output`",
                        target
                    ))
                })?;
                return Ok(Self::Reference {
                    node: target.parse()?,
                    output: output.to_string(),
                });
            }
            if obj.get(UNKNOWN_KEY) == Some(&serde_json::Value::Bool(true)) {
                return Ok(Self::Unknown);
            }
        }
        if contains_marker(&value) {
            return Err(EngineError::InvalidDeclaration(
                "references must be top-level attribute values".to_string(),
            ));
        }
        Ok(Self::Known(value))
    }

    pub fn as_known(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Known(v) => Some(v),
            _ => None,
        }
    }

    pub fn reference(&self) -> Option<(&ResourceId, &str)> {
        match self {
            Self::Reference { node, output } => Some((node, output.as_str())),
            _ => None,
        }
    }
}

fn contains_marker(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => {
            map.contains_key(REF_KEY)
                || map.contains_key(UNKNOWN_KEY)
                || map.values().any(contains_marker)
        }
        serde_json::Value::Array(items) => items.iter().any(contains_marker),
        _ => false,
    }
}

/// A resource as written by the operator, before graph construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    #[serde(rename = "type")]
    pub resource_type: String,

    pub name: String,

    /// Tag selecting the provider that manages the resource
    pub provider: String,

    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,

    /// Ordering-only dependencies that carry no attribute reference
    #[serde(default)]
    pub depends_on: Vec<ResourceId>,
}

impl ResourceDeclaration {
    pub fn new(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            provider: provider.into(),
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.resource_type, &self.name)
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_reference(
        mut self,
        key: impl Into<String>,
        target: &ResourceId,
        output: impl Into<String>,
    ) -> Self {
        self.attributes.insert(
            key.into(),
            serde_json::json!({ REF_KEY: target.to_string(), "output": output.into() }),
        );
        self
    }

    pub fn with_unknown(mut self, key: impl Into<String>) -> Self {
        self.attributes
            .insert(key.into(), serde_json::json!({ UNKNOWN_KEY: true }));
        self
    }

    pub fn depends_on(mut self, target: ResourceId) -> Self {
        self.depends_on.push(target);
        self
    }
}

/// A node of the desired graph for one planning cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceNode {
    pub id: ResourceId,
    pub provider: String,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub dependencies: BTreeSet<ResourceId>,
}

impl ResourceNode {
    /// Build a node from a declaration; edges come from references and `depends_on`
    pub fn from_declaration(decl: ResourceDeclaration) -> Result<Self> {
        let id = decl.id();
        id.validate()?;
        let mut attributes = BTreeMap::new();
        let mut dependencies = BTreeSet::new();

        for (key, raw) in decl.attributes {
            let value = AttributeValue::from_declared(raw)?;
            if let Some((target, _)) = value.reference() {
                dependencies.insert(target.clone());
            }
            attributes.insert(key, value);
        }
        dependencies.extend(decl.depends_on);

        if dependencies.contains(&id) {
            return Err(EngineError::CycleDetected {
                path: vec![id.clone(), id],
            });
        }

        Ok(Self {
            id,
            provider: decl.provider,
            attributes,
            dependencies,
        })
    }

    /// References that point at `target`, as `(attribute, output)` pairs
    pub fn references_to<'a>(
        &'a self,
        target: &'a ResourceId,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + use<'a> {
        self.attributes.iter().filter_map(move |(key, value)| {
            value
                .reference()
                .filter(|(node, _)| *node == target)
                .map(|(_, output)| (key.as_str(), output))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_id_parse_and_display() {
        let id: ResourceId = "storage_account.logs".parse().unwrap();
        assert_eq!(id, ResourceId::new("storage_account", "logs"));
        assert_eq!(id.to_string(), "storage_account.logs");
        assert!("no-dot".parse::<ResourceId>().is_err());
        assert!(".name".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_resource_id_rejects_unsafe_parts() {
        assert!(ResourceId::new("storage_account", "logs.eu").validate().is_ok());
        for (resource_type, name) in [
            ("storage.account", "logs"),
            ("storage_account", ".."),
            ("storage_account", "../escape"),
            ("storage_account", "a\\b"),
            ("", "logs"),
        ] {
            let err = ResourceId::new(resource_type, name).validate().unwrap_err();
            assert!(matches!(err, EngineError::InvalidDeclaration(_)), "{resource_type}.{name}");
        }
        assert!("storage_account.../x".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_declaration_with_dotted_type_is_rejected() {
        let decl = ResourceDeclaration::new("azure.storage", "logs", "local");
        let err = ResourceNode::from_declaration(decl).unwrap_err();
        assert!(matches!(err, EngineError::InvalidDeclaration(_)));
    }

    #[test]
    fn test_resource_id_serializes_as_address() {
        let id = ResourceId::new("application", "ci");
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("application.ci"));
    }

    #[test]
    fn test_declared_markers() {
        let reference =
            AttributeValue::from_declared(json!({"$ref": "application.ci", "output": "client_id"}))
                .unwrap();
        assert_eq!(
            reference,
            AttributeValue::Reference {
                node: ResourceId::new("application", "ci"),
                output: "client_id".to_string(),
            }
        );

        let unknown = AttributeValue::from_declared(json!({"$unknown": true})).unwrap();
        assert_eq!(unknown, AttributeValue::Unknown);

        let known = AttributeValue::from_declared(json!({"tier": "Standard"})).unwrap();
        assert_eq!(known, AttributeValue::Known(json!({"tier": "Standard"})));
    }

    #[test]
    fn test_nested_reference_is_rejected() {
        let err = AttributeValue::from_declared(
            json!({"tags": [{"$ref": "application.ci", "output": "id"}]}),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDeclaration(_)));
    }

    #[test]
    fn test_node_dependencies_from_references() {
        let app = ResourceId::new("application", "ci");
        let decl = ResourceDeclaration::new("federated_credential", "gh", "local")
            .with_reference("application_id", &app, "client_id")
            .with_attribute("subject", json!("repo:org/repo:ref:refs/heads/main"));

        let node = ResourceNode::from_declaration(decl).unwrap();
        assert_eq!(node.dependencies.len(), 1);
        assert!(node.dependencies.contains(&app));
        let refs: Vec<_> = node.references_to(&app).collect();
        assert_eq!(refs, vec![("application_id", "client_id")]);
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let me = ResourceId::new("application", "loop");
        let decl = ResourceDeclaration::new("application", "loop", "local")
            .with_reference("owner", &me, "id");
        let err = ResourceNode::from_declaration(decl).unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected { .. }));
    }
}
