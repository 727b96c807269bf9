//! Change sets and the diff/plan engine

use crate::error::Result;
use crate::graph::ResourceGraph;
use crate::provider::{ProviderRegistry, ReplaceMode, ResourceSchema};
use crate::resource::{AttributeValue, Attributes, ResourceId, ResourceNode};
use crate::state::{StateRecord, StateSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Type of action to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource
    Create,
    /// Update an existing resource in place
    Update,
    /// Delete a resource
    Delete,
    /// Destroy and recreate a resource under the same identity
    Replace,
    /// No changes needed
    NoOp,
}

impl ActionType {
    pub fn is_change(&self) -> bool {
        !matches!(self, ActionType::NoOp)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Update => write!(f, "update"),
            ActionType::Delete => write!(f, "delete"),
            ActionType::Replace => write!(f, "replace"),
            ActionType::NoOp => write!(f, "no-op"),
        }
    }
}

/// Planned action for a single resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeSetEntry {
    pub id: ResourceId,

    pub action: ActionType,

    pub provider: String,

    /// Stored record the action is based on
    pub prior: Option<StateRecord>,

    /// Desired attributes (empty for deletes)
    pub desired: BTreeMap<String, AttributeValue>,

    /// Entries that must complete first, in plan order
    pub dependencies: Vec<ResourceId>,

    /// Fields whose value differs from the stored record
    pub changed: Vec<String>,

    /// Sequencing of a replacement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_mode: Option<ReplaceMode>,

    /// Desired attributes reference values that are only known after an
    /// upstream entry applies; the action is re-evaluated at that point
    pub deferred: bool,
}

impl ChangeSetEntry {
    pub fn prior_version(&self) -> Option<u64> {
        self.prior.as_ref().map(|r| r.version)
    }

    pub fn prior_attributes(&self) -> Attributes {
        self.prior
            .as_ref()
            .map(|r| r.attributes.clone())
            .unwrap_or_default()
    }
}

/// Ordered set of planned actions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Entries in a valid execution order
    pub entries: Vec<ChangeSetEntry>,
}

/// Serialized as `{ "summary": {...}, "entries": [...] }`
impl Serialize for ChangeSet {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("ChangeSet", 2)?;
        state.serialize_field("summary", &self.summary())?;
        state.serialize_field("entries", &self.entries)?;
        state.end()
    }
}

impl ChangeSet {
    pub fn new(entries: Vec<ChangeSetEntry>) -> Self {
        Self { entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether applying the change set would touch anything
    pub fn has_changes(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.action.is_change() || e.deferred)
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ChangeSetEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn position(&self, id: &ResourceId) -> Option<usize> {
        self.entries.iter().position(|e| &e.id == id)
    }

    /// Get entries by action
    pub fn entries_by_action(&self, action: ActionType) -> Vec<&ChangeSetEntry> {
        self.entries.iter().filter(|e| e.action == action).collect()
    }

    /// Summary of the plan
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.entries_by_action(ActionType::Create).len(),
            update: self.entries_by_action(ActionType::Update).len(),
            replace: self.entries_by_action(ActionType::Replace).len(),
            delete: self.entries_by_action(ActionType::Delete).len(),
            no_change: self.entries_by_action(ActionType::NoOp).len(),
        }
    }
}

/// Summary of planned actions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub no_change: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.no_change
        )
    }
}

/// Outcome of comparing desired attributes against a stored record
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Diff {
    pub action: ActionType,
    pub changed: Vec<String>,
    pub replace_mode: Option<ReplaceMode>,
}

/// Resolve desired attributes to concrete values
///
/// `Unknown` values are left out. References are looked up through
/// `lookup`; the ones it cannot answer are returned separately.
pub(crate) fn resolve_attributes<F>(
    desired: &BTreeMap<String, AttributeValue>,
    mut lookup: F,
) -> (Attributes, Vec<(ResourceId, String)>)
where
    F: FnMut(&ResourceId, &str) -> Option<serde_json::Value>,
{
    let mut resolved = Attributes::new();
    let mut pending = Vec::new();

    for (key, value) in desired {
        match value {
            AttributeValue::Known(v) => {
                resolved.insert(key.clone(), v.clone());
            }
            AttributeValue::Unknown => {}
            AttributeValue::Reference { node, output } => match lookup(node, output) {
                Some(v) => {
                    resolved.insert(key.clone(), v);
                }
                None => pending.push((node.clone(), output.clone())),
            },
        }
    }

    (resolved, pending)
}

/// Field-by-field comparison over the resolved desired attributes
///
/// A previously declared attribute that is no longer declared counts as
/// changed; the provider receives it in `changed` without a desired value.
pub(crate) fn diff_record(
    desired: &BTreeMap<String, AttributeValue>,
    resolved: &Attributes,
    provider: &str,
    record: &StateRecord,
    schema: &ResourceSchema,
) -> Diff {
    if record.tainted || record.provider != provider {
        return Diff {
            action: ActionType::Replace,
            changed: Vec::new(),
            replace_mode: Some(schema.replace_mode),
        };
    }

    let mut changed: Vec<String> = resolved
        .iter()
        .filter(|(key, value)| record.attributes.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    changed.extend(
        record
            .declared
            .iter()
            .filter(|key| !desired.contains_key(*key) && record.attributes.contains_key(*key))
            .cloned(),
    );
    changed.sort();

    if changed.is_empty() {
        Diff {
            action: ActionType::NoOp,
            changed,
            replace_mode: None,
        }
    } else if changed.iter().any(|f| schema.forces_replacement(f)) {
        Diff {
            action: ActionType::Replace,
            changed,
            replace_mode: Some(schema.replace_mode),
        }
    } else {
        Diff {
            action: ActionType::Update,
            changed,
            replace_mode: None,
        }
    }
}

/// Diff/plan engine
///
/// Planning is a pure function of the desired graph, the state snapshot and
/// provider schemas, so it can be repeated freely (e.g. for a dry run).
pub struct Planner<'a> {
    registry: &'a ProviderRegistry,
}

impl<'a> Planner<'a> {
    pub fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Compute the ordered change set converging `snapshot` to `graph`
    pub fn plan(&self, graph: &ResourceGraph, snapshot: &StateSnapshot) -> Result<ChangeSet> {
        let mut entries: HashMap<ResourceId, ChangeSetEntry> = HashMap::new();

        for id in graph.topological_order() {
            let Some(node) = graph.get(&id) else {
                continue;
            };
            let entry = self.plan_node(node, snapshot, &entries)?;
            tracing::debug!("Planned {} for {}", entry.action, entry.id);
            entries.insert(id, entry);
        }

        for record in snapshot.iter() {
            if graph.contains(&record.id) {
                continue;
            }
            let dependencies = snapshot
                .iter()
                .filter(|other| other.id != record.id && other.dependencies.contains(&record.id))
                .map(|other| other.id.clone())
                .collect();
            entries.insert(
                record.id.clone(),
                ChangeSetEntry {
                    id: record.id.clone(),
                    action: ActionType::Delete,
                    provider: record.provider.clone(),
                    prior: Some(record.clone()),
                    desired: BTreeMap::new(),
                    dependencies,
                    changed: Vec::new(),
                    replace_mode: None,
                    deferred: false,
                },
            );
        }

        let change_set = order_entries(entries);
        tracing::info!("Plan: {}", change_set.summary());
        Ok(change_set)
    }

    /// Change set deleting every recorded resource
    pub fn plan_destroy(&self, snapshot: &StateSnapshot) -> Result<ChangeSet> {
        self.plan(&ResourceGraph::default(), snapshot)
    }

    fn plan_node(
        &self,
        node: &ResourceNode,
        snapshot: &StateSnapshot,
        planned: &HashMap<ResourceId, ChangeSetEntry>,
    ) -> Result<ChangeSetEntry> {
        let schema = self.registry.schema(&node.provider, &node.id.resource_type)?;

        // Only settled upstream records have trustworthy outputs at plan time
        let (resolved, pending) = resolve_attributes(&node.attributes, |target, output| {
            let settled = planned
                .get(target)
                .is_some_and(|e| e.action == ActionType::NoOp && !e.deferred);
            if !settled {
                return None;
            }
            snapshot
                .get(target)
                .and_then(|r| r.attributes.get(output).cloned())
        });
        let deferred = !pending.is_empty();

        let prior = snapshot.get(&node.id).cloned();
        let diff = match &prior {
            None => Diff {
                action: ActionType::Create,
                changed: resolved.keys().cloned().collect(),
                replace_mode: None,
            },
            Some(record) => {
                diff_record(&node.attributes, &resolved, &node.provider, record, &schema)
            }
        };

        Ok(ChangeSetEntry {
            id: node.id.clone(),
            action: diff.action,
            provider: node.provider.clone(),
            prior,
            desired: node.attributes.clone(),
            dependencies: node.dependencies.iter().cloned().collect(),
            changed: diff.changed,
            replace_mode: diff.replace_mode,
            deferred,
        })
    }
}

/// Topologically order entries: among ready entries non-deletes come before
/// deletes, then ascending identity
fn order_entries(mut entries: HashMap<ResourceId, ChangeSetEntry>) -> ChangeSet {
    let ids: BTreeSet<ResourceId> = entries.keys().cloned().collect();
    let mut remaining: HashMap<ResourceId, usize> = HashMap::new();
    let mut dependents: HashMap<ResourceId, Vec<ResourceId>> = HashMap::new();

    for entry in entries.values_mut() {
        let own = entry.id.clone();
        // Edges to resources absent from the plan are already satisfied
        entry.dependencies.retain(|d| d != &own && ids.contains(d));
        entry.dependencies.sort();
        entry.dependencies.dedup();
        for dep in &entry.dependencies {
            dependents.entry(dep.clone()).or_default().push(own.clone());
        }
        remaining.insert(own, entry.dependencies.len());
    }

    let key = |e: &ChangeSetEntry| (e.action == ActionType::Delete, e.id.clone());
    let mut ready: BTreeSet<(bool, ResourceId)> = entries
        .values()
        .filter(|e| remaining[&e.id] == 0)
        .map(key)
        .collect();
    let mut order: Vec<ResourceId> = Vec::with_capacity(entries.len());

    while order.len() < entries.len() {
        let next = match ready.pop_first() {
            Some((_, id)) => id,
            None => {
                // Recorded dependencies of deleted resources can be stale and
                // form a loop; break it deterministically
                let stuck = entries
                    .values()
                    .filter(|e| remaining[&e.id] > 0)
                    .map(key)
                    .min()
                    .map(|(_, id)| id);
                let Some(stuck) = stuck else { break };
                tracing::warn!("Breaking dependency loop at {}", stuck);
                let placed: BTreeSet<&ResourceId> = order.iter().collect();
                if let Some(entry) = entries.get_mut(&stuck) {
                    entry.dependencies.retain(|d| placed.contains(d));
                }
                remaining.insert(stuck.clone(), 0);
                stuck
            }
        };

        for dependent in dependents.get(&next).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(dependent)
                && *count > 0
            {
                *count -= 1;
                if *count == 0 {
                    ready.insert(key(&entries[dependent]));
                }
            }
        }
        order.push(next);
    }

    let position: HashMap<&ResourceId, usize> =
        order.iter().enumerate().map(|(i, id)| (id, i)).collect();
    let mut sorted: Vec<ChangeSetEntry> = order
        .iter()
        .filter_map(|id| entries.remove(id))
        .collect();
    for entry in &mut sorted {
        entry
            .dependencies
            .sort_by_key(|d| position.get(d).copied().unwrap_or(usize::MAX));
    }

    ChangeSet::new(sorted)
}
