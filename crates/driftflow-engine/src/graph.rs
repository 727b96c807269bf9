//! Desired-state dependency graph

use crate::error::{EngineError, Result};
use crate::resource::{ResourceDeclaration, ResourceId, ResourceNode};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Acyclic graph of desired resources
///
/// Edges point from a node to the nodes it depends on. Construction fails on
/// duplicate identities, dangling references and cycles, so every value of
/// this type is a valid DAG.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<ResourceId, ResourceNode>,
    dependents: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl ResourceGraph {
    /// Build the graph from declarations in operator order
    pub fn build(declarations: impl IntoIterator<Item = ResourceDeclaration>) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for decl in declarations {
            let node = ResourceNode::from_declaration(decl)?;
            if nodes.contains_key(&node.id) {
                return Err(EngineError::DuplicateIdentity(node.id));
            }
            nodes.insert(node.id.clone(), node);
        }

        let mut dependents: BTreeMap<ResourceId, BTreeSet<ResourceId>> = BTreeMap::new();
        for node in nodes.values() {
            for dep in &node.dependencies {
                if !nodes.contains_key(dep) {
                    return Err(EngineError::DanglingReference {
                        from: node.id.clone(),
                        to: dep.clone(),
                    });
                }
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(node.id.clone());
            }
        }

        let graph = Self { nodes, dependents };
        graph.check_acyclic()?;

        tracing::debug!("Built resource graph with {} nodes", graph.nodes.len());
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut marks: BTreeMap<&ResourceId, Mark> = BTreeMap::new();
        let mut stack: Vec<&ResourceId> = Vec::new();

        for id in self.nodes.keys() {
            if !marks.contains_key(id) {
                self.visit(id, &mut marks, &mut stack)?;
            }
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        id: &'a ResourceId,
        marks: &mut BTreeMap<&'a ResourceId, Mark>,
        stack: &mut Vec<&'a ResourceId>,
    ) -> Result<()> {
        marks.insert(id, Mark::Visiting);
        stack.push(id);

        for dep in &self.nodes[id].dependencies {
            match marks.get(dep) {
                Some(Mark::Done) => {}
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut path: Vec<ResourceId> =
                        stack[start..].iter().map(|n| (*n).clone()).collect();
                    path.push(dep.clone());
                    return Err(EngineError::CycleDetected { path });
                }
                None => self.visit(dep, marks, stack)?,
            }
        }

        stack.pop();
        marks.insert(id, Mark::Done);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes in ascending identity order
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    pub fn dependencies(&self, id: &ResourceId) -> Option<&BTreeSet<ResourceId>> {
        self.nodes.get(id).map(|n| &n.dependencies)
    }

    /// Nodes that reference `id` directly
    pub fn dependents<'a>(
        &'a self,
        id: &ResourceId,
    ) -> impl Iterator<Item = &'a ResourceId> + use<'a> {
        self.dependents.get(id).into_iter().flatten()
    }

    /// Nodes that depend on `id` directly or transitively
    pub fn transitive_dependents(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&ResourceId> = self.dependents(id).collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents(next));
            }
        }
        seen
    }

    /// A topological order, dependencies first, ties broken by identity
    pub fn topological_order(&self) -> Vec<ResourceId> {
        let mut remaining: BTreeMap<&ResourceId, usize> = self
            .nodes
            .values()
            .map(|n| (&n.id, n.dependencies.len()))
            .collect();
        let mut ready: BTreeSet<&ResourceId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_first() {
            order.push(id.clone());
            for dependent in self.dependents(id) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
        order
    }
}
