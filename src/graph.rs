//! Dependencies between namespaces.
//!
//! An edge `dependent → dependee` says the dependent namespace (typically a
//! generic parameter group) belongs to the dependee (its session). Dependents
//! are accepted before their dependees so that a pre-execution hook on the
//! dependee sees the dependent's freshly executed values.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::{IndexMap, IndexSet};

use crate::error::FlowError;

#[derive(Debug, Clone, Default)]
pub struct NamespaceGraph {
    edges: IndexMap<String, IndexSet<String>>,
}

impl NamespaceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the dependees of `namespace`.
    pub fn set_dependencies(&mut self, namespace: &str, depends_on: &[String]) {
        let dependees: IndexSet<String> = depends_on
            .iter()
            .filter(|d| d.as_str() != namespace)
            .cloned()
            .collect();
        if dependees.is_empty() {
            self.edges.shift_remove(namespace);
        } else {
            self.edges.insert(namespace.to_string(), dependees);
        }
    }

    /// Drop `namespace` and every edge pointing at it.
    pub fn remove(&mut self, namespace: &str) {
        self.edges.shift_remove(namespace);
        for dependees in self.edges.values_mut() {
            dependees.shift_remove(namespace);
        }
        self.edges.retain(|_, dependees| !dependees.is_empty());
    }

    pub fn dependencies(&self, namespace: &str) -> Vec<String> {
        self.edges
            .get(namespace)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dependents(&self, namespace: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(_, dependees)| dependees.contains(namespace))
            .map(|(dependent, _)| dependent.clone())
            .collect()
    }

    /// Every namespace that appears on either end of an edge.
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: IndexSet<String> = IndexSet::new();
        for (dependent, dependees) in &self.edges {
            nodes.insert(dependent.clone());
            nodes.extend(dependees.iter().cloned());
        }
        nodes.into_iter().collect()
    }

    pub fn check_acyclic(&self) -> Result<(), FlowError> {
        let nodes: Vec<(String, i32)> = self.nodes().into_iter().map(|n| (n, 0)).collect();
        self.acceptance_order(&nodes).map(|_| ())
    }

    /// Order `namespaces` so every dependent precedes its dependees. Ties are
    /// broken by `priority` (lower first), then by name. Edges to namespaces
    /// outside the set are ignored.
    pub fn acceptance_order(
        &self,
        namespaces: &[(String, i32)],
    ) -> Result<Vec<String>, FlowError> {
        let priority: BTreeMap<&str, i32> =
            namespaces.iter().map(|(n, p)| (n.as_str(), *p)).collect();

        // Count, for each namespace, the dependents still waiting to go first.
        let mut waiting: BTreeMap<&str, usize> = priority.keys().map(|n| (*n, 0)).collect();
        for (dependent, dependees) in &self.edges {
            if !priority.contains_key(dependent.as_str()) {
                continue;
            }
            for dependee in dependees {
                if let Some(count) = waiting.get_mut(dependee.as_str()) {
                    *count += 1;
                }
            }
        }

        let mut ready: BTreeSet<(i32, &str)> = waiting
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(n, _)| (priority.get(n).copied().unwrap_or_default(), *n))
            .collect();
        let mut order = Vec::with_capacity(priority.len());
        while let Some(next) = ready.pop_first() {
            let (_, namespace) = next;
            order.push(namespace.to_string());
            let Some(dependees) = self.edges.get(namespace) else {
                continue;
            };
            for dependee in dependees {
                if let Some(count) = waiting.get_mut(dependee.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        let p = priority.get(dependee.as_str()).copied().unwrap_or_default();
                        ready.insert((p, dependee.as_str()));
                    }
                }
            }
        }

        if order.len() < priority.len() {
            let namespaces = waiting
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(n, _)| n.to_string())
                .collect();
            return Err(FlowError::DependencyCycle { namespaces });
        }
        Ok(order)
    }
}
