//! Service dependency graph

use crate::error::{Result, TandemError};
use std::collections::{HashMap, HashSet};

/// Directed graph from each service to the services it depends on
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Nodes in insertion (manifest) order
    nodes: Vec<String>,
    /// Outgoing edges: service → dependencies
    edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service node
    pub fn add_service(&mut self, name: &str) {
        if !self.edges.contains_key(name) {
            self.nodes.push(name.to_string());
            self.edges.insert(name.to_string(), Vec::new());
        }
    }

    /// Add an edge meaning `service` depends on `dependency`.
    /// Both ends must already be nodes.
    pub fn add_dependency(&mut self, service: &str, dependency: &str) -> Result<()> {
        if !self.edges.contains_key(dependency) {
            return Err(TandemError::MissingDependency {
                service: service.to_string(),
                dependency: dependency.to_string(),
            });
        }
        let deps = self
            .edges
            .get_mut(service)
            .ok_or_else(|| TandemError::ServiceNotFound(service.to_string()))?;
        if !deps.iter().any(|d| d == dependency) {
            deps.push(dependency.to_string());
        }
        Ok(())
    }

    /// Direct dependencies of a service
    pub fn dependencies(&self, service: &str) -> &[String] {
        self.edges.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Start order: every service appears after all of its dependencies.
    /// Independent services keep manifest order. A cycle is reported with
    /// its full path, first member repeated at the end.
    pub fn start_order(&self) -> Result<Vec<String>> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visited = HashSet::new();
        let mut path = Vec::new();

        for service in &self.nodes {
            self.visit(service, &mut visited, &mut path, &mut order)?;
        }

        Ok(order)
    }

    /// Depth-first topological sort
    fn visit(
        &self,
        service: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if visited.contains(service) {
            return Ok(());
        }

        if let Some(pos) = path.iter().position(|s| s == service) {
            let mut cycle: Vec<String> = path[pos..].to_vec();
            cycle.push(service.to_string());
            return Err(TandemError::DependencyCycle { cycle });
        }

        path.push(service.to_string());
        for dep in self.dependencies(service) {
            self.visit(dep, visited, path, order)?;
        }
        path.pop();

        visited.insert(service.to_string());
        order.push(service.to_string());

        Ok(())
    }
}
