//! Signing order for the binaries of a bundle
//!
//! A binary must be signed after everything it loads, and a nested bundle's
//! executable after every binary inside that bundle (its resource seal hashes
//! them). The main executable is not part of the graph; it always goes last.

use super::{join, AppBundle, BundleDir};
use crate::macho::parser::BinaryContainer;
use crate::{Error, Result};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// Directed graph of "must be signed before" edges between bundle members.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: BTreeMap<String, usize>,
    /// For each node, the nodes that must be signed first.
    deps: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    pub fn new(paths: impl IntoIterator<Item = String>) -> Self {
        let mut graph = Self::default();
        for path in paths {
            if graph.index.contains_key(&path) {
                continue;
            }
            graph.index.insert(path.clone(), graph.nodes.len());
            graph.nodes.push(path);
            graph.deps.push(BTreeSet::new());
        }
        graph
    }

    /// Order every Mach-O member of `bundle` except `main_executable`.
    ///
    /// Load commands that do not resolve to a member (system libraries,
    /// missing files) add no edge.
    pub fn build(
        bundle: &AppBundle,
        bundles: &[BundleDir],
        binaries: &BTreeMap<String, BinaryContainer>,
        main_executable: &str,
    ) -> Self {
        let mut graph = Self::new(
            binaries
                .keys()
                .filter(|p| p.as_str() != main_executable)
                .cloned(),
        );

        for (loader, container) in binaries {
            if loader == main_executable {
                continue;
            }
            for slice in container.slices() {
                let rpaths: Vec<&str> = slice.rpaths().collect();
                for dylib in slice.dependencies() {
                    let target = resolve_install_name(
                        &dylib.name,
                        loader,
                        main_executable,
                        &rpaths,
                        bundle.name(),
                        |p| graph.index.contains_key(p),
                    );
                    if let Some(target) = target {
                        graph.add_dependency(loader, &target);
                    }
                }
            }
        }

        for dir in bundles.iter().filter(|b| !b.is_main()) {
            let executable = dir.executable_path();
            if !graph.index.contains_key(&executable) {
                continue;
            }
            let inner: Vec<String> = graph
                .nodes
                .iter()
                .filter(|n| **n != executable && dir.contains(n))
                .cloned()
                .collect();
            for path in inner {
                graph.add_dependency(&executable, &path);
            }
        }

        graph
    }

    /// Record that `before` must be signed before `path`.
    ///
    /// Returns false when either node is unknown or both are the same.
    pub fn add_dependency(&mut self, path: &str, before: &str) -> bool {
        match (self.index.get(path), self.index.get(before)) {
            (Some(&from), Some(&to)) if from != to => {
                self.deps[from].insert(to);
                true
            }
            _ => false,
        }
    }

    pub fn dependencies_of(&self, path: &str) -> Vec<&str> {
        self.index
            .get(path)
            .map(|&i| self.deps[i].iter().map(|&d| self.nodes[d].as_str()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Group the nodes into levels with Kahn's algorithm.
    ///
    /// Every node's dependencies sit in earlier levels, so the members of
    /// one level can be signed concurrently.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let count = self.nodes.len();
        let mut pending: Vec<usize> = self.deps.iter().map(BTreeSet::len).collect();
        let mut dependents = vec![Vec::new(); count];
        for (node, deps) in self.deps.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(node);
            }
        }

        let mut ready: Vec<usize> = (0..count).filter(|&i| pending[i] == 0).collect();
        let mut levels = Vec::new();
        let mut placed = 0;
        while !ready.is_empty() {
            let mut next = Vec::new();
            for &node in &ready {
                for &dependent in &dependents[node] {
                    pending[dependent] -= 1;
                    if pending[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            placed += ready.len();
            levels.push(ready.iter().map(|&i| self.nodes[i].clone()).collect());
            next.sort_unstable();
            ready = next;
        }

        if placed < count {
            let cycle = (0..count)
                .filter(|&i| pending[i] > 0)
                .map(|i| self.nodes[i].clone())
                .collect();
            return Err(Error::DependencyCycle(cycle));
        }
        debug!("{count} dependencies in {} levels", levels.len());
        Ok(levels)
    }
}

/// Map a load-command install name to a bundle member path.
///
/// Handles `@executable_path/`, `@loader_path/`, `@rpath/` (tried against
/// each rpath in order) and absolute paths that pass through the bundle
/// directory. Only paths accepted by `exists` are returned.
pub fn resolve_install_name(
    name: &str,
    loader: &str,
    main_executable: &str,
    rpaths: &[&str],
    bundle_name: &str,
    exists: impl Fn(&str) -> bool,
) -> Option<String> {
    if let Some(rest) = name.strip_prefix("@rpath/") {
        return rpaths
            .iter()
            .filter_map(|rpath| expand(rpath, loader, main_executable, bundle_name))
            .filter_map(|dir| normalize(&join(&dir, rest)))
            .find(|p| exists(p));
    }
    expand(name, loader, main_executable, bundle_name).filter(|p| exists(p))
}

fn expand(path: &str, loader: &str, main_executable: &str, bundle_name: &str) -> Option<String> {
    let (base, rest) = if let Some(rest) = path.strip_prefix("@executable_path") {
        (parent(main_executable), rest)
    } else if let Some(rest) = path.strip_prefix("@loader_path") {
        (parent(loader), rest)
    } else if path.starts_with('/') {
        let marker = format!("/{bundle_name}/");
        let padded = format!("{path}/");
        let at = padded.find(&marker)?;
        return normalize(&padded[at + marker.len()..]);
    } else {
        return None;
    };
    normalize(&join(base, rest.trim_start_matches('/')))
}

fn parent(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

/// Collapse `.` and `..`; `None` when the path climbs out of the bundle.
fn normalize(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}
