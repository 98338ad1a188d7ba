//! Pack dependency graph
//!
//! Packs refer to their dependencies by index. The graph is validated once
//! at construction (dangling indices and cycles are configuration errors)
//! and fixes a global topological order, dependencies first. Closures are
//! returned in that order so they can be acquired front to back.

use std::collections::HashMap;

/// One pack of the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackIndexEntry {
    pub name: String,
    /// Own uncompressed size, dependencies excluded.
    pub size_uncompressed: u64,
    pub dependencies: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle through pack '{pack}'")]
    Cycle { pack: String },

    #[error("pack '{pack}' depends on unknown pack index {dependency}")]
    UnknownDependency { pack: String, dependency: u32 },

    #[error("unknown pack '{0}'")]
    UnknownPack(String),
}

#[derive(Debug, Clone)]
pub struct PackGraph {
    names: Vec<String>,
    sizes: Vec<u64>,
    deps: Vec<Vec<u32>>,
    /// Position of each pack in the global topological order.
    rank: Vec<usize>,
    by_name: HashMap<String, u32>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    Active,
    Done,
}

impl PackGraph {
    pub fn new(entries: &[PackIndexEntry]) -> Result<Self, GraphError> {
        Self::build(
            entries.iter().map(|e| e.name.clone()).collect(),
            entries.iter().map(|e| e.size_uncompressed).collect(),
            entries.iter().map(|e| e.dependencies.clone()).collect(),
        )
    }

    /// Graph over anonymous packs (named by index, zero sized).
    pub fn from_dependencies(deps: Vec<Vec<u32>>) -> Result<Self, GraphError> {
        let names = (0..deps.len()).map(|i| i.to_string()).collect();
        let sizes = vec![0; deps.len()];
        Self::build(names, sizes, deps)
    }

    fn build(names: Vec<String>, sizes: Vec<u64>, mut deps: Vec<Vec<u32>>) -> Result<Self, GraphError> {
        let count = deps.len();
        for (i, list) in deps.iter_mut().enumerate() {
            list.sort_unstable();
            list.dedup();
            if let Some(&bad) = list.iter().find(|&&d| d as usize >= count) {
                return Err(GraphError::UnknownDependency {
                    pack: names[i].clone(),
                    dependency: bad,
                });
            }
        }

        // Iterative DFS, post-order gives dependencies before dependents
        let mut marks = vec![Mark::New; count];
        let mut order = Vec::with_capacity(count);
        for start in 0..count {
            if marks[start] != Mark::New {
                continue;
            }
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            marks[start] = Mark::Active;
            while let Some(top) = stack.last_mut() {
                let node = top.0;
                if let Some(&dep) = deps[node].get(top.1) {
                    top.1 += 1;
                    let dep = dep as usize;
                    match marks[dep] {
                        Mark::New => {
                            marks[dep] = Mark::Active;
                            stack.push((dep, 0));
                        }
                        Mark::Active => {
                            return Err(GraphError::Cycle {
                                pack: names[dep].clone(),
                            })
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    order.push(node);
                    stack.pop();
                }
            }
        }

        let mut rank = vec![0; count];
        for (position, &pack) in order.iter().enumerate() {
            rank[pack] = position;
        }

        let by_name = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32))
            .collect();

        Ok(Self {
            names,
            sizes,
            deps,
            rank,
            by_name,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, index: u32) -> &str {
        &self.names[index as usize]
    }

    pub fn size(&self, index: u32) -> u64 {
        self.sizes[index as usize]
    }

    pub fn direct_dependencies(&self, index: u32) -> &[u32] {
        &self.deps[index as usize]
    }

    /// Transitive dependencies of a pack (itself excluded), sorted by index.
    pub fn dependencies(&self, index: u32) -> Vec<u32> {
        let mut seen = vec![false; self.len()];
        let mut stack = self.deps[index as usize].clone();
        while let Some(dep) = stack.pop() {
            if !seen[dep as usize] {
                seen[dep as usize] = true;
                stack.extend_from_slice(&self.deps[dep as usize]);
            }
        }
        (0..self.len() as u32).filter(|&i| seen[i as usize]).collect()
    }

    /// Whether `parent` depends on `child`, directly or not.
    pub fn has_dependency(&self, parent: u32, child: u32) -> bool {
        parent != child && self.dependencies(parent).binary_search(&child).is_ok()
    }

    /// Closure of the given packs in acquisition order, each pack once.
    pub fn closure_indices(&self, packs: &[u32]) -> Vec<u32> {
        let mut seen = vec![false; self.len()];
        let mut stack: Vec<u32> = packs.to_vec();
        while let Some(pack) = stack.pop() {
            if !std::mem::replace(&mut seen[pack as usize], true) {
                stack.extend_from_slice(&self.deps[pack as usize]);
            }
        }
        let mut out: Vec<u32> = (0..self.len() as u32).filter(|&i| seen[i as usize]).collect();
        out.sort_by_key(|&i| self.rank[i as usize]);
        out
    }

    /// Closure of the named packs in acquisition order, dependencies first.
    pub fn closure<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<&str>, GraphError> {
        let indices = self.resolve(names)?;
        Ok(self
            .closure_indices(&indices)
            .into_iter()
            .map(|i| self.name(i))
            .collect())
    }

    /// Sum of sizes over the closure, shared dependencies counted once.
    pub fn total_size<S: AsRef<str>>(&self, names: &[S]) -> Result<u64, GraphError> {
        let indices = self.resolve(names)?;
        Ok(self
            .closure_indices(&indices)
            .into_iter()
            .map(|i| self.size(i))
            .sum())
    }

    fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<u32>, GraphError> {
        names
            .iter()
            .map(|n| {
                self.index_of(n.as_ref())
                    .ok_or_else(|| GraphError::UnknownPack(n.as_ref().to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, size: u64, deps: &[u32]) -> PackIndexEntry {
        PackIndexEntry {
            name: name.to_string(),
            size_uncompressed: size,
            dependencies: deps.to_vec(),
        }
    }

    /// 3 -> 2 -> 1 -> 0, plus a diamond: top -> {left, right} -> 0
    fn catalog() -> PackGraph {
        PackGraph::new(&[
            entry("0", 100, &[]),
            entry("1", 10, &[0]),
            entry("2", 20, &[1]),
            entry("3", 30, &[2]),
            entry("left", 5, &[0]),
            entry("right", 7, &[0]),
            entry("top", 1, &[4, 5]),
            entry("lonely", 1000, &[]),
        ])
        .unwrap()
    }

    #[test]
    fn test_chain_closure_is_dependencies_first() {
        let graph = catalog();
        assert_eq!(graph.closure(&["3"]).unwrap(), vec!["0", "1", "2", "3"]);
        assert_eq!(graph.total_size(&["3"]).unwrap(), 160);
    }

    #[test]
    fn test_shared_dependencies_counted_once() {
        let graph = catalog();
        let closure = graph.closure(&["top"]).unwrap();
        assert_eq!(closure.len(), 4);
        assert_eq!(closure[0], "0");
        assert_eq!(*closure.last().unwrap(), "top");
        assert_eq!(graph.total_size(&["top"]).unwrap(), 113);

        // 3 and top share pack 0
        let combined = graph.total_size(&["3", "top"]).unwrap();
        let naive = graph.total_size(&["3"]).unwrap() + graph.total_size(&["top"]).unwrap();
        assert_eq!(combined, 173);
        assert!(combined < naive);
    }

    #[test]
    fn test_transitive_dependencies() {
        let graph = catalog();
        assert_eq!(graph.dependencies(3), vec![0, 1, 2]);
        assert!(graph.dependencies(0).is_empty());
        assert!(graph.has_dependency(3, 0));
        assert!(!graph.has_dependency(0, 3));
        assert!(!graph.has_dependency(3, 3));
        assert_eq!(graph.direct_dependencies(6), &[4, 5]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let err = PackGraph::new(&[
            entry("a", 1, &[2]),
            entry("b", 1, &[0]),
            entry("c", 1, &[1]),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));

        let self_loop = PackGraph::from_dependencies(vec![vec![0]]).unwrap_err();
        assert_eq!(self_loop, GraphError::Cycle { pack: "0".into() });
    }

    #[test]
    fn test_unknown_dependency_and_pack() {
        let err = PackGraph::new(&[entry("a", 1, &[7])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                pack: "a".into(),
                dependency: 7
            }
        );
        assert_eq!(
            catalog().closure(&["nope"]).unwrap_err(),
            GraphError::UnknownPack("nope".into())
        );
    }
}
