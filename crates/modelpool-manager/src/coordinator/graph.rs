//! Dependency graphs and loading plans.
//!
//! A graph is validated on construction: acyclicity is checked with a
//! topological sort, never trusted from caller-supplied ordering. The
//! leveling groups components into batches where every dependency of a
//! batch lives in a strictly earlier batch.

use modelpool_core::{ComponentSpec, ModelError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Validated DAG over one set of component specs.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    specs: HashMap<String, ComponentSpec>,
    /// Topological levels; level `i` components depend only on levels `< i`.
    levels: Vec<Vec<String>>,
    level_of: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Build and validate a graph. Dependencies on components outside
    /// `specs` are a validation error; a cycle fails fast with the
    /// offending path.
    pub fn build(specs: &[ComponentSpec]) -> Result<Self, ModelError> {
        let by_id: HashMap<String, ComponentSpec> =
            specs.iter().map(|s| (s.id.clone(), s.clone())).collect();

        for spec in specs {
            for dep in &spec.dependencies {
                if !by_id.contains_key(dep) {
                    return Err(ModelError::Validation(format!(
                        "component {} depends on unknown component {dep}",
                        spec.id
                    )));
                }
            }
        }

        // Kahn's algorithm; anything left with in-degree > 0 afterwards
        // sits on a cycle.
        let mut in_degree: HashMap<&str, usize> =
            specs.iter().map(|s| (s.id.as_str(), s.dependencies.len())).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for spec in specs {
            for dep in &spec.dependencies {
                dependents.entry(dep.as_str()).or_default().push(spec.id.as_str());
            }
        }

        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter_map(|(id, deg)| (*deg == 0).then_some(*id))
            .collect();

        let mut level_of: HashMap<String, usize> = HashMap::new();
        let mut resolved = 0usize;
        while let Some(id) = ready.pop_front() {
            let spec = &by_id[id];
            let level = spec
                .dependencies
                .iter()
                .map(|d| level_of[d] + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(id.to_string(), level);
            resolved += 1;

            for dependent in dependents.get(id).into_iter().flatten() {
                let deg = in_degree.get_mut(dependent).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    ready.push_back(dependent);
                }
            }
        }

        if resolved != specs.len() {
            let cycle = find_cycle(&by_id, &level_of);
            return Err(ModelError::DependencyCycle { cycle });
        }

        let max_level = level_of.values().copied().max().map_or(0, |m| m + 1);
        let mut levels: Vec<Vec<String>> = vec![Vec::new(); max_level];
        for (id, level) in &level_of {
            levels[*level].push(id.clone());
        }
        // Deterministic plans regardless of map iteration order.
        for level in &mut levels {
            level.sort();
        }

        Ok(Self { specs: by_id, levels, level_of })
    }

    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn level_of(&self, id: &str) -> Option<usize> {
        self.level_of.get(id).copied()
    }

    pub fn spec(&self, id: &str) -> Option<&ComponentSpec> {
        self.specs.get(id)
    }

    pub fn component_count(&self) -> usize {
        self.specs.len()
    }

    /// Length of the longest dependency chain.
    pub fn critical_path_len(&self) -> usize {
        self.levels.len()
    }

    /// Transitive closure of `roots` and their dependencies.
    pub fn closure_of(&self, roots: &[String]) -> HashSet<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut stack: Vec<&str> = roots.iter().map(String::as_str).collect();
        while let Some(id) = stack.pop() {
            if let Some(spec) = self.specs.get(id)
                && seen.insert(id.to_string())
            {
                stack.extend(spec.dependencies.iter().map(String::as_str));
            }
        }
        seen
    }

    /// Ids that transitively depend on `id` (used to skip dependents of
    /// a failed component).
    pub fn transitive_dependents(&self, id: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let mut changed = true;
        while changed {
            changed = false;
            for spec in self.specs.values() {
                if result.contains(&spec.id) {
                    continue;
                }
                if spec.dependencies.iter().any(|d| d == id || result.contains(d)) {
                    result.insert(spec.id.clone());
                    changed = true;
                }
            }
        }
        result
    }

    /// Loading plan restricted to `wanted`, each level chunked to at
    /// most `max_parallel` components.
    pub fn plan_for(&self, wanted: &HashSet<String>, max_parallel: usize) -> Vec<Vec<String>> {
        let max_parallel = max_parallel.max(1);
        let mut plan = Vec::new();
        for level in &self.levels {
            let members: Vec<String> =
                level.iter().filter(|id| wanted.contains(*id)).cloned().collect();
            for chunk in members.chunks(max_parallel) {
                plan.push(chunk.to_vec());
            }
        }
        plan
    }
}

/// Walk unresolved nodes to produce one concrete cycle path for the
/// error message.
fn find_cycle(
    by_id: &HashMap<String, ComponentSpec>,
    resolved: &HashMap<String, usize>,
) -> Vec<String> {
    let start = by_id
        .keys()
        .filter(|id| !resolved.contains_key(*id))
        .min()
        .cloned()
        .unwrap_or_default();

    let mut path = vec![start.clone()];
    let mut seen: HashSet<String> = HashSet::from([start.clone()]);
    let mut current = start.clone();
    loop {
        let Some(next) = by_id[&current]
            .dependencies
            .iter()
            .find(|d| !resolved.contains_key(*d))
            .cloned()
        else {
            return path;
        };
        path.push(next.clone());
        if !seen.insert(next.clone()) {
            return path;
        }
        current = next;
    }
}

/// Per-model graph cache with explicit invalidation.
#[derive(Debug)]
pub struct GraphCache {
    graphs: RwLock<HashMap<String, Arc<DependencyGraph>>>,
    capacity: usize,
}

impl GraphCache {
    pub fn new(capacity: usize) -> Self {
        Self { graphs: RwLock::new(HashMap::new()), capacity: capacity.max(1) }
    }

    pub async fn get(&self, model: &str) -> Option<Arc<DependencyGraph>> {
        self.graphs.read().await.get(model).cloned()
    }

    pub async fn insert(&self, model: String, graph: Arc<DependencyGraph>) {
        let mut graphs = self.graphs.write().await;
        if graphs.len() >= self.capacity && !graphs.contains_key(&model) {
            // Drop an arbitrary entry; graphs rebuild cheaply.
            if let Some(victim) = graphs.keys().next().cloned() {
                graphs.remove(&victim);
            }
        }
        graphs.insert(model, graph);
    }

    /// Invalidate a model's cached graph after its definition changes.
    pub async fn invalidate(&self, model: &str) {
        self.graphs.write().await.remove(model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelpool_core::ComponentType;

    fn spec(id: &str, deps: &[&str]) -> ComponentSpec {
        ComponentSpec::new(id, "m", ComponentType::BaseModel, 100)
            .with_dependencies(deps.iter().copied())
    }

    #[test]
    fn chain_levels_in_order() {
        let graph = DependencyGraph::build(&[
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["b"]),
        ])
        .unwrap();
        assert_eq!(graph.levels(), &[vec!["a".to_string()], vec!["b".into()], vec!["c".into()]]);
    }

    #[test]
    fn diamond_shares_levels() {
        let graph = DependencyGraph::build(&[
            spec("root", &[]),
            spec("left", &["root"]),
            spec("right", &["root"]),
            spec("sink", &["left", "right"]),
        ])
        .unwrap();
        assert_eq!(graph.level_of("root"), Some(0));
        assert_eq!(graph.level_of("left"), Some(1));
        assert_eq!(graph.level_of("right"), Some(1));
        assert_eq!(graph.level_of("sink"), Some(2));
    }

    #[test]
    fn every_component_is_above_its_dependencies() {
        let graph = DependencyGraph::build(&[
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["a"]),
            spec("d", &["b", "c"]),
            spec("e", &["a", "d"]),
        ])
        .unwrap();
        for id in ["b", "c", "d", "e"] {
            let level = graph.level_of(id).unwrap();
            for dep in &graph.spec(id).unwrap().dependencies {
                assert!(level > graph.level_of(dep).unwrap(), "{id} not above {dep}");
            }
        }
    }

    #[test]
    fn cycle_fails_fast_with_path() {
        let err = DependencyGraph::build(&[
            spec("a", &["c"]),
            spec("b", &["a"]),
            spec("c", &["b"]),
        ])
        .unwrap_err();
        match err {
            ModelError::DependencyCycle { cycle } => {
                assert!(cycle.len() >= 3, "cycle too short: {cycle:?}");
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_dependency_is_validation_error() {
        let err = DependencyGraph::build(&[spec("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, ModelError::Validation(_)));
    }

    #[test]
    fn plan_chunks_wide_levels() {
        let graph = DependencyGraph::build(&[
            spec("root", &[]),
            spec("w1", &["root"]),
            spec("w2", &["root"]),
            spec("w3", &["root"]),
        ])
        .unwrap();
        let wanted = graph.closure_of(&["w1".into(), "w2".into(), "w3".into()]);
        let plan = graph.plan_for(&wanted, 2);
        assert_eq!(plan, vec![
            vec!["root".to_string()],
            vec!["w1".to_string(), "w2".to_string()],
            vec!["w3".to_string()],
        ]);
    }

    #[test]
    fn transitive_dependents_covers_chains() {
        let graph = DependencyGraph::build(&[
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["b"]),
            spec("d", &[]),
        ])
        .unwrap();
        let dependents = graph.transitive_dependents("a");
        assert!(dependents.contains("b"));
        assert!(dependents.contains("c"));
        assert!(!dependents.contains("d"));
    }

    #[tokio::test]
    async fn cache_invalidation_drops_entry() {
        let cache = GraphCache::new(4);
        let graph = Arc::new(DependencyGraph::build(&[spec("a", &[])]).unwrap());
        cache.insert("m".into(), graph).await;
        assert!(cache.get("m").await.is_some());
        cache.invalidate("m").await;
        assert!(cache.get("m").await.is_none());
    }
}
