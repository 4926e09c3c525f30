//! Property-based tests for the planning, accounting, and pressure
//! primitives.

use modelpool_core::{ComponentSpec, ComponentType, DeviceId, MemoryPressure, ModelError};
use modelpool_device::{DeviceLedger, MemoryReporter};
use modelpool_manager::coordinator::graph::DependencyGraph;
use modelpool_manager::memory::block_map::BlockMap;
use proptest::prelude::*;
use std::collections::HashSet;

fn spec(id: String, deps: Vec<String>) -> ComponentSpec {
    ComponentSpec::new(id, "m", ComponentType::BaseModel, 64).with_dependencies(deps)
}

/// Random DAGs: node `i` may only depend on nodes `< i`, so the input
/// is acyclic by construction.
fn arb_dag() -> impl Strategy<Value = Vec<ComponentSpec>> {
    (2usize..12).prop_flat_map(|n| {
        let edges = proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n);
        edges.prop_map(move |matrix| {
            (0..n)
                .map(|i| {
                    let deps: Vec<String> = (0..i)
                        .filter(|j| matrix[i][*j])
                        .map(|j| format!("n{j}"))
                        .collect();
                    spec(format!("n{i}"), deps)
                })
                .collect()
        })
    })
}

proptest! {
    /// A component's batch level is strictly greater than every
    /// dependency's level, for any acyclic input.
    #[test]
    fn plan_respects_dependency_ordering(specs in arb_dag()) {
        let graph = DependencyGraph::build(&specs).expect("generated DAG must validate");
        for s in &specs {
            let level = graph.level_of(&s.id).expect("every component is leveled");
            for dep in &s.dependencies {
                let dep_level = graph.level_of(dep).expect("dependency is leveled");
                prop_assert!(level > dep_level, "{} (level {level}) <= {dep} (level {dep_level})", s.id);
            }
        }
        // Chunked plans preserve the ordering: a chunk containing a
        // component appears after every chunk containing a dependency.
        let wanted: HashSet<String> = specs.iter().map(|s| s.id.clone()).collect();
        for max_parallel in [1usize, 2, 4] {
            let plan = graph.plan_for(&wanted, max_parallel);
            let position = |id: &str| plan.iter().position(|chunk| chunk.iter().any(|c| c == id));
            for s in &specs {
                for dep in &s.dependencies {
                    prop_assert!(position(&s.id) > position(dep));
                }
            }
        }
    }

    /// Closing any chain into a ring must fail fast with a cycle error.
    #[test]
    fn rings_always_fail_with_cycle_error(n in 2usize..10) {
        let specs: Vec<ComponentSpec> = (0..n)
            .map(|i| spec(format!("n{i}"), vec![format!("n{}", (i + 1) % n)]))
            .collect();
        let err = DependencyGraph::build(&specs).unwrap_err();
        let is_cycle = matches!(err, ModelError::DependencyCycle { .. });
        prop_assert!(is_cycle);
    }

    /// For any reserve/release sequence, resident bytes never exceed
    /// capacity at any observable point.
    #[test]
    fn ledger_conserves_capacity(
        capacity in 256u64..4096,
        ops in proptest::collection::vec((0u8..2, 0usize..16, 1u64..1024), 1..64)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        rt.block_on(async {
            let device = DeviceId::cuda(0);
            let ledger = DeviceLedger::new();
            ledger.register_device(device, capacity).await;

            for (kind, slot, bytes) in ops {
                let id = format!("c{slot}");
                match kind {
                    0 => { let _ = ledger.reserve(device, &id, bytes).await; }
                    _ => { ledger.release(device, &id).await; }
                }
                let memory = ledger.device_memory(device).await.expect("registered device");
                assert!(
                    memory.used_bytes() <= capacity,
                    "resident {} exceeded capacity {capacity}",
                    memory.used_bytes()
                );
            }
        });
    }

    /// Block-map accounting: used + free always equals capacity, and
    /// the fragmentation ratio stays within [0, 1].
    #[test]
    fn block_map_accounting_is_consistent(
        capacity in 512u64..4096,
        ops in proptest::collection::vec((0u8..2, 0usize..12, 1u64..512), 1..48)
    ) {
        let mut map = BlockMap::new(capacity);
        let mut live: HashSet<usize> = HashSet::new();
        for (kind, slot, bytes) in ops {
            let id = format!("c{slot}");
            match kind {
                0 if !live.contains(&slot) => {
                    if map.allocate(&id, bytes).is_ok() {
                        live.insert(slot);
                    }
                }
                _ => {
                    map.free(&id);
                    live.remove(&slot);
                }
            }
            prop_assert_eq!(map.used_bytes() + map.free_bytes(), capacity);
            let fragmentation = map.fragmentation();
            prop_assert!((0.0..=1.0).contains(&fragmentation));
            prop_assert!(map.largest_gap() <= map.free_bytes());
        }

        // Compaction never loses extents and always reaches zero
        // fragmentation.
        let before = map.occupied().len();
        map.compact(|| false);
        prop_assert_eq!(map.occupied().len(), before);
        prop_assert_eq!(map.fragmentation(), 0.0);
    }

    /// Pressure classification is monotone in utilization.
    #[test]
    fn pressure_is_monotone(a in 0.0f64..120.0, b in 0.0f64..120.0) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(
            MemoryPressure::from_utilization(low) <= MemoryPressure::from_utilization(high)
        );
    }
}
