use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogInspector, DependentRef};
use crate::config::MigrationConfig;
use crate::ddl::{QualifiedName, RelationKind};
use crate::error::{DepsError, DepsResult};

/// One (relation, level) pair found while expanding the closure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredRelation {
    pub name: QualifiedName,
    pub kind: RelationKind,
    /// Hops from the root; 1 = direct dependent
    pub level: u32,
}

/// Find every view/materialized view that transitively depends on `root`
///
/// ALGORITHM (breadth-first worklist):
/// 1. Level 1 = direct dependents of `root`
/// 2. Level N+1 = dependents of every relation found at level N
/// 3. A relation reached again at a deeper level is recorded again; only
///    repeats within the same level are collapsed
/// 4. Stop when a round produces no relations
///
/// The returned sequence is ordered by level, then by catalog order within a
/// level. An empty result means the root has no dependents.
///
/// # Errors
/// Returns `DependencyDepthExceeded` if expansion does not settle within
/// `config.max_depth` rounds, or any catalog error.
pub fn discover(
    catalog: &impl CatalogInspector,
    config: &MigrationConfig,
    root: &QualifiedName,
) -> DepsResult<Vec<DiscoveredRelation>> {
    let mut discovered = Vec::new();
    let mut edges: HashMap<QualifiedName, Vec<DependentRef>> = HashMap::new();
    let mut frontier: Vec<QualifiedName> = vec![root.clone()];
    let mut level: u32 = 0;

    while !frontier.is_empty() {
        level += 1;

        let mut seen_this_level: HashSet<QualifiedName> = HashSet::new();
        let mut round = Vec::new();

        for current in &frontier {
            if let Entry::Vacant(slot) = edges.entry(current.clone()) {
                slot.insert(catalog.list_dependents(current)?);
            }

            for dependent in &edges[current] {
                // self-references never become edges
                if &dependent.name == current {
                    continue;
                }
                if !seen_this_level.insert(dependent.name.clone()) {
                    continue;
                }

                round.push(DiscoveredRelation {
                    name: dependent.name.clone(),
                    kind: dependent.kind,
                    level,
                });
            }
        }

        if !round.is_empty() && level as usize > config.max_depth {
            return Err(DepsError::DependencyDepthExceeded {
                depth: level as usize,
                max_depth: config.max_depth,
            });
        }

        frontier = round.iter().map(|d| d.name.clone()).collect();
        discovered.extend(round);
    }

    Ok(discovered)
}
