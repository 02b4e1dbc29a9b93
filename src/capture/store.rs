use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogInspector, PolicyDef};
use crate::ddl::{PolicyCommand, QualifiedName, RelationKind, Statement, GRANTABLE_PRIVILEGES};
use crate::dependency::DiscoveredRelation;
use crate::error::DepsResult;

/// One dependent relation at one level, with everything needed to drop and
/// recreate it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub name: QualifiedName,
    pub kind: RelationKind,
    pub level: u32,
    /// Query text captured before any drop
    pub definition: String,
    pub create_statement: Statement,
    pub drop_statement: Statement,
}

impl DependencyNode {
    pub fn new(found: &DiscoveredRelation, definition: String) -> Self {
        Self {
            create_statement: Statement::CreateRelation {
                name: found.name.clone(),
                kind: found.kind,
                query: definition.clone(),
                with_data: true,
            },
            drop_statement: Statement::DropRelation {
                name: found.name.clone(),
                kind: found.kind,
            },
            name: found.name.clone(),
            kind: found.kind,
            level: found.level,
            definition,
        }
    }

    pub const fn is_materialized(&self) -> bool {
        self.kind.is_materialized()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub owner_relation: QualifiedName,
    pub index_name: String,
    pub definition: String,
}

impl IndexRecord {
    pub fn create_statement(&self) -> Statement {
        Statement::CreateIndex {
            owner: self.owner_relation.clone(),
            index_name: self.index_name.clone(),
            definition: self.definition.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub policy_name: String,
    pub schema: String,
    pub table: String,
    pub permissive: bool,
    pub command: PolicyCommand,
    pub roles: Vec<String>,
    pub using_expression: Option<String>,
    pub check_expression: Option<String>,
    pub create_statement: Statement,
    pub drop_statement: Statement,
}

impl From<PolicyDef> for PolicyRecord {
    fn from(def: PolicyDef) -> Self {
        let table = QualifiedName::new(def.schema.clone(), def.table.clone());
        Self {
            create_statement: Statement::CreatePolicy {
                policy_name: def.name.clone(),
                table: table.clone(),
                permissive: def.permissive,
                command: def.command,
                roles: def.roles.clone(),
                using_expression: def.using_expression.clone(),
                check_expression: def.check_expression.clone(),
            },
            drop_statement: Statement::DropPolicy {
                policy_name: def.name.clone(),
                table,
            },
            policy_name: def.name,
            schema: def.schema,
            table: def.table,
            permissive: def.permissive,
            command: def.command,
            roles: def.roles,
            using_expression: def.using_expression,
            check_expression: def.check_expression,
        }
    }
}

/// Comment or grant replayed right after its relation is rebuilt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedStatement {
    pub owner_relation: QualifiedName,
    pub statement: Statement,
}

/// Everything captured in phase 1 that phase 2 needs to replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStore {
    /// Every (relation, level) occurrence, in discovery order
    pub relations: Vec<DependencyNode>,
    pub indexes: Vec<IndexRecord>,
    pub policies: Vec<PolicyRecord>,
    pub comments: Vec<AttachedStatement>,
    pub grants: Vec<AttachedStatement>,
    /// `ALTER ... OWNER TO`, replayed last for each relation
    pub owners: Vec<AttachedStatement>,
}

impl CaptureStore {
    /// Capture definitions, indexes, policies, comments, grants and owners for
    /// the discovered closure
    ///
    /// Catalog lookups happen once per distinct relation. Policies are
    /// captured for the closure and for `root` itself.
    pub fn populate(
        root: &QualifiedName,
        discovered: &[DiscoveredRelation],
        catalog: &impl CatalogInspector,
    ) -> DepsResult<Self> {
        let mut store = Self::default();
        let mut definitions: HashMap<QualifiedName, String> = HashMap::new();
        let mut distinct: Vec<(&QualifiedName, RelationKind)> = Vec::new();

        for found in discovered {
            let definition = match definitions.entry(found.name.clone()) {
                Entry::Occupied(slot) => slot.get().clone(),
                Entry::Vacant(slot) => {
                    distinct.push((&found.name, found.kind));
                    slot.insert(catalog.get_definition(&found.name)?).clone()
                }
            };
            store.relations.push(DependencyNode::new(found, definition));
        }

        for &(name, kind) in &distinct {
            if let Some(owner) = catalog.get_owner(name)? {
                store.owners.push(AttachedStatement {
                    owner_relation: name.clone(),
                    statement: Statement::SetOwner { relation: name.clone(), kind, owner },
                });
            }

            if kind.is_materialized() {
                for index in catalog.list_indexes(name)? {
                    store.indexes.push(IndexRecord {
                        owner_relation: name.clone(),
                        index_name: index.name,
                        definition: index.definition,
                    });
                }
            }

            for comment in catalog.list_comments(name)? {
                store.comments.push(AttachedStatement {
                    owner_relation: name.clone(),
                    statement: Statement::Comment {
                        relation: name.clone(),
                        kind,
                        column: comment.column,
                        text: comment.text,
                    },
                });
            }

            for grant in catalog.list_grants(name)? {
                if !GRANTABLE_PRIVILEGES.contains(&grant.privilege.as_str()) {
                    continue;
                }
                store.grants.push(AttachedStatement {
                    owner_relation: name.clone(),
                    statement: Statement::Grant {
                        relation: name.clone(),
                        privilege: grant.privilege,
                        grantee: grant.grantee,
                        with_grant_option: grant.with_grant_option,
                    },
                });
            }
        }

        let mut policy_owners: Vec<&QualifiedName> = vec![root];
        policy_owners.extend(distinct.iter().map(|(name, _)| *name));
        let mut seen_policies: HashSet<(String, String, String)> = HashSet::new();
        for owner in policy_owners {
            for policy in catalog.list_policies(owner)? {
                let key = (policy.schema.clone(), policy.table.clone(), policy.name.clone());
                if seen_policies.insert(key) {
                    store.policies.push(PolicyRecord::from(policy));
                }
            }
        }

        Ok(store)
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    /// Number of distinct relations captured
    pub fn relation_count(&self) -> usize {
        self.relations.iter().map(|n| &n.name).collect::<HashSet<_>>().len()
    }

    /// Every captured occurrence, deepest level first
    ///
    /// Nothing is deduplicated: dropping an already-dropped relation is a
    /// no-op because drops render as `DROP ... IF EXISTS`.
    pub fn for_drop(&self) -> Vec<&DependencyNode> {
        let mut nodes: Vec<&DependencyNode> = self.relations.iter().collect();
        nodes.sort_by(|a, b| b.level.cmp(&a.level));
        nodes
    }

    /// One canonical occurrence per relation, shallowest level first
    ///
    /// The canonical occurrence is the one with the highest level. Ties keep
    /// discovery order.
    pub fn for_rebuild(&self) -> Vec<&DependencyNode> {
        let mut canonical: HashMap<&QualifiedName, usize> = HashMap::new();
        for (position, node) in self.relations.iter().enumerate() {
            canonical
                .entry(&node.name)
                .and_modify(|best| {
                    if node.level > self.relations[*best].level {
                        *best = position;
                    }
                })
                .or_insert(position);
        }

        let mut positions: Vec<usize> = canonical.into_values().collect();
        positions.sort_by_key(|&p| (self.relations[p].level, p));
        positions.into_iter().map(|p| &self.relations[p]).collect()
    }

    pub fn indexes_for<'a>(&'a self, owner: &'a QualifiedName) -> impl Iterator<Item = &'a IndexRecord> + 'a {
        self.indexes.iter().filter(move |i| &i.owner_relation == owner)
    }

    pub fn comments_for<'a>(&'a self, owner: &'a QualifiedName) -> impl Iterator<Item = &'a AttachedStatement> + 'a {
        self.comments.iter().filter(move |c| &c.owner_relation == owner)
    }

    pub fn grants_for<'a>(&'a self, owner: &'a QualifiedName) -> impl Iterator<Item = &'a AttachedStatement> + 'a {
        self.grants.iter().filter(move |g| &g.owner_relation == owner)
    }

    pub fn owners_for<'a>(&'a self, owner: &'a QualifiedName) -> impl Iterator<Item = &'a AttachedStatement> + 'a {
        self.owners.iter().filter(move |o| &o.owner_relation == owner)
    }

    /// Copy holding only the relations and policies whose rendered drop
    /// statement is in `dropped`, with their attached records
    pub fn restricted_to(&self, dropped: &HashSet<&str>) -> Self {
        let relations: Vec<DependencyNode> = self
            .relations
            .iter()
            .filter(|n| dropped.contains(n.drop_statement.render().as_str()))
            .cloned()
            .collect();
        let kept: HashSet<&QualifiedName> = relations.iter().map(|n| &n.name).collect();
        let attached = |records: &[AttachedStatement]| -> Vec<AttachedStatement> {
            records.iter().filter(|r| kept.contains(&r.owner_relation)).cloned().collect()
        };

        Self {
            indexes: self
                .indexes
                .iter()
                .filter(|i| kept.contains(&i.owner_relation))
                .cloned()
                .collect(),
            policies: self
                .policies
                .iter()
                .filter(|p| dropped.contains(p.drop_statement.render().as_str()))
                .cloned()
                .collect(),
            comments: attached(&self.comments),
            grants: attached(&self.grants),
            owners: attached(&self.owners),
            relations,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
