//! In-memory catalog and executor for exercising the core without a server

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

use crate::catalog::{CatalogInspector, CommentDef, DependentRef, GrantDef, IndexDef, PolicyDef};
use crate::ddl::{DdlExecutor, PolicyCommand, QualifiedName, RelationKind, Statement};
use crate::error::{DepsError, DepsResult};

const SCHEMA: &str = "public";

#[derive(Debug, Clone)]
struct FakeRelation {
    name: QualifiedName,
    kind: Option<RelationKind>,
    depends_on: Vec<QualifiedName>,
}

/// Catalog built up with a small builder API
///
/// Every relation lives in `public`. Dependency lookups answer in name order
/// and include self-references, like a raw `pg_depend` scan would.
#[derive(Debug, Default)]
pub struct FakeCatalog {
    relations: Vec<FakeRelation>,
    indexes: Vec<(QualifiedName, IndexDef)>,
    policies: Vec<(QualifiedName, PolicyDef)>,
    comments: Vec<(QualifiedName, CommentDef)>,
    grants: Vec<(QualifiedName, GrantDef)>,
    owners: HashMap<QualifiedName, String>,
    broken_definitions: BTreeSet<QualifiedName>,
    dependent_lookups: RefCell<HashMap<QualifiedName, usize>>,
    definition_lookups: RefCell<HashMap<QualifiedName, usize>>,
    index_lookups: RefCell<HashMap<QualifiedName, usize>>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self, name: &str) -> QualifiedName {
        QualifiedName::new(SCHEMA, name)
    }

    fn add(mut self, name: &str, kind: Option<RelationKind>, depends_on: &[&str]) -> Self {
        let name = self.name(name);
        let depends_on = depends_on.iter().map(|d| self.name(d)).collect();
        self.relations.push(FakeRelation { name, kind, depends_on });
        self
    }

    pub fn table(self, name: &str) -> Self {
        self.add(name, None, &[])
    }

    pub fn view(self, name: &str, depends_on: &[&str]) -> Self {
        self.add(name, Some(RelationKind::View), depends_on)
    }

    pub fn materialized(self, name: &str, depends_on: &[&str]) -> Self {
        self.add(name, Some(RelationKind::MaterializedView), depends_on)
    }

    pub fn index(mut self, owner: &str, name: &str, definition: &str) -> Self {
        let owner = self.name(owner);
        self.indexes.push((
            owner,
            IndexDef { name: name.to_string(), definition: definition.to_string() },
        ));
        self
    }

    /// Permissive `FOR SELECT TO public USING (true)` policy
    pub fn policy(self, table: &str, name: &str) -> Self {
        self.policy_def(table, name, true)
    }

    pub fn restrictive_policy(self, table: &str, name: &str) -> Self {
        self.policy_def(table, name, false)
    }

    fn policy_def(mut self, table: &str, name: &str, permissive: bool) -> Self {
        let owner = self.name(table);
        self.policies.push((
            owner,
            PolicyDef {
                name: name.to_string(),
                schema: SCHEMA.to_string(),
                table: table.to_string(),
                permissive,
                command: PolicyCommand::Select,
                roles: vec!["public".to_string()],
                using_expression: Some("true".to_string()),
                check_expression: None,
            },
        ));
        self
    }

    pub fn comment(mut self, relation: &str, column: Option<&str>, text: &str) -> Self {
        let owner = self.name(relation);
        self.comments.push((
            owner,
            CommentDef { column: column.map(str::to_string), text: text.to_string() },
        ));
        self
    }

    pub fn grant(mut self, relation: &str, grantee: &str, privilege: &str) -> Self {
        let owner = self.name(relation);
        self.grants.push((
            owner,
            GrantDef {
                grantee: grantee.to_string(),
                privilege: privilege.to_string(),
                with_grant_option: false,
            },
        ));
        self
    }

    pub fn owner(mut self, relation: &str, role: &str) -> Self {
        let name = self.name(relation);
        self.owners.insert(name, role.to_string());
        self
    }

    /// Make `get_definition` fail for `relation`
    pub fn broken_definition(mut self, relation: &str) -> Self {
        let name = self.name(relation);
        self.broken_definitions.insert(name);
        self
    }

    pub fn dependent_lookups(&self, relation: &QualifiedName) -> usize {
        lookups(&self.dependent_lookups, relation)
    }

    pub fn definition_lookups(&self, relation: &QualifiedName) -> usize {
        lookups(&self.definition_lookups, relation)
    }

    pub fn index_lookups(&self, relation: &QualifiedName) -> usize {
        lookups(&self.index_lookups, relation)
    }

    fn find(&self, relation: &QualifiedName) -> Option<&FakeRelation> {
        self.relations.iter().find(|r| &r.name == relation)
    }
}

fn lookups(counter: &RefCell<HashMap<QualifiedName, usize>>, relation: &QualifiedName) -> usize {
    counter.borrow().get(relation).copied().unwrap_or(0)
}

fn bump(counter: &RefCell<HashMap<QualifiedName, usize>>, relation: &QualifiedName) {
    *counter.borrow_mut().entry(relation.clone()).or_insert(0) += 1;
}

impl CatalogInspector for FakeCatalog {
    fn resolve(&self, relation: &QualifiedName) -> DepsResult<Option<QualifiedName>> {
        Ok(self.find(relation).map(|r| r.name.clone()))
    }

    fn list_dependents(&self, relation: &QualifiedName) -> DepsResult<Vec<DependentRef>> {
        bump(&self.dependent_lookups, relation);

        let mut dependents: Vec<DependentRef> = self
            .relations
            .iter()
            .filter(|r| r.depends_on.contains(relation))
            .filter_map(|r| r.kind.map(|kind| DependentRef { name: r.name.clone(), kind }))
            .collect();
        dependents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(dependents)
    }

    fn get_definition(&self, relation: &QualifiedName) -> DepsResult<String> {
        bump(&self.definition_lookups, relation);

        if self.broken_definitions.contains(relation) {
            return Err(DepsError::CatalogError {
                operation: format!("Get definition of '{relation}'"),
                pg_error: "catalog lookup failed".to_string(),
            });
        }
        let found = self
            .find(relation)
            .ok_or_else(|| DepsError::RelationNotFound { relation: relation.to_string() })?;

        if found.depends_on.is_empty() {
            return Ok(" SELECT 1 AS id;".to_string());
        }
        let sources: Vec<String> = found.depends_on.iter().map(ToString::to_string).collect();
        Ok(format!(" SELECT id\n   FROM {};", sources.join(", ")))
    }

    fn list_indexes(&self, relation: &QualifiedName) -> DepsResult<Vec<IndexDef>> {
        bump(&self.index_lookups, relation);
        Ok(self.indexes.iter().filter(|(o, _)| o == relation).map(|(_, i)| i.clone()).collect())
    }

    fn list_policies(&self, relation: &QualifiedName) -> DepsResult<Vec<PolicyDef>> {
        Ok(self.policies.iter().filter(|(o, _)| o == relation).map(|(_, p)| p.clone()).collect())
    }

    fn list_comments(&self, relation: &QualifiedName) -> DepsResult<Vec<CommentDef>> {
        Ok(self.comments.iter().filter(|(o, _)| o == relation).map(|(_, c)| c.clone()).collect())
    }

    fn list_grants(&self, relation: &QualifiedName) -> DepsResult<Vec<GrantDef>> {
        Ok(self.grants.iter().filter(|(o, _)| o == relation).map(|(_, g)| g.clone()).collect())
    }

    /// Only owners set with [`FakeCatalog::owner`] are reported
    fn get_owner(&self, relation: &QualifiedName) -> DepsResult<Option<String>> {
        Ok(self.owners.get(relation).cloned())
    }
}

/// Executor that simulates the catalog effects of each statement
///
/// Tracks which relations and policies exist so a test can check the end
/// state, and fails on request. When seeded from a catalog it also knows
/// what each relation reads from, and rejects populating a materialized
/// view that reads from an unpopulated one, as the server does.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    pub executed: Vec<Statement>,
    pub relations: BTreeSet<QualifiedName>,
    /// (table, policy name)
    pub policies: BTreeSet<(QualifiedName, String)>,
    /// Relations holding data; materialized views start unpopulated
    pub populated: BTreeSet<QualifiedName>,
    /// Kind and sources of every seeded relation
    sources: HashMap<QualifiedName, (Option<RelationKind>, Vec<QualifiedName>)>,
    fail_on: Option<(&'static str, usize)>,
    seen_by_step: HashMap<&'static str, usize>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with every relation and policy of `catalog` present
    pub fn seeded(catalog: &FakeCatalog) -> Self {
        let mut executor = Self::new();
        for relation in &catalog.relations {
            executor.relations.insert(relation.name.clone());
            executor.populated.insert(relation.name.clone());
            executor
                .sources
                .insert(relation.name.clone(), (relation.kind, relation.depends_on.clone()));
        }
        for (owner, policy) in &catalog.policies {
            executor.policies.insert((owner.clone(), policy.name.clone()));
        }
        executor
    }

    /// Reject the `nth` (1-based) statement whose step is `step`
    pub fn fail_on(mut self, step: &'static str, nth: usize) -> Self {
        self.fail_on = Some((step, nth));
        self
    }

    pub fn rendered(&self) -> Vec<String> {
        self.executed.iter().map(Statement::render).collect()
    }

    pub fn steps(&self) -> Vec<&'static str> {
        self.executed.iter().map(Statement::step).collect()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.relations.contains(&QualifiedName::new(SCHEMA, name))
    }

    pub fn is_populated(&self, name: &str) -> bool {
        self.populated.contains(&QualifiedName::new(SCHEMA, name))
    }

    /// Fail when reading `relation` would hit an unpopulated materialized view
    fn check_readable(&self, relation: &QualifiedName) -> Result<(), String> {
        let Some((_, sources)) = self.sources.get(relation) else {
            return Ok(());
        };
        for source in sources {
            match self.sources.get(source) {
                Some((Some(RelationKind::MaterializedView), _)) if !self.populated.contains(source) => {
                    return Err(format!("materialized view {source} has not been populated"));
                }
                Some((Some(RelationKind::View), _)) => self.check_readable(source)?,
                _ => {}
            }
        }
        Ok(())
    }
}

impl DdlExecutor for RecordingExecutor {
    fn execute(&mut self, statement: &Statement) -> Result<(), String> {
        let step = statement.step();
        let seen = self.seen_by_step.entry(step).or_insert(0);
        *seen += 1;
        if self.fail_on == Some((step, *seen)) {
            return Err(format!("injected failure on {step} #{seen}"));
        }

        match statement {
            Statement::DropRelation { name, .. } => {
                self.relations.remove(name);
                self.populated.remove(name);
            }
            Statement::CreateRelation { name, kind, with_data, .. } => {
                if self.relations.contains(name) {
                    return Err(format!("relation {name} already exists"));
                }
                let populate = !kind.is_materialized() || *with_data;
                if kind.is_materialized() && populate {
                    self.check_readable(name)?;
                }
                self.relations.insert(name.clone());
                if populate {
                    self.populated.insert(name.clone());
                }
            }
            Statement::RefreshMaterializedView { name } => {
                if !self.relations.contains(name) {
                    return Err(format!("relation {name} does not exist"));
                }
                self.check_readable(name)?;
                self.populated.insert(name.clone());
            }
            Statement::DropPolicy { policy_name, table } => {
                self.policies.remove(&(table.clone(), policy_name.clone()));
            }
            Statement::CreatePolicy { policy_name, table, .. } => {
                if !self.policies.insert((table.clone(), policy_name.clone())) {
                    return Err(format!("policy {policy_name} already exists"));
                }
            }
            Statement::CreateIndex { owner, .. }
            | Statement::Comment { relation: owner, .. }
            | Statement::Grant { relation: owner, .. }
            | Statement::SetOwner { relation: owner, .. } => {
                if !self.relations.contains(owner) {
                    return Err(format!("relation {owner} does not exist"));
                }
            }
        }

        self.executed.push(statement.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_over_unpopulated_source_is_rejected() {
        let catalog = FakeCatalog::new()
            .materialized("mvw_root", &[])
            .materialized("report_a", &["mvw_root"])
            .materialized("mvw_b", &["report_a"]);
        let mut executor = RecordingExecutor::seeded(&catalog);
        let report_a = catalog.name("report_a");
        let mvw_b = catalog.name("mvw_b");

        for name in [&mvw_b, &report_a] {
            let drop = Statement::DropRelation { name: name.clone(), kind: RelationKind::MaterializedView };
            executor.execute(&drop).unwrap();
        }
        for name in [&report_a, &mvw_b] {
            let create = Statement::CreateRelation {
                name: name.clone(),
                kind: RelationKind::MaterializedView,
                query: "SELECT 1".to_string(),
                with_data: false,
            };
            executor.execute(&create).unwrap();
        }

        let refresh = executor.execute(&Statement::RefreshMaterializedView { name: mvw_b.clone() });
        assert_eq!(
            refresh,
            Err("materialized view public.report_a has not been populated".to_string())
        );
        assert!(!executor.is_populated("mvw_b"));
    }
}
