use std::fmt;

use serde::{Deserialize, Serialize};

use super::ident::{quote_ident, quote_literal, QualifiedName};

/// Kind of dependent relation, from `pg_class.relkind`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    View,
    MaterializedView,
}

impl RelationKind {
    /// Map a `relkind` code; anything but `v`/`m` cannot be a dependent
    pub fn from_relkind(relkind: &str) -> Option<Self> {
        match relkind {
            "v" => Some(RelationKind::View),
            "m" => Some(RelationKind::MaterializedView),
            _ => None,
        }
    }

    pub const fn is_materialized(self) -> bool {
        matches!(self, RelationKind::MaterializedView)
    }

    pub const fn keyword(self) -> &'static str {
        match self {
            RelationKind::View => "VIEW",
            RelationKind::MaterializedView => "MATERIALIZED VIEW",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationKind::View => write!(f, "view"),
            RelationKind::MaterializedView => write!(f, "materialized view"),
        }
    }
}

/// Command an access-control policy applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyCommand {
    All,
    Select,
    Insert,
    Update,
    Delete,
}

impl PolicyCommand {
    /// Parse `pg_policies.cmd` (case-insensitive)
    pub fn parse(cmd: &str) -> Option<Self> {
        match cmd.to_ascii_uppercase().as_str() {
            "ALL" | "*" => Some(PolicyCommand::All),
            "SELECT" | "R" => Some(PolicyCommand::Select),
            "INSERT" | "A" => Some(PolicyCommand::Insert),
            "UPDATE" | "W" => Some(PolicyCommand::Update),
            "DELETE" | "D" => Some(PolicyCommand::Delete),
            _ => None,
        }
    }

    pub const fn keyword(self) -> &'static str {
        match self {
            PolicyCommand::All => "ALL",
            PolicyCommand::Select => "SELECT",
            PolicyCommand::Insert => "INSERT",
            PolicyCommand::Update => "UPDATE",
            PolicyCommand::Delete => "DELETE",
        }
    }
}

/// Table privileges that can be replayed with `GRANT`
pub const GRANTABLE_PRIVILEGES: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "TRUNCATE", "REFERENCES", "TRIGGER", "MAINTAIN",
];

/// A single DDL request; [`Statement::render`] is the only place SQL text is produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statement {
    DropRelation {
        name: QualifiedName,
        kind: RelationKind,
    },
    CreateRelation {
        name: QualifiedName,
        kind: RelationKind,
        query: String,
        /// Materialized views only: populate while creating. When false the
        /// view is created empty and needs a refresh before it can be read.
        with_data: bool,
    },
    CreateIndex {
        owner: QualifiedName,
        index_name: String,
        definition: String,
    },
    RefreshMaterializedView {
        name: QualifiedName,
    },
    DropPolicy {
        policy_name: String,
        table: QualifiedName,
    },
    CreatePolicy {
        policy_name: String,
        table: QualifiedName,
        permissive: bool,
        command: PolicyCommand,
        roles: Vec<String>,
        using_expression: Option<String>,
        check_expression: Option<String>,
    },
    Comment {
        relation: QualifiedName,
        kind: RelationKind,
        column: Option<String>,
        text: String,
    },
    Grant {
        relation: QualifiedName,
        privilege: String,
        grantee: String,
        with_grant_option: bool,
    },
    SetOwner {
        relation: QualifiedName,
        kind: RelationKind,
        owner: String,
    },
}

impl Statement {
    /// Short label for logs and failure reports
    pub const fn step(&self) -> &'static str {
        match self {
            Statement::DropRelation { .. } => "drop_relation",
            Statement::CreateRelation { .. } => "create_relation",
            Statement::CreateIndex { .. } => "create_index",
            Statement::RefreshMaterializedView { .. } => "refresh",
            Statement::DropPolicy { .. } => "drop_policy",
            Statement::CreatePolicy { .. } => "create_policy",
            Statement::Comment { .. } => "comment",
            Statement::Grant { .. } => "grant",
            Statement::SetOwner { .. } => "set_owner",
        }
    }

    /// Relation the statement acts on
    pub fn relation(&self) -> &QualifiedName {
        match self {
            Statement::DropRelation { name, .. }
            | Statement::CreateRelation { name, .. }
            | Statement::RefreshMaterializedView { name } => name,
            Statement::CreateIndex { owner, .. } => owner,
            Statement::DropPolicy { table, .. } | Statement::CreatePolicy { table, .. } => table,
            Statement::Comment { relation, .. }
            | Statement::Grant { relation, .. }
            | Statement::SetOwner { relation, .. } => relation,
        }
    }

    /// Same statement with population switched on or off; other kinds are
    /// returned unchanged
    #[must_use]
    pub fn with_data(mut self, populate: bool) -> Self {
        if let Statement::CreateRelation { with_data, .. } = &mut self {
            *with_data = populate;
        }
        self
    }

    /// Render PostgreSQL syntax
    pub fn render(&self) -> String {
        match self {
            Statement::DropRelation { name, kind } => {
                format!("DROP {} IF EXISTS {name}", kind.keyword())
            }
            Statement::CreateRelation { name, kind, query, with_data } => {
                let query = query.trim().trim_end_matches(';').trim_end();
                match kind {
                    RelationKind::View => format!("CREATE VIEW {name} AS {query}"),
                    RelationKind::MaterializedView if *with_data => {
                        format!("CREATE MATERIALIZED VIEW {name} AS {query}")
                    }
                    RelationKind::MaterializedView => {
                        format!("CREATE MATERIALIZED VIEW {name} AS {query} WITH NO DATA")
                    }
                }
            }
            Statement::CreateIndex { definition, .. } => definition.clone(),
            Statement::RefreshMaterializedView { name } => {
                format!("REFRESH MATERIALIZED VIEW {name} WITH DATA")
            }
            Statement::DropPolicy { policy_name, table } => {
                format!("DROP POLICY IF EXISTS {} ON {table}", quote_ident(policy_name))
            }
            Statement::CreatePolicy {
                policy_name,
                table,
                permissive,
                command,
                roles,
                using_expression,
                check_expression,
            } => {
                let mut sql = format!(
                    "CREATE POLICY {} ON {table} AS {} FOR {} TO {}",
                    quote_ident(policy_name),
                    if *permissive { "PERMISSIVE" } else { "RESTRICTIVE" },
                    command.keyword(),
                    render_roles(roles),
                );
                if let Some(expr) = using_expression {
                    sql.push_str(&format!(" USING ({expr})"));
                }
                if let Some(expr) = check_expression {
                    sql.push_str(&format!(" WITH CHECK ({expr})"));
                }
                sql
            }
            Statement::Comment { relation, kind, column, text } => match column {
                Some(column) => format!(
                    "COMMENT ON COLUMN {relation}.{} IS {}",
                    quote_ident(column),
                    quote_literal(text)
                ),
                None => format!(
                    "COMMENT ON {} {relation} IS {}",
                    kind.keyword(),
                    quote_literal(text)
                ),
            },
            Statement::Grant { relation, privilege, grantee, with_grant_option } => {
                let mut sql = format!("GRANT {privilege} ON {relation} TO {}", render_role(grantee));
                if *with_grant_option {
                    sql.push_str(" WITH GRANT OPTION");
                }
                sql
            }
            Statement::SetOwner { relation, kind, owner } => {
                format!("ALTER {} {relation} OWNER TO {}", kind.keyword(), quote_ident(owner))
            }
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn render_role(role: &str) -> String {
    if role.eq_ignore_ascii_case("public") {
        "PUBLIC".to_string()
    } else {
        quote_ident(role)
    }
}

fn render_roles(roles: &[String]) -> String {
    if roles.is_empty() {
        return "PUBLIC".to_string();
    }
    roles.iter().map(|r| render_role(r.as_str())).collect::<Vec<_>>().join(", ")
}
