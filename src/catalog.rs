use pgrx::prelude::*;
use pgrx::IntoDatum;
use serde::{Deserialize, Serialize};

use crate::ddl::{PolicyCommand, QualifiedName, RelationKind};
use crate::error::{DepsError, DepsResult};

/// A relation whose rewrite rule references the inspected relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentRef {
    pub name: QualifiedName,
    pub kind: RelationKind,
}

/// One index as reported by `pg_indexes`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub definition: String,
}

/// One row-level security policy as reported by `pg_policies`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDef {
    pub name: String,
    pub schema: String,
    pub table: String,
    pub permissive: bool,
    pub command: PolicyCommand,
    pub roles: Vec<String>,
    pub using_expression: Option<String>,
    pub check_expression: Option<String>,
}

/// Comment on a relation (`column = None`) or on one of its columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentDef {
    pub column: Option<String>,
    pub text: String,
}

/// One privilege held by a grantee other than the owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantDef {
    pub grantee: String,
    pub privilege: String,
    pub with_grant_option: bool,
}

/// Read-only view of the system catalog
pub trait CatalogInspector {
    /// Canonical name of `relation`, or `None` when it does not exist
    fn resolve(&self, relation: &QualifiedName) -> DepsResult<Option<QualifiedName>>;

    /// Views and materialized views whose rewrite rule has a normal
    /// dependency on `relation`, excluding `relation` itself
    fn list_dependents(&self, relation: &QualifiedName) -> DepsResult<Vec<DependentRef>>;

    /// Query text needed to recreate `relation`
    fn get_definition(&self, relation: &QualifiedName) -> DepsResult<String>;

    fn list_indexes(&self, relation: &QualifiedName) -> DepsResult<Vec<IndexDef>>;

    fn list_policies(&self, relation: &QualifiedName) -> DepsResult<Vec<PolicyDef>>;

    fn list_comments(&self, relation: &QualifiedName) -> DepsResult<Vec<CommentDef>>;

    fn list_grants(&self, relation: &QualifiedName) -> DepsResult<Vec<GrantDef>>;

    /// Role that owns `relation`
    fn get_owner(&self, relation: &QualifiedName) -> DepsResult<Option<String>>;
}

/// [`CatalogInspector`] backed by SPI queries against `pg_catalog`
#[derive(Debug, Default, Clone, Copy)]
pub struct SpiCatalog;

const RESOLVE_SQL: &str = "SELECT n.nspname::text AS schema_name, c.relname::text AS relation_name \
     FROM pg_class c \
     JOIN pg_namespace n ON n.oid = c.relnamespace \
     WHERE c.oid = to_regclass($1)";

const DEPENDENTS_SQL: &str = "SELECT DISTINCT dn.nspname::text AS schema_name, \
            dc.relname::text AS relation_name, \
            dc.relkind::text AS relkind \
     FROM pg_depend d \
     JOIN pg_rewrite r ON r.oid = d.objid \
     JOIN pg_class dc ON dc.oid = r.ev_class \
     JOIN pg_namespace dn ON dn.oid = dc.relnamespace \
     WHERE d.classid = 'pg_rewrite'::regclass \
       AND d.refclassid = 'pg_class'::regclass \
       AND d.deptype = 'n' \
       AND d.refobjid = $1::regclass \
       AND dc.oid <> d.refobjid \
       AND dc.relkind IN ('v', 'm') \
     ORDER BY 1, 2";

const DEFINITION_SQL: &str = "SELECT pg_get_viewdef($1::regclass, true) AS definition";

const INDEXES_SQL: &str = "SELECT indexname::text AS index_name, indexdef AS definition \
     FROM pg_indexes \
     WHERE schemaname = $1 AND tablename = $2 \
     ORDER BY indexname";

const POLICIES_SQL: &str = "SELECT policyname::text AS policy_name, \
            schemaname::text AS schema_name, \
            tablename::text AS table_name, \
            permissive = 'PERMISSIVE' AS permissive, \
            cmd AS command, \
            roles::text[] AS roles, \
            qual AS using_expression, \
            with_check AS check_expression \
     FROM pg_policies \
     WHERE schemaname = $1 AND tablename = $2 \
     ORDER BY policyname";

const COMMENTS_SQL: &str = "SELECT a.attname::text AS column_name, d.description \
     FROM pg_description d \
     LEFT JOIN pg_attribute a ON a.attrelid = d.objoid AND a.attnum = d.objsubid \
     WHERE d.classoid = 'pg_class'::regclass \
       AND d.objoid = $1::regclass \
     ORDER BY d.objsubid";

const GRANTS_SQL: &str = "SELECT CASE WHEN a.grantee = 0 THEN 'PUBLIC' \
                 ELSE pg_get_userbyid(a.grantee)::text END AS grantee, \
            a.privilege_type AS privilege, \
            a.is_grantable AS with_grant_option \
     FROM pg_class c \
     CROSS JOIN LATERAL aclexplode(c.relacl) a \
     WHERE c.oid = $1::regclass \
       AND a.grantee <> c.relowner \
     ORDER BY 1, 2";

const OWNER_SQL: &str = "SELECT pg_get_userbyid(c.relowner)::text AS owner \
     FROM pg_class c \
     WHERE c.oid = $1::regclass";

fn text_arg(value: &str) -> (PgOid, Option<pg_sys::Datum>) {
    (PgOid::BuiltIn(PgBuiltInOids::TEXTOID), value.into_datum())
}

fn spi_error(query: &str, e: impl std::fmt::Display) -> DepsError {
    DepsError::SpiError {
        query: query.to_string(),
        error: e.to_string(),
    }
}

fn null_column(query: &str, column: &str) -> DepsError {
    DepsError::CatalogError {
        operation: format!("Read '{column}' from catalog"),
        pg_error: format!("NULL value returned by: {query}"),
    }
}

impl CatalogInspector for SpiCatalog {
    fn resolve(&self, relation: &QualifiedName) -> DepsResult<Option<QualifiedName>> {
        let qualified = relation.to_string();

        Spi::connect(|client| {
            let mut rows = client.select(RESOLVE_SQL, Some(1), Some(vec![text_arg(&qualified)]))?;

            match rows.next() {
                Some(row) => {
                    let schema: Option<String> = row["schema_name"].value()?;
                    let name: Option<String> = row["relation_name"].value()?;
                    Ok(schema.zip(name).map(|(s, n)| QualifiedName::new(s, n)))
                }
                None => Ok(None),
            }
        })
        .map_err(|e: pgrx::spi::Error| spi_error(RESOLVE_SQL, e))
    }

    fn list_dependents(&self, relation: &QualifiedName) -> DepsResult<Vec<DependentRef>> {
        let qualified = relation.to_string();

        Spi::connect(|client| {
            let rows = client.select(DEPENDENTS_SQL, None, Some(vec![text_arg(&qualified)]))?;
            let mut result = Vec::new();

            for row in rows {
                let schema: Option<String> = row["schema_name"].value()?;
                let name: Option<String> = row["relation_name"].value()?;
                let relkind: Option<String> = row["relkind"].value()?;

                let (Some(schema), Some(name)) = (schema, name) else {
                    return Ok(Err(null_column(DEPENDENTS_SQL, "relation_name")));
                };
                if let Some(kind) = relkind.as_deref().and_then(RelationKind::from_relkind) {
                    result.push(DependentRef { name: QualifiedName::new(schema, name), kind });
                }
            }

            Ok(Ok(result))
        })
        .map_err(|e: pgrx::spi::Error| spi_error(DEPENDENTS_SQL, e))?
    }

    fn get_definition(&self, relation: &QualifiedName) -> DepsResult<String> {
        let qualified = relation.to_string();

        Spi::get_one_with_args::<String>(DEFINITION_SQL, vec![text_arg(&qualified)])
            .map_err(|e| DepsError::CatalogError {
                operation: format!("Get definition of '{qualified}'"),
                pg_error: e.to_string(),
            })?
            .ok_or_else(|| DepsError::RelationNotFound { relation: qualified })
    }

    fn list_indexes(&self, relation: &QualifiedName) -> DepsResult<Vec<IndexDef>> {
        Spi::connect(|client| {
            let rows = client.select(
                INDEXES_SQL,
                None,
                Some(vec![text_arg(&relation.schema), text_arg(&relation.name)]),
            )?;
            let mut result = Vec::new();

            for row in rows {
                let name: Option<String> = row["index_name"].value()?;
                let definition: Option<String> = row["definition"].value()?;
                match (name, definition) {
                    (Some(name), Some(definition)) => result.push(IndexDef { name, definition }),
                    _ => return Ok(Err(null_column(INDEXES_SQL, "indexdef"))),
                }
            }

            Ok(Ok(result))
        })
        .map_err(|e: pgrx::spi::Error| spi_error(INDEXES_SQL, e))?
    }

    fn list_policies(&self, relation: &QualifiedName) -> DepsResult<Vec<PolicyDef>> {
        Spi::connect(|client| {
            let rows = client.select(
                POLICIES_SQL,
                None,
                Some(vec![text_arg(&relation.schema), text_arg(&relation.name)]),
            )?;
            let mut result = Vec::new();

            for row in rows {
                let name: Option<String> = row["policy_name"].value()?;
                let schema: Option<String> = row["schema_name"].value()?;
                let table: Option<String> = row["table_name"].value()?;
                let permissive: Option<bool> = row["permissive"].value()?;
                let command: Option<String> = row["command"].value()?;
                let roles: Option<Vec<String>> = row["roles"].value()?;

                let (Some(name), Some(schema), Some(table)) = (name, schema, table) else {
                    return Ok(Err(null_column(POLICIES_SQL, "policyname")));
                };
                let Some(command) = command.as_deref().and_then(PolicyCommand::parse) else {
                    return Ok(Err(DepsError::CatalogError {
                        operation: format!("Read command of policy '{name}'"),
                        pg_error: format!("unrecognised policy command {command:?}"),
                    }));
                };

                result.push(PolicyDef {
                    name,
                    schema,
                    table,
                    permissive: permissive.unwrap_or(true),
                    command,
                    roles: roles.unwrap_or_default(),
                    using_expression: row["using_expression"].value()?,
                    check_expression: row["check_expression"].value()?,
                });
            }

            Ok(Ok(result))
        })
        .map_err(|e: pgrx::spi::Error| spi_error(POLICIES_SQL, e))?
    }

    fn list_comments(&self, relation: &QualifiedName) -> DepsResult<Vec<CommentDef>> {
        let qualified = relation.to_string();

        Spi::connect(|client| {
            let rows = client.select(COMMENTS_SQL, None, Some(vec![text_arg(&qualified)]))?;
            let mut result = Vec::new();

            for row in rows {
                let column: Option<String> = row["column_name"].value()?;
                let text: Option<String> = row["description"].value()?;
                if let Some(text) = text {
                    result.push(CommentDef { column, text });
                }
            }

            Ok(result)
        })
        .map_err(|e: pgrx::spi::Error| spi_error(COMMENTS_SQL, e))
    }

    fn list_grants(&self, relation: &QualifiedName) -> DepsResult<Vec<GrantDef>> {
        let qualified = relation.to_string();

        Spi::connect(|client| {
            let rows = client.select(GRANTS_SQL, None, Some(vec![text_arg(&qualified)]))?;
            let mut result = Vec::new();

            for row in rows {
                let grantee: Option<String> = row["grantee"].value()?;
                let privilege: Option<String> = row["privilege"].value()?;
                let with_grant_option: Option<bool> = row["with_grant_option"].value()?;
                if let (Some(grantee), Some(privilege)) = (grantee, privilege) {
                    result.push(GrantDef {
                        grantee,
                        privilege,
                        with_grant_option: with_grant_option.unwrap_or(false),
                    });
                }
            }

            Ok(result)
        })
        .map_err(|e: pgrx::spi::Error| spi_error(GRANTS_SQL, e))
    }

    fn get_owner(&self, relation: &QualifiedName) -> DepsResult<Option<String>> {
        Spi::get_one_with_args::<String>(OWNER_SQL, vec![text_arg(&relation.to_string())])
            .map_err(|e| spi_error(OWNER_SQL, e))
    }
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;

    use crate::catalog::{CatalogInspector, SpiCatalog};
    use crate::ddl::{QualifiedName, RelationKind};

    fn public(name: &str) -> QualifiedName {
        QualifiedName::new("public", name)
    }

    #[pg_test]
    fn test_list_dependents_only_direct_views() {
        Spi::run("CREATE TABLE public.tb_cat (id INT PRIMARY KEY, amount INT)").unwrap();
        Spi::run("CREATE MATERIALIZED VIEW public.mvw_cat_root AS SELECT id, amount FROM public.tb_cat").unwrap();
        Spi::run("CREATE VIEW public.v_cat_a AS SELECT id FROM public.mvw_cat_root").unwrap();
        Spi::run("CREATE MATERIALIZED VIEW public.mvw_cat_b AS SELECT id FROM public.mvw_cat_root").unwrap();
        Spi::run("CREATE VIEW public.v_cat_c AS SELECT id FROM public.v_cat_a").unwrap();

        let deps = SpiCatalog.list_dependents(&public("mvw_cat_root")).unwrap();
        let names: Vec<(String, RelationKind)> =
            deps.into_iter().map(|d| (d.name.name, d.kind)).collect();

        assert_eq!(
            names,
            vec![
                ("mvw_cat_b".to_string(), RelationKind::MaterializedView),
                ("v_cat_a".to_string(), RelationKind::View),
            ]
        );
    }

    #[pg_test]
    fn test_resolve_missing_relation() {
        assert_eq!(SpiCatalog.resolve(&public("does_not_exist")).unwrap(), None);
    }

    #[pg_test]
    fn test_definition_indexes_comments_grants() {
        Spi::run("CREATE TABLE public.tb_cat2 (id INT PRIMARY KEY)").unwrap();
        Spi::run("CREATE MATERIALIZED VIEW public.mvw_cat2 AS SELECT id FROM public.tb_cat2").unwrap();
        Spi::run("CREATE UNIQUE INDEX mvw_cat2_id ON public.mvw_cat2 (id)").unwrap();
        Spi::run("COMMENT ON MATERIALIZED VIEW public.mvw_cat2 IS 'daily rollup'").unwrap();
        Spi::run("COMMENT ON COLUMN public.mvw_cat2.id IS 'identifier'").unwrap();
        Spi::run("GRANT SELECT ON public.mvw_cat2 TO PUBLIC").unwrap();

        let rel = public("mvw_cat2");
        let definition = SpiCatalog.get_definition(&rel).unwrap();
        assert!(definition.contains("tb_cat2"));

        let indexes = SpiCatalog.list_indexes(&rel).unwrap();
        assert_eq!(indexes.len(), 1);
        assert!(indexes[0].definition.starts_with("CREATE UNIQUE INDEX mvw_cat2_id"));

        let comments = SpiCatalog.list_comments(&rel).unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].column, None);
        assert_eq!(comments[1].column.as_deref(), Some("id"));

        let grants = SpiCatalog.list_grants(&rel).unwrap();
        assert!(grants.iter().any(|g| g.grantee == "PUBLIC" && g.privilege == "SELECT"));

        let owner = SpiCatalog.get_owner(&rel).unwrap();
        let current = Spi::get_one::<String>("SELECT current_user::text").unwrap();
        assert_eq!(owner, current);
    }
}
