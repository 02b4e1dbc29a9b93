//! Identifier and literal quoting for generated DDL
//!
//! Every name that reaches a generated statement goes through [`quote_ident`]
//! and every free-text value through [`quote_literal`]; nothing is spliced in raw.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DepsError, DepsResult};

/// Identifiers PostgreSQL folds to themselves and accepts without quotes
static BARE_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z_][a-z0-9_$]*$").expect("identifier pattern is valid")
});

/// Reserved keywords that must be quoted even when lower-case
const RESERVED: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric",
    "both", "case", "cast", "check", "collate", "column", "constraint", "create",
    "current_catalog", "current_date", "current_role", "current_time",
    "current_timestamp", "current_user", "default", "deferrable", "desc", "distinct",
    "do", "else", "end", "except", "false", "fetch", "for", "foreign", "from", "grant",
    "group", "having", "in", "initially", "intersect", "into", "lateral", "leading",
    "limit", "localtime", "localtimestamp", "not", "null", "offset", "on", "only", "or",
    "order", "placing", "primary", "references", "returning", "select", "session_user",
    "some", "symmetric", "system_user", "table", "then", "to", "trailing", "true",
    "union", "unique", "user", "using", "variadic", "when", "where", "window", "with",
];

/// Quote an identifier the way `quote_ident()` would
pub fn quote_ident(ident: &str) -> String {
    if BARE_IDENTIFIER.is_match(ident) && !RESERVED.contains(&ident) {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

/// Quote a string literal the way `quote_literal()` would
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Schema-qualified relation name, stored unquoted
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self { schema: schema.into(), name: name.into() }
    }

    /// Parse SQL-style input (`name`, `schema.name`, `"Mixed"."Case"`)
    ///
    /// Unquoted parts fold to lower case; an unqualified name lands in
    /// `default_schema`.
    pub fn parse(input: &str, default_schema: &str) -> DepsResult<Self> {
        let invalid = |reason: &str| DepsError::InvalidInput {
            parameter: "relation".to_string(),
            value: input.to_string(),
            reason: reason.to_string(),
        };

        let mut parts: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut quoted_part = false;
        let mut chars = input.trim().chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '"' => {
                    if !current.is_empty() || quoted_part {
                        return Err(invalid("unexpected quote inside identifier"));
                    }
                    quoted_part = true;
                    loop {
                        match chars.next() {
                            Some('"') if chars.peek() == Some(&'"') => {
                                chars.next();
                                current.push('"');
                            }
                            Some('"') => break,
                            Some(other) => current.push(other),
                            None => return Err(invalid("unterminated quoted identifier")),
                        }
                    }
                }
                '.' => {
                    if current.is_empty() {
                        return Err(invalid("empty identifier part"));
                    }
                    parts.push(std::mem::take(&mut current));
                    quoted_part = false;
                }
                '\0' => return Err(invalid("identifier contains NUL")),
                other => {
                    if quoted_part {
                        return Err(invalid("unexpected character after quoted identifier"));
                    }
                    current.extend(other.to_lowercase());
                }
            }
        }

        if current.is_empty() {
            return Err(invalid("empty identifier part"));
        }
        parts.push(current);

        match parts.len() {
            1 => Ok(Self::new(default_schema, parts.remove(0))),
            2 => {
                let name = parts.remove(1);
                Ok(Self::new(parts.remove(0), name))
            }
            _ => Err(invalid("expected at most schema.name")),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_leaves_plain_names_alone() {
        assert_eq!(quote_ident("mvw_sales"), "mvw_sales");
        assert_eq!(quote_ident("_v2$x"), "_v2$x");
    }

    #[test]
    fn test_quote_ident_quotes_when_required() {
        assert_eq!(quote_ident("Sales"), "\"Sales\"");
        assert_eq!(quote_ident("order"), "\"order\"");
        assert_eq!(quote_ident("2fast"), "\"2fast\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_literal_doubles_quotes() {
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_parse_unqualified_uses_default_schema() {
        let name = QualifiedName::parse("MVW_Sales", "reporting").unwrap();
        assert_eq!(name, QualifiedName::new("reporting", "mvw_sales"));
    }

    #[test]
    fn test_parse_quoted_parts_keep_case_and_dots() {
        let name = QualifiedName::parse("\"Ops\".\"a.b\"", "public").unwrap();
        assert_eq!(name, QualifiedName::new("Ops", "a.b"));
        assert_eq!(name.to_string(), "\"Ops\".\"a.b\"");
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        assert!(QualifiedName::parse("", "public").is_err());
        assert!(QualifiedName::parse("a..b", "public").is_err());
        assert!(QualifiedName::parse("a.b.c", "public").is_err());
        assert!(QualifiedName::parse("\"open", "public").is_err());
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let original = QualifiedName::new("public", "Weird Name");
        let reparsed = QualifiedName::parse(&original.to_string(), "other").unwrap();
        assert_eq!(reparsed, original);
    }
}
