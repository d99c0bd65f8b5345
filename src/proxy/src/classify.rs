// Copyright 2025 SqlBridge Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Statement classification: decide what family a statement belongs to before
//! any rewriting. Classification never mutates the AST.

use std::sync::LazyLock;

use regex::Regex;
use sqlparser::ast::Statement;

use crate::ast::{self, SelectView};

/// System schemas whose relations are never forwarded as-is.
const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

/// Leading verbs that make a statement write DML / DDL.
pub const WRITE_VERBS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "REPLACE", "TRUNCATE", "DROP", "CREATE", "ALTER", "GRANT",
    "REVOKE", "RENAME",
];

static PAREN_SELECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*\(\s*select\b").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Show,
    Describe,
    Use,
    Set,
    Kill,
    Begin,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// SHOW / DESCRIBE / USE / SET and friends.
    Meta(MetaKind),
    /// SELECT with no FROM/WHERE/GROUP BY/HAVING/ORDER BY (LIMIT allowed).
    StaticSelect,
    /// References a system-schema relation.
    InfoSchemaSelect,
    /// Single outer SELECT whose FROM is one parenthesized SELECT.
    WrappedSelect,
    /// The whole statement is a parenthesized SELECT, optionally followed by
    /// LIMIT.
    ParenSelect,
    /// Every other SELECT.
    DataSelect,
    WriteDml,
    Other,
}

impl StatementKind {
    /// Metadata, static and info-schema statements bypass every policy gate.
    pub fn bypasses_gates(&self) -> bool {
        matches!(
            self,
            Self::Meta(_) | Self::StaticSelect | Self::InfoSchemaSelect
        )
    }
}

/// The statement with leading whitespace and block comments stripped.
pub fn statement_body(text: &str) -> &str {
    let mut rest = text.trim_start();
    while let Some(stripped) = rest.strip_prefix("/*") {
        match stripped.find("*/") {
            Some(end) => rest = stripped[end + 2..].trim_start(),
            None => return "",
        }
    }
    rest
}

/// The first keyword of the statement.
pub fn leading_keyword(text: &str) -> Option<&str> {
    let rest = statement_body(text);
    let end = rest
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

fn meta_kind(keyword: &str) -> Option<MetaKind> {
    let kind = match keyword.to_ascii_uppercase().as_str() {
        "SHOW" => MetaKind::Show,
        "DESCRIBE" | "DESC" => MetaKind::Describe,
        "USE" => MetaKind::Use,
        "SET" => MetaKind::Set,
        "KILL" => MetaKind::Kill,
        "BEGIN" | "START" => MetaKind::Begin,
        "COMMIT" => MetaKind::Commit,
        "ROLLBACK" => MetaKind::Rollback,
        _ => return None,
    };
    Some(kind)
}

fn is_write_verb(keyword: &str) -> bool {
    WRITE_VERBS
        .iter()
        .any(|verb| keyword.eq_ignore_ascii_case(verb))
}

/// Classify a statement. First match wins:
///
/// 1. leading meta keyword;
/// 2. `( SELECT …`, the parenthesized-SELECT wrapper;
/// 3. static SELECT;
/// 4. system-schema reference;
/// 5. write verb (or a parsed non-query statement);
/// 6. wrapped SELECT, then everything else that is a SELECT.
pub fn classify(text: &str, stmt: Option<&Statement>) -> StatementKind {
    if let Some(kind) = leading_keyword(text).and_then(meta_kind) {
        return StatementKind::Meta(kind);
    }
    if PAREN_SELECT_RE.is_match(text) {
        return StatementKind::ParenSelect;
    }
    if let Some(keyword) = leading_keyword(text) {
        if is_write_verb(keyword) {
            return StatementKind::WriteDml;
        }
    }
    let Some(stmt) = stmt else {
        return StatementKind::Other;
    };
    let Some(view) = SelectView::from_statement(stmt) else {
        return match stmt {
            Statement::Query(_) => StatementKind::DataSelect,
            _ => StatementKind::Other,
        };
    };
    if view.is_static() {
        return StatementKind::StaticSelect;
    }
    if ast::tables_referenced(stmt).iter().any(|parts| {
        parts.len() >= 2 && SYSTEM_SCHEMAS.contains(&parts[0].as_str())
    }) {
        return StatementKind::InfoSchemaSelect;
    }
    if view.single_derived().is_some() {
        return StatementKind::WrappedSelect;
    }
    StatementKind::DataSelect
}
