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

//! The metadata synthesizer: session statements answered locally, static
//! SELECT evaluation, and the INFORMATION_SCHEMA → SHOW decision table.
//!
//! Local handlers run in a fixed priority order before anything is
//! dispatched: session-variable SET, general SET, static SELECT, USE.

mod eval;

use std::collections::HashMap;
use std::sync::LazyLock;

pub use eval::{eval_expr, eval_static_select};
use regex::Regex;
use sqlbridge_common::Result;
use sqlparser::ast::{BinaryOperator, Expr, Statement, Value};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::{debug, info};

use crate::ast::{self, SelectView};
use crate::session::{ScalarValue, SessionState};

/// A reply computed without the backend. Empty columns mean a plain OK.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalReply {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl LocalReply {
    pub fn ok() -> Self {
        Self::default()
    }
}

static USE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^\s*use\s+(?:`([^`]+)`|"([^"]+)"|([A-Za-z0-9_$]+))\s*;?\s*$"#).unwrap()
});

/// Try the local handlers in priority order. `None` means the statement is
/// not handled locally and continues through the pipeline.
pub fn try_handle_local(
    text: &str,
    stmt: Option<&Statement>,
    state: &mut SessionState,
) -> Option<Result<LocalReply>> {
    let keyword = crate::classify::leading_keyword(text)?.to_uppercase();
    match keyword.as_str() {
        "SET" => Some(handle_set(text, state)),
        "USE" => handle_use(text, state),
        "SELECT" => {
            let view = SelectView::from_statement(stmt?)?;
            if !view.is_static() {
                return None;
            }
            Some(eval_static_select(view.query, state))
        }
        _ => None,
    }
}

/// `USE <db>`; also invoked for the wire codec's `COM_INIT_DB`.
pub fn handle_use(text: &str, state: &mut SessionState) -> Option<Result<LocalReply>> {
    let captures = USE_RE.captures(crate::classify::statement_body(text))?;
    let database = captures
        .get(1)
        .or_else(|| captures.get(2))
        .or_else(|| captures.get(3))?
        .as_str();
    debug!(database, "USE handled locally");
    state.set_current_database(database);
    Some(Ok(LocalReply::ok()))
}

fn handle_set(text: &str, state: &mut SessionState) -> Result<LocalReply> {
    let body = crate::classify::statement_body(text).trim_end_matches(';').trim_end();
    let rest = body.get(3..).unwrap_or("").trim().to_owned();
    let upper = rest.to_uppercase();

    if let Some(names_args) = strip_keyword(&rest, &upper, "NAMES") {
        apply_set_names(names_args, state);
        return Ok(LocalReply::ok());
    }
    if let Some(charset) = strip_keyword(&rest, &upper, "CHARACTER SET")
        .or_else(|| strip_keyword(&rest, &upper, "CHARSET"))
    {
        state.apply_set_character_set(&unquote(charset.split_whitespace().next().unwrap_or("")));
        return Ok(LocalReply::ok());
    }
    for prefix in ["SESSION TRANSACTION", "GLOBAL TRANSACTION", "TRANSACTION"] {
        if let Some(characteristics) = strip_keyword(&rest, &upper, prefix) {
            apply_set_transaction(characteristics, state);
            return Ok(LocalReply::ok());
        }
    }
    if apply_assignments(&rest, state) {
        return Ok(LocalReply::ok());
    }
    // The general-SET fallback: accept anything else silently so client
    // drivers keep working.
    info!(statement = text, "unrecognized SET accepted as no-op");
    Ok(LocalReply::ok())
}

fn strip_keyword<'a>(rest: &'a str, upper: &str, keyword: &str) -> Option<&'a str> {
    if !upper.starts_with(keyword) {
        return None;
    }
    let after = &rest[keyword.len()..];
    if after.is_empty() || after.starts_with(char::is_whitespace) {
        Some(after.trim_start())
    } else {
        None
    }
}

fn apply_set_names(args: &str, state: &mut SessionState) {
    let mut tokens = args.split_whitespace();
    let Some(charset) = tokens.next() else {
        return;
    };
    let collation = match tokens.next() {
        Some(word) if word.eq_ignore_ascii_case("collate") => tokens.next().map(unquote),
        _ => None,
    };
    state.apply_set_names(&unquote(charset), collation.as_deref());
}

fn apply_set_transaction(characteristics: &str, state: &mut SessionState) {
    for characteristic in characteristics.split(',') {
        let upper = characteristic.trim().to_uppercase();
        if let Some(level) = upper.strip_prefix("ISOLATION LEVEL") {
            let level = level.trim().replace(' ', "-");
            state.apply_isolation_level(&level);
        } else if upper == "READ ONLY" {
            state.apply_read_only(true);
        } else if upper == "READ WRITE" {
            state.apply_read_only(false);
        }
    }
}

/// `SET [SESSION|GLOBAL] name = value [, …]` and `SET @name = value [, …]`.
/// Returns false when the text is not assignment-shaped.
fn apply_assignments(rest: &str, state: &mut SessionState) -> bool {
    let assignments: Vec<&str> = split_top_level(rest);
    if assignments.is_empty() {
        return false;
    }
    let mut parsed = Vec::with_capacity(assignments.len());
    for assignment in &assignments {
        let Some((lhs, rhs)) = assignment.split_once('=') else {
            return false;
        };
        parsed.push((lhs.trim(), rhs.trim()));
    }
    for (lhs, rhs) in parsed {
        let value = parse_set_value(rhs, state);
        if let Some(user_var) = lhs.strip_prefix('@').filter(|l| !l.starts_with('@')) {
            state.set_user_variable(&unquote(user_var), value);
        } else {
            let name = lhs
                .trim_start_matches("@@")
                .trim_start_matches(|c: char| c.is_whitespace());
            let name = strip_scope(name);
            state.set_system_variable(&unquote(name), value);
        }
    }
    true
}

fn strip_scope(name: &str) -> &str {
    for scope in ["SESSION ", "session ", "GLOBAL ", "global ", "LOCAL ", "local "] {
        if let Some(stripped) = name.strip_prefix(scope) {
            return stripped.trim_start();
        }
    }
    name
}

/// Values are full expressions (`SET @x = 1 + 2`); evaluate through the
/// static evaluator and fall back to the raw text when that declines.
fn parse_set_value(raw: &str, state: &SessionState) -> ScalarValue {
    let upper = raw.to_uppercase();
    match upper.as_str() {
        "ON" | "TRUE" => return ScalarValue::Int(1),
        "OFF" | "FALSE" => return ScalarValue::Int(0),
        "NULL" | "DEFAULT" => return ScalarValue::Null,
        _ => {}
    }
    let parsed = Parser::new(&MySqlDialect {})
        .try_with_sql(raw)
        .and_then(|mut p| p.parse_expr());
    if let Ok(expr) = parsed {
        if let Ok(value) = eval_expr(&expr, state) {
            return value;
        }
    }
    ScalarValue::Str(unquote(raw))
}

/// Split on commas outside quotes and parentheses.
fn split_top_level(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0u32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                pieces.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        pieces.push(tail);
    }
    pieces
}

fn unquote(token: &str) -> String {
    let token = token.trim();
    for (open, close) in [('\'', '\''), ('"', '"'), ('`', '`')] {
        if token.len() >= 2 && token.starts_with(open) && token.ends_with(close) {
            return token[1..token.len() - 1].to_owned();
        }
    }
    token.to_owned()
}

/// What to do with an INFORMATION_SCHEMA query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoSchemaPlan {
    /// Translate to a SHOW statement; `column_names` carries the original
    /// projection's names to impose on the result when explicit.
    Show {
        sql: String,
        column_names: Option<Vec<String>>,
    },
    /// Answer with zero columns, zero rows; the backend is never consulted.
    Empty,
}

const SIMPLE_WHERE_WHITELIST: &[&str] = &["table_name", "table_schema", "table_type"];

/// The static decision table keyed by the referenced relation.
pub fn plan_info_schema(stmt: &Statement) -> InfoSchemaPlan {
    let Some(view) = SelectView::from_statement(stmt) else {
        return InfoSchemaPlan::Empty;
    };
    let Some(table) = view.single_table() else {
        return InfoSchemaPlan::Empty;
    };
    let parts = ast::name_parts(table);
    let [schema, relation] = parts.as_slice() else {
        return InfoSchemaPlan::Empty;
    };
    if schema != "information_schema" {
        // performance_schema, mysql, sys: nothing to translate to.
        return InfoSchemaPlan::Empty;
    }

    let sql = match relation.as_str() {
        "schemata" => "SHOW DATABASES".to_owned(),
        "tables" => {
            let Some(predicates) = simple_eq_predicates(view.outer_where()) else {
                return InfoSchemaPlan::Empty;
            };
            match predicates.get("table_schema") {
                Some(schema) => format!("SHOW TABLES FROM `{schema}`"),
                None => "SHOW TABLES".to_owned(),
            }
        }
        "columns" => {
            let Some(predicates) = simple_eq_predicates(view.outer_where()) else {
                return InfoSchemaPlan::Empty;
            };
            let Some(table_name) = predicates.get("table_name") else {
                return InfoSchemaPlan::Empty;
            };
            match predicates.get("table_schema") {
                Some(schema) => format!("SHOW COLUMNS FROM `{schema}`.`{table_name}`"),
                None => format!("SHOW COLUMNS FROM `{table_name}`"),
            }
        }
        _ => return InfoSchemaPlan::Empty,
    };

    let column_names = projection_names(&view);
    InfoSchemaPlan::Show { sql, column_names }
}

/// The original projection's display names, when fully explicit.
fn projection_names(view: &SelectView<'_>) -> Option<Vec<String>> {
    if view.projection().iter().any(ast::is_wildcard) {
        return None;
    }
    Some(
        view.projection()
            .iter()
            .map(ast::projection_display_name)
            .collect(),
    )
}

/// AND-composed equality predicates whose left side is a whitelisted
/// identifier (case- and quote-insensitive). Anything else (OR, LIKE,
/// off-whitelist columns) makes the WHERE non-simple.
fn simple_eq_predicates(selection: Option<&Expr>) -> Option<HashMap<String, String>> {
    let mut predicates = HashMap::new();
    if let Some(selection) = selection {
        collect_eq_predicates(selection, &mut predicates)?;
    }
    Some(predicates)
}

fn collect_eq_predicates(expr: &Expr, out: &mut HashMap<String, String>) -> Option<()> {
    match expr {
        Expr::Nested(inner) => collect_eq_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_eq_predicates(left, out)?;
            collect_eq_predicates(right, out)
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let column = match left.as_ref() {
                Expr::Identifier(ident) => ast::normalize_ident(ident),
                Expr::CompoundIdentifier(idents) => ast::normalize_ident(idents.last()?),
                _ => return None,
            };
            if !SIMPLE_WHERE_WHITELIST.contains(&column.as_str()) {
                return None;
            }
            let value = match right.as_ref() {
                Expr::Value(Value::SingleQuotedString(s) | Value::DoubleQuotedString(s)) => {
                    s.clone()
                }
                Expr::Value(Value::Number(n, _)) => n.clone(),
                _ => return None,
            };
            out.insert(column, value);
            Some(())
        }
        _ => None,
    }
}
