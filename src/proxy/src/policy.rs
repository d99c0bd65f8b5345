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

//! Policy gates, run after rewrites on the final text/AST. Metadata, static
//! and info-schema statements never reach these.

use std::sync::LazyLock;

use regex::Regex;
use sqlbridge_common::config::{Feature, ProxyConfig};
use sqlbridge_common::{ProxyError, Result};
use sqlparser::ast::Statement;

use crate::ast::{self, SelectView};
use crate::classify::{StatementKind, WRITE_VERBS};

static WRITE_NET_RE: LazyLock<Regex> = LazyLock::new(|| {
    let verbs = WRITE_VERBS.join("|");
    Regex::new(&format!(r"(?i)\b(?:{verbs})\b")).unwrap()
});

/// Run every gate on the statement's final form.
pub fn enforce(
    text: &str,
    stmt: Option<&Statement>,
    kind: StatementKind,
    config: &ProxyConfig,
) -> Result<()> {
    if kind.bypasses_gates() {
        return Ok(());
    }
    block_writes(text, kind, config)?;
    reject_unsupported(stmt, config)?;
    require_date_predicate(stmt, kind, config)?;
    Ok(())
}

/// Statement-kind check plus a word-boundary keyword net over the raw text.
fn block_writes(text: &str, kind: StatementKind, config: &ProxyConfig) -> Result<()> {
    if !config.security.block_writes {
        return Ok(());
    }
    if kind == StatementKind::WriteDml {
        let verb = crate::classify::leading_keyword(text)
            .unwrap_or("write")
            .to_uppercase();
        return Err(ProxyError::WriteBlocked { verb });
    }
    if let Some(found) = WRITE_NET_RE.find(text) {
        return Err(ProxyError::WriteBlocked {
            verb: found.as_str().to_uppercase(),
        });
    }
    Ok(())
}

fn reject_unsupported(stmt: Option<&Statement>, config: &ProxyConfig) -> Result<()> {
    let Some(stmt) = stmt else {
        return Ok(());
    };
    let capabilities = &config.capabilities;
    if capabilities.feature_unsupported(Feature::Joins) && ast::has_join(stmt) {
        return Err(ProxyError::unsupported_with_hint(
            "JOIN",
            "restructure the query against a single table",
        ));
    }
    if capabilities.feature_unsupported(Feature::Unions) && ast::has_union(stmt) {
        return Err(ProxyError::unsupported("UNION"));
    }
    if capabilities.feature_unsupported(Feature::WindowFunctions) && ast::has_window(stmt) {
        return Err(ProxyError::unsupported("window functions (OVER)"));
    }
    if capabilities.feature_unsupported(Feature::CaseStatements) && ast::has_case(stmt) {
        return Err(ProxyError::unsupported("CASE expressions"));
    }

    let denied = config.denied_functions();
    for function in ast::functions_used(stmt) {
        if denied.contains(&function) {
            return if function == "COUNT" {
                Err(ProxyError::unsupported_with_hint(
                    "COUNT",
                    "use SUM(1) instead",
                ))
            } else {
                Err(ProxyError::unsupported(format!("the {function} function")))
            };
        }
    }
    Ok(())
}

/// The outermost SELECT's WHERE must mention one of the configured date
/// columns directly; a mention only inside a subquery does not count.
fn require_date_predicate(
    stmt: Option<&Statement>,
    kind: StatementKind,
    config: &ProxyConfig,
) -> Result<()> {
    if !config.business_rules.require_cob_date || kind != StatementKind::DataSelect {
        return Ok(());
    }
    let Some(stmt) = stmt else {
        return Ok(());
    };
    let Some(view) = SelectView::outermost_select(stmt) else {
        return Ok(());
    };
    let columns = &config.business_rules.date_columns;
    let satisfied = view.outer_where().is_some_and(|selection| {
        columns
            .iter()
            .any(|column| ast::expr_mentions_column(selection, column))
    });
    if satisfied {
        Ok(())
    } else {
        Err(ProxyError::MissingDatePredicate {
            columns: columns.clone(),
        })
    }
}
