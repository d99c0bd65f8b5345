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

//! Strip the wrappers Tableau puts around schema-discovery and custom-SQL
//! queries.

use std::sync::LazyLock;

use regex::Regex;
use sqlparser::ast::{Expr, Ident, SelectItem, SetExpr, Statement};

use super::flatten::AliasMap;
use crate::ast::{self, SelectView};

static PAREN_FORM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*\(\s*(select\b.*)\)\s*(?:limit\s+(\d+))?\s*;?\s*$").unwrap()
});

/// `( <select> ) [LIMIT n]` → `<select> [LIMIT n]`.
///
/// The parser preserves outer parentheses on round-trip and the backend
/// rejects the parenthesized form, so this runs on the text itself. Declines
/// when the parenthesis grouping cannot be confirmed.
pub fn paren_unwrap(sql: &str) -> Option<String> {
    let captures = PAREN_FORM_RE.captures(sql)?;
    let inner = captures.get(1).unwrap().as_str().trim();
    if !balanced_parens(inner) {
        return None;
    }
    let unwrapped = match captures.get(2) {
        Some(limit) => format!("{} LIMIT {}", inner, limit.as_str()),
        None => inner.to_owned(),
    };
    Some(unwrapped)
}

fn balanced_parens(s: &str) -> bool {
    let mut depth: i64 = 0;
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Tableau custom-SQL unwrap:
/// `SELECT <*-or-resolvable-projection> FROM ( <inner> ) alias [LIMIT n]`
/// becomes the inner SELECT, with the outer LIMIT carried over and the outer
/// projection preserved when it is not a bare `*`.
///
/// Applies only when the outer WHERE/GROUP BY/HAVING/ORDER BY are absent;
/// outer filters are the flattener's business.
pub fn wrapper_unwrap(stmt: &Statement) -> Option<String> {
    let view = SelectView::from_statement(stmt)?;
    if view.query.with.is_some() {
        return None;
    }
    let (inner, alias) = view.single_derived()?;
    if view.outer_where().is_some()
        || view.has_group_by()
        || view.having().is_some()
        || !view.order_by().is_empty()
        || view.select.distinct.is_some()
    {
        return None;
    }
    let outer_limit = view.limit().cloned();

    let projection = view.projection();
    if projection.len() == 1 && matches!(projection[0], SelectItem::Wildcard(_)) {
        let mut result = inner.clone();
        if outer_limit.is_some() {
            result.limit = outer_limit;
        }
        return Some(result.to_string());
    }

    // Not a bare `*`: keep the outer projection, resolving every reference to
    // the inner SELECT's columns. Any unresolved name declines the unwrap.
    let inner_view = SelectView::from_query(inner)?;
    let map = AliasMap::build(&inner_view)?;
    let alias_name = alias.map(|a| a.name.value.to_lowercase());

    let mut items = Vec::with_capacity(projection.len());
    for item in projection {
        let expr = ast::projection_expr(item)?;
        let resolved = map.resolve_expr(expr, alias_name.as_deref())?;
        items.push(aliased_item(item, resolved));
    }

    let mut result = inner.clone();
    let SetExpr::Select(result_select) = result.body.as_mut() else {
        return None;
    };
    result_select.projection = items;
    if outer_limit.is_some() {
        result.limit = outer_limit;
    }
    Some(result.to_string())
}

/// Keep the statement's output column name stable across substitution: reuse
/// the outer alias, or alias the substituted expression with the referenced
/// column name when the substitution changed its shape.
pub(super) fn aliased_item(original: &SelectItem, resolved: Expr) -> SelectItem {
    if let SelectItem::ExprWithAlias { alias, .. } = original {
        return SelectItem::ExprWithAlias {
            expr: resolved,
            alias: alias.clone(),
        };
    }
    match ast::projection_name(original) {
        Some(name) if !expr_is_ident_named(&resolved, &name) => SelectItem::ExprWithAlias {
            expr: resolved,
            alias: Ident::new(name),
        },
        _ => SelectItem::UnnamedExpr(resolved),
    }
}

fn expr_is_ident_named(expr: &Expr, name: &str) -> bool {
    match expr {
        Expr::Identifier(ident) => ident.value.eq_ignore_ascii_case(name),
        Expr::CompoundIdentifier(idents) => idents
            .last()
            .is_some_and(|i| i.value.eq_ignore_ascii_case(name)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse_one;

    #[test]
    fn test_paren_unwrap_with_limit() {
        let out =
            paren_unwrap("(SELECT col1, col2 FROM my_table WHERE date_index = -1) LIMIT 0")
                .unwrap();
        assert_eq!(
            out,
            "SELECT col1, col2 FROM my_table WHERE date_index = -1 LIMIT 0"
        );
    }

    #[test]
    fn test_paren_unwrap_multiline() {
        let out = paren_unwrap("  (\n  SELECT a\n  FROM t\n) LIMIT 10").unwrap();
        assert_eq!(out, "SELECT a\n  FROM t LIMIT 10");
    }

    #[test]
    fn test_paren_unwrap_nested_subquery_stays_balanced() {
        let out = paren_unwrap("(SELECT a FROM (SELECT b FROM t) x) LIMIT 5").unwrap();
        assert_eq!(out, "SELECT a FROM (SELECT b FROM t) x LIMIT 5");
    }

    #[test]
    fn test_paren_unwrap_declines_plain_select() {
        assert_eq!(paren_unwrap("SELECT a FROM t"), None);
    }

    #[test]
    fn test_wrapper_unwrap_star() {
        let stmt =
            parse_one("SELECT * FROM (SELECT category, SUM(amount) FROM sales WHERE cob_date='2024-01-15') sub")
                .unwrap();
        let out = wrapper_unwrap(&stmt).unwrap();
        assert_eq!(
            out,
            "SELECT category, SUM(amount) FROM sales WHERE cob_date = '2024-01-15'"
        );
    }

    #[test]
    fn test_wrapper_unwrap_carries_limit() {
        let stmt = parse_one("SELECT * FROM (SELECT a FROM t) sub LIMIT 7").unwrap();
        assert_eq!(wrapper_unwrap(&stmt).unwrap(), "SELECT a FROM t LIMIT 7");
    }

    #[test]
    fn test_wrapper_unwrap_aliased_projection() {
        let stmt = parse_one(
            "SELECT sub.category, sub.total FROM \
             (SELECT category, SUM(amount) AS total FROM sales WHERE cob_date = 1) sub",
        )
        .unwrap();
        let out = wrapper_unwrap(&stmt).unwrap();
        assert_eq!(
            out,
            "SELECT category, SUM(amount) AS total FROM sales WHERE cob_date = 1"
        );
    }

    #[test]
    fn test_wrapper_unwrap_declines_on_outer_where() {
        let stmt =
            parse_one("SELECT * FROM (SELECT a FROM t) sub WHERE a = 1").unwrap();
        assert_eq!(wrapper_unwrap(&stmt), None);
    }

    #[test]
    fn test_wrapper_unwrap_declines_on_unresolved_reference() {
        let stmt =
            parse_one("SELECT sub.missing FROM (SELECT a FROM t) sub").unwrap();
        assert_eq!(wrapper_unwrap(&stmt), None);
    }

    #[test]
    fn test_wrapper_unwrap_declines_on_foreign_qualifier() {
        let stmt = parse_one("SELECT other.a FROM (SELECT a FROM t) sub").unwrap();
        assert_eq!(wrapper_unwrap(&stmt), None);
    }
}
