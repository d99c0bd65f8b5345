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

//! When a projection mixes aggregated and non-aggregated expressions, extend
//! GROUP BY to cover every non-aggregated one.

use std::collections::HashSet;

use sqlparser::ast::{Expr, GroupByExpr, SetExpr, Statement};

use crate::ast::{self, SelectView};

/// Extend GROUP BY so that, afterwards, every non-aggregated projection
/// expression appears in it; aggregates never do. Existing items keep their
/// order, new items follow in projection order. Aliases are ignored; the
/// comparison is syntactic.
pub fn complete_group_by(stmt: &Statement) -> Option<String> {
    let view = SelectView::from_statement(stmt)?;
    if view.from_relations().is_empty() {
        return None;
    }
    if matches!(view.select.group_by, GroupByExpr::All) {
        return None;
    }

    let mut has_aggregate = false;
    let mut has_wildcard = false;
    let mut non_aggregated: Vec<&Expr> = Vec::new();
    for item in view.projection() {
        if ast::is_wildcard(item) {
            has_wildcard = true;
            continue;
        }
        let Some(expr) = ast::projection_expr(item) else {
            continue;
        };
        if ast::expr_contains_aggregate(expr) {
            has_aggregate = true;
        } else {
            non_aggregated.push(expr);
        }
    }
    if !has_aggregate || non_aggregated.is_empty() {
        return None;
    }
    // A wildcard cannot be enumerated into GROUP BY.
    if has_wildcard {
        return None;
    }

    let existing = view.group_by_exprs();
    let mut seen: HashSet<String> = existing.iter().map(expr_key).collect();
    let mut completed: Vec<Expr> = existing.to_vec();
    for expr in non_aggregated {
        if seen.insert(expr_key(expr)) {
            completed.push(expr.clone());
        }
    }
    if completed.len() == existing.len() {
        return None;
    }

    let Statement::Query(query) = stmt else {
        return None;
    };
    let mut result = query.clone();
    let SetExpr::Select(result_select) = result.body.as_mut() else {
        return None;
    };
    result_select.group_by = GroupByExpr::Expressions(completed);
    Some(result.to_string())
}

fn expr_key(expr: &Expr) -> String {
    expr.to_string().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse_one;

    fn complete(sql: &str) -> Option<String> {
        complete_group_by(&parse_one(sql).unwrap())
    }

    #[test]
    fn test_adds_missing_group_by() {
        let out = complete("SELECT category, SUM(amount) FROM sales WHERE cob_date = 1").unwrap();
        assert_eq!(
            out,
            "SELECT category, SUM(amount) FROM sales WHERE cob_date = 1 GROUP BY category"
        );
    }

    #[test]
    fn test_extends_partial_group_by_in_order() {
        let out = complete(
            "SELECT region, category, SUM(amount) FROM sales GROUP BY region",
        )
        .unwrap();
        assert!(out.ends_with("GROUP BY region, category"), "{out}");
    }

    #[test]
    fn test_every_non_aggregate_covered() {
        let sql = "SELECT a, b, a + b, MAX(c) FROM t GROUP BY b";
        let out = complete(sql).unwrap();
        let stmt = parse_one(&out).unwrap();
        let view = SelectView::from_statement(&stmt).unwrap();
        let group_keys: Vec<String> = view.group_by_exprs().iter().map(expr_key).collect();
        for item in view.projection() {
            let expr = ast::projection_expr(item).unwrap();
            if !ast::expr_contains_aggregate(expr) {
                assert!(group_keys.contains(&expr_key(expr)), "{out}");
            } else {
                assert!(!group_keys.contains(&expr_key(expr)), "{out}");
            }
        }
        // Existing items come first.
        assert_eq!(group_keys[0], "b");
    }

    #[test]
    fn test_no_aggregates_means_no_change() {
        assert_eq!(complete("SELECT a, b FROM t"), None);
    }

    #[test]
    fn test_all_aggregates_means_no_change() {
        assert_eq!(complete("SELECT SUM(a), MAX(b) FROM t"), None);
    }

    #[test]
    fn test_already_complete_is_untouched() {
        assert_eq!(complete("SELECT a, SUM(b) FROM t GROUP BY a"), None);
    }

    #[test]
    fn test_comparison_ignores_aliases_and_case() {
        assert_eq!(complete("SELECT Region AS r, SUM(x) FROM t GROUP BY region"), None);
    }

    #[test]
    fn test_declines_with_wildcard() {
        assert_eq!(complete("SELECT *, SUM(a) FROM t"), None);
    }

    #[test]
    fn test_aggregate_inside_expression_counts() {
        let out = complete("SELECT a, SUM(b) + 1 FROM t").unwrap();
        assert!(out.ends_with("GROUP BY a"), "{out}");
    }
}
