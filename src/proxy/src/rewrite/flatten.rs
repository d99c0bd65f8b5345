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

//! Collapse `SELECT … FROM (SELECT …) alias WHERE …` into a single SELECT
//! with merged WHERE and inherited GROUP BY.

use std::collections::HashMap;

use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, GroupByExpr, Ident, OrderByExpr,
    SelectItem, SetExpr, Statement,
};

use super::unwrap::aliased_item;
use crate::ast::{self, SelectView};

/// Resolution table from an inner SELECT's output names to their defining
/// expressions. `passthrough` stands for an inner `SELECT *`, where every
/// name maps to itself.
pub(crate) struct AliasMap {
    passthrough: bool,
    map: HashMap<String, Expr>,
}

impl AliasMap {
    /// Build from the inner projection. `None` when the projection cannot be
    /// resolved by name (qualified wildcards, `*` mixed with expressions).
    pub(crate) fn build(inner: &SelectView<'_>) -> Option<Self> {
        let items = inner.projection();
        if items.len() == 1 && matches!(items[0], SelectItem::Wildcard(_)) {
            return Some(Self {
                passthrough: true,
                map: HashMap::new(),
            });
        }
        let mut map = HashMap::new();
        for item in items {
            match item {
                SelectItem::ExprWithAlias { expr, alias } => {
                    map.insert(alias.value.to_lowercase(), expr.clone());
                }
                SelectItem::UnnamedExpr(expr @ Expr::Identifier(ident)) => {
                    map.insert(ident.value.to_lowercase(), expr.clone());
                }
                SelectItem::UnnamedExpr(expr @ Expr::CompoundIdentifier(idents)) => {
                    let last = idents.last()?;
                    map.insert(last.value.to_lowercase(), expr.clone());
                }
                // Unaliased complex expressions cannot be referenced by name;
                // leave them out and let unresolved references decline.
                SelectItem::UnnamedExpr(_) => {}
                _ => return None,
            }
        }
        Some(Self {
            passthrough: false,
            map,
        })
    }

    fn lookup(&self, name: &str) -> Option<Expr> {
        if self.passthrough {
            return Some(Expr::Identifier(Ident::new(name)));
        }
        self.map.get(&name.to_lowercase()).cloned()
    }

    /// Rewrite `expr`, replacing every reference to the derived table with
    /// the inner defining expression. `None` means a name did not resolve
    /// and the caller must decline.
    pub(crate) fn resolve_expr(&self, expr: &Expr, outer_alias: Option<&str>) -> Option<Expr> {
        let resolved = match expr {
            Expr::Identifier(ident) => self.lookup(&ident.value)?,
            Expr::CompoundIdentifier(idents) => match idents.as_slice() {
                [qualifier, column]
                    if outer_alias.is_some_and(|a| qualifier.value.eq_ignore_ascii_case(a)) =>
                {
                    self.lookup(&column.value)?
                }
                _ => return None,
            },
            Expr::Value(_) | Expr::TypedString { .. } | Expr::Interval { .. } => expr.clone(),
            Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
                left: Box::new(self.resolve_expr(left, outer_alias)?),
                op: op.clone(),
                right: Box::new(self.resolve_expr(right, outer_alias)?),
            },
            Expr::UnaryOp { op, expr } => Expr::UnaryOp {
                op: op.clone(),
                expr: Box::new(self.resolve_expr(expr, outer_alias)?),
            },
            Expr::Nested(inner) => Expr::Nested(Box::new(self.resolve_expr(inner, outer_alias)?)),
            Expr::IsNull(inner) => Expr::IsNull(Box::new(self.resolve_expr(inner, outer_alias)?)),
            Expr::IsNotNull(inner) => {
                Expr::IsNotNull(Box::new(self.resolve_expr(inner, outer_alias)?))
            }
            Expr::Between {
                expr,
                negated,
                low,
                high,
            } => Expr::Between {
                expr: Box::new(self.resolve_expr(expr, outer_alias)?),
                negated: *negated,
                low: Box::new(self.resolve_expr(low, outer_alias)?),
                high: Box::new(self.resolve_expr(high, outer_alias)?),
            },
            Expr::Like {
                negated,
                expr,
                pattern,
                escape_char,
            } => Expr::Like {
                negated: *negated,
                expr: Box::new(self.resolve_expr(expr, outer_alias)?),
                pattern: Box::new(self.resolve_expr(pattern, outer_alias)?),
                escape_char: escape_char.clone(),
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => Expr::InList {
                expr: Box::new(self.resolve_expr(expr, outer_alias)?),
                list: list
                    .iter()
                    .map(|e| self.resolve_expr(e, outer_alias))
                    .collect::<Option<Vec<_>>>()?,
                negated: *negated,
            },
            Expr::Cast {
                expr,
                data_type,
                format,
            } => Expr::Cast {
                expr: Box::new(self.resolve_expr(expr, outer_alias)?),
                data_type: data_type.clone(),
                format: format.clone(),
            },
            Expr::Function(function) => {
                if function.over.is_some() {
                    return None;
                }
                let mut resolved_fn = function.clone();
                resolved_fn.args = function
                    .args
                    .iter()
                    .map(|arg| match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => self
                            .resolve_expr(e, outer_alias)
                            .map(|r| FunctionArg::Unnamed(FunctionArgExpr::Expr(r))),
                        FunctionArg::Named {
                            name,
                            arg: FunctionArgExpr::Expr(e),
                        } => self.resolve_expr(e, outer_alias).map(|r| FunctionArg::Named {
                            name: name.clone(),
                            arg: FunctionArgExpr::Expr(r),
                        }),
                        other => Some(other.clone()),
                    })
                    .collect::<Option<Vec<_>>>()?;
                Expr::Function(resolved_fn)
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => Expr::Case {
                operand: match operand {
                    Some(o) => Some(Box::new(self.resolve_expr(o, outer_alias)?)),
                    None => None,
                },
                conditions: conditions
                    .iter()
                    .map(|c| self.resolve_expr(c, outer_alias))
                    .collect::<Option<Vec<_>>>()?,
                results: results
                    .iter()
                    .map(|r| self.resolve_expr(r, outer_alias))
                    .collect::<Option<Vec<_>>>()?,
                else_result: match else_result {
                    Some(e) => Some(Box::new(self.resolve_expr(e, outer_alias)?)),
                    None => None,
                },
            },
            // Subqueries and anything exotic: decline rather than guess.
            _ => return None,
        };
        Some(resolved)
    }
}

/// Merge two WHERE clauses with AND, parenthesizing OR-composed sides so the
/// merged predicate keeps its meaning. No reordering, no deduplication.
fn and_merge(inner_where: Expr, outer_where: Expr) -> Expr {
    fn wrap(expr: Expr) -> Expr {
        if matches!(
            expr,
            Expr::BinaryOp {
                op: BinaryOperator::Or,
                ..
            }
        ) {
            Expr::Nested(Box::new(expr))
        } else {
            expr
        }
    }
    Expr::BinaryOp {
        left: Box::new(wrap(inner_where)),
        op: BinaryOperator::And,
        right: Box::new(wrap(outer_where)),
    }
}

/// One flattening step:
/// `SELECT p… FROM (SELECT q… FROM T WHERE Wi [GROUP BY Gi]) a WHERE Wo
/// [GROUP BY Go]` → `SELECT p′… FROM T WHERE Wi AND Wo′ [GROUP BY G′]`.
///
/// Declines (returns `None`, never errors) when a name does not resolve,
/// when HAVING is present on either side, or when the inner query carries
/// DISTINCT/LIMIT/OFFSET/ORDER BY whose meaning a merge would change.
pub fn flatten_subquery(stmt: &Statement) -> Option<String> {
    let view = SelectView::from_statement(stmt)?;
    if view.query.with.is_some() {
        return None;
    }
    let (inner, alias) = view.single_derived()?;
    if view.outer_where().is_none() && !view.has_group_by() {
        // A pure wrapper; the unwrapper owns that shape.
        return None;
    }
    if view.having().is_some() || view.select.distinct.is_some() {
        return None;
    }
    let inner_view = SelectView::from_query(inner)?;
    if inner_view.having().is_some()
        || inner_view.select.distinct.is_some()
        || inner.limit.is_some()
        || inner.offset.is_some()
        || !inner_view.order_by().is_empty()
    {
        return None;
    }

    let map = AliasMap::build(&inner_view)?;
    let alias_name = alias.map(|a| a.name.value.to_lowercase());
    let outer_alias = alias_name.as_deref();

    // p′
    let mut projection: Vec<SelectItem> = Vec::with_capacity(view.projection().len());
    if view.projection().len() == 1 && matches!(view.projection()[0], SelectItem::Wildcard(_)) {
        projection = inner_view.projection().to_vec();
    } else {
        for item in view.projection() {
            let expr = ast::projection_expr(item)?;
            let resolved = map.resolve_expr(expr, outer_alias)?;
            projection.push(aliased_item(item, resolved));
        }
    }

    // Wo': an aggregate surfacing in WHERE would be malformed; decline.
    let outer_where = match view.outer_where() {
        Some(w) => Some(map.resolve_expr(w, outer_alias)?),
        None => None,
    };
    if outer_where.as_ref().is_some_and(ast::expr_contains_aggregate) {
        return None;
    }

    // G': outer GROUP BY wins, else the inner one is inherited.
    let outer_group_by = view
        .group_by_exprs()
        .iter()
        .map(|g| map.resolve_expr(g, outer_alias))
        .collect::<Option<Vec<_>>>()?;

    let order_by = view
        .order_by()
        .iter()
        .map(|o| resolve_order_by(&map, o, outer_alias))
        .collect::<Option<Vec<_>>>()?;

    let mut result = inner.clone();
    let SetExpr::Select(result_select) = result.body.as_mut() else {
        return None;
    };
    result_select.projection = projection;
    result_select.selection = match (result_select.selection.take(), outer_where) {
        (Some(wi), Some(wo)) => Some(and_merge(wi, wo)),
        (wi, wo) => wi.or(wo),
    };
    if !outer_group_by.is_empty() {
        result_select.group_by = GroupByExpr::Expressions(outer_group_by);
    }
    if !order_by.is_empty() {
        result.order_by = order_by;
    }
    if view.limit().is_some() {
        result.limit = view.limit().cloned();
    }
    Some(result.to_string())
}

fn resolve_order_by(
    map: &AliasMap,
    order: &OrderByExpr,
    outer_alias: Option<&str>,
) -> Option<OrderByExpr> {
    let expr = map.resolve_expr(&order.expr, outer_alias)?;
    let mut resolved = order.clone();
    resolved.expr = expr;
    Some(resolved)
}
