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

//! Thin, typed view over the SQL parser. Everything else in the pipeline goes
//! through this module instead of touching parser types directly.
//!
//! Identifier comparisons are case-insensitive and quote-agnostic: bare,
//! back-tick and double-quote forms compare equal. Re-serialization is the
//! AST's `Display` and is semantically (not textually) equivalent to the
//! input.

use itertools::Itertools;
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, GroupByExpr, Ident, ObjectName, OrderByExpr, Query,
    Select, SelectItem, SetExpr, Statement, TableAlias, TableFactor, TableWithJoins,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::{Parser, ParserError};

/// Aggregate call names; a call with an OVER clause is a window function, not
/// an aggregate.
const AGGREGATE_FUNCTIONS: &[&str] = &[
    "SUM",
    "AVG",
    "MIN",
    "MAX",
    "COUNT",
    "GROUP_CONCAT",
    "STDDEV",
    "STDDEV_POP",
    "STDDEV_SAMP",
    "VARIANCE",
    "VAR_POP",
    "VAR_SAMP",
    "BIT_AND",
    "BIT_OR",
    "BIT_XOR",
    "JSON_ARRAYAGG",
    "JSON_OBJECTAGG",
];

/// Parse exactly one statement.
pub fn parse_one(sql: &str) -> Result<Statement, ParserError> {
    Parser::parse_sql(&MySqlDialect {}, sql)?
        .into_iter()
        .exactly_one()
        .map_err(|_| ParserError::ParserError("expected exactly one statement".to_owned()))
}

pub fn normalize_ident(ident: &Ident) -> String {
    ident.value.to_lowercase()
}

pub fn ident_matches(ident: &Ident, target: &str) -> bool {
    ident.value.eq_ignore_ascii_case(target)
}

pub fn name_parts(name: &ObjectName) -> Vec<String> {
    name.0.iter().map(normalize_ident).collect()
}

/// A SELECT together with its enclosing query (LIMIT and ORDER BY live on the
/// query, everything else on the SELECT).
#[derive(Clone, Copy)]
pub struct SelectView<'a> {
    pub query: &'a Query,
    pub select: &'a Select,
}

impl<'a> SelectView<'a> {
    pub fn from_statement(stmt: &'a Statement) -> Option<Self> {
        match stmt {
            Statement::Query(query) => Self::from_query(query),
            _ => None,
        }
    }

    pub fn from_query(query: &'a Query) -> Option<Self> {
        match query.body.as_ref() {
            SetExpr::Select(select) => Some(Self { query, select }),
            _ => None,
        }
    }

    /// Like [`Self::from_statement`], but drills through parenthesized query
    /// bodies (`(SELECT …) LIMIT n` round-trips as a nested query).
    pub fn outermost_select(stmt: &'a Statement) -> Option<Self> {
        let Statement::Query(query) = stmt else {
            return None;
        };
        let mut query = query.as_ref();
        loop {
            match query.body.as_ref() {
                SetExpr::Select(select) => return Some(Self { query, select }),
                SetExpr::Query(inner) => query = inner,
                _ => return None,
            }
        }
    }

    pub fn projection(&self) -> &'a [SelectItem] {
        &self.select.projection
    }

    pub fn from_relations(&self) -> &'a [TableWithJoins] {
        &self.select.from
    }

    /// The single plain table in FROM, if that is the whole relation list.
    pub fn single_table(&self) -> Option<&'a ObjectName> {
        match self.select.from.as_slice() {
            [TableWithJoins { relation: TableFactor::Table { name, .. }, joins }]
                if joins.is_empty() =>
            {
                Some(name)
            }
            _ => None,
        }
    }

    /// The single parenthesized SELECT in FROM, if that is the whole relation
    /// list, the Tableau custom-SQL shape.
    pub fn single_derived(&self) -> Option<(&'a Query, Option<&'a TableAlias>)> {
        match self.select.from.as_slice() {
            [TableWithJoins { relation: TableFactor::Derived { subquery, alias, .. }, joins }]
                if joins.is_empty() =>
            {
                Some((subquery, alias.as_ref()))
            }
            _ => None,
        }
    }

    pub fn outer_where(&self) -> Option<&'a Expr> {
        self.select.selection.as_ref()
    }

    pub fn group_by_exprs(&self) -> &'a [Expr] {
        match &self.select.group_by {
            GroupByExpr::Expressions(exprs) => exprs,
            GroupByExpr::All => &[],
        }
    }

    pub fn has_group_by(&self) -> bool {
        !matches!(&self.select.group_by, GroupByExpr::Expressions(e) if e.is_empty())
    }

    pub fn having(&self) -> Option<&'a Expr> {
        self.select.having.as_ref()
    }

    pub fn order_by(&self) -> &'a [OrderByExpr] {
        &self.query.order_by
    }

    pub fn limit(&self) -> Option<&'a Expr> {
        self.query.limit.as_ref()
    }

    /// A SELECT with no FROM/WHERE/GROUP BY/HAVING/ORDER BY; LIMIT may be
    /// present.
    pub fn is_static(&self) -> bool {
        self.query.with.is_none()
            && self.select.from.is_empty()
            && self.select.selection.is_none()
            && !self.has_group_by()
            && self.select.having.is_none()
            && self.query.order_by.is_empty()
    }
}

/// The output name of a projection item: its alias, or the (last) identifier
/// for a bare column reference.
pub fn projection_name(item: &SelectItem) -> Option<String> {
    match item {
        SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.clone()),
        SelectItem::UnnamedExpr(Expr::Identifier(ident)) => Some(ident.value.clone()),
        SelectItem::UnnamedExpr(Expr::CompoundIdentifier(idents)) => {
            idents.last().map(|i| i.value.clone())
        }
        _ => None,
    }
}

/// The display name a result column gets on the wire: alias when given, else
/// the source text of the expression.
pub fn projection_display_name(item: &SelectItem) -> String {
    match item {
        SelectItem::ExprWithAlias { alias, .. } => alias.value.clone(),
        SelectItem::UnnamedExpr(expr) => expr.to_string(),
        other => other.to_string(),
    }
}

pub fn projection_expr(item: &SelectItem) -> Option<&Expr> {
    match item {
        SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => Some(expr),
        _ => None,
    }
}

pub fn is_wildcard(item: &SelectItem) -> bool {
    matches!(
        item,
        SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..)
    )
}

trait QueryVisitor {
    fn visit_set_expr(&mut self, _set_expr: &SetExpr) {}
    fn visit_relation(&mut self, _relation: &TableWithJoins) {}
    fn visit_table_factor(&mut self, _factor: &TableFactor) {}
    fn visit_expr(&mut self, _expr: &Expr) {}
}

fn walk_statement(stmt: &Statement, visitor: &mut dyn QueryVisitor) {
    if let Statement::Query(query) = stmt {
        walk_query(query, visitor);
    }
}

fn walk_query(query: &Query, visitor: &mut dyn QueryVisitor) {
    walk_set_expr(&query.body, visitor);
    for order in &query.order_by {
        walk_expr(&order.expr, visitor);
    }
    if let Some(limit) = &query.limit {
        walk_expr(limit, visitor);
    }
}

fn walk_set_expr(set_expr: &SetExpr, visitor: &mut dyn QueryVisitor) {
    visitor.visit_set_expr(set_expr);
    match set_expr {
        SetExpr::Select(select) => walk_select(select, visitor),
        SetExpr::Query(query) => walk_query(query, visitor),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(left, visitor);
            walk_set_expr(right, visitor);
        }
        _ => {}
    }
}

fn walk_select(select: &Select, visitor: &mut dyn QueryVisitor) {
    for relation in &select.from {
        visitor.visit_relation(relation);
        walk_table_factor(&relation.relation, visitor);
        for join in &relation.joins {
            walk_table_factor(&join.relation, visitor);
        }
    }
    for item in &select.projection {
        if let Some(expr) = projection_expr(item) {
            walk_expr(expr, visitor);
        }
    }
    if let Some(selection) = &select.selection {
        walk_expr(selection, visitor);
    }
    if let GroupByExpr::Expressions(exprs) = &select.group_by {
        for expr in exprs {
            walk_expr(expr, visitor);
        }
    }
    if let Some(having) = &select.having {
        walk_expr(having, visitor);
    }
}

fn walk_table_factor(factor: &TableFactor, visitor: &mut dyn QueryVisitor) {
    visitor.visit_table_factor(factor);
    match factor {
        TableFactor::Derived { subquery, .. } => walk_query(subquery, visitor),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            visitor.visit_relation(table_with_joins);
            walk_table_factor(&table_with_joins.relation, visitor);
            for join in &table_with_joins.joins {
                walk_table_factor(&join.relation, visitor);
            }
        }
        _ => {}
    }
}

/// Pre-order walk over the common expression shapes, descending into
/// expression subqueries.
fn walk_expr(expr: &Expr, visitor: &mut dyn QueryVisitor) {
    visitor.visit_expr(expr);
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            walk_expr(left, visitor);
            walk_expr(right, visitor);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsNotTrue(expr)
        | Expr::IsFalse(expr)
        | Expr::IsNotFalse(expr)
        | Expr::Collate { expr, .. } => walk_expr(expr, visitor),
        Expr::Cast { expr, .. } | Expr::TryCast { expr, .. } | Expr::Extract { expr, .. } => {
            walk_expr(expr, visitor)
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            walk_expr(expr, visitor);
            walk_expr(low, visitor);
            walk_expr(high, visitor);
        }
        Expr::Like { expr, pattern, .. }
        | Expr::ILike { expr, pattern, .. }
        | Expr::SimilarTo { expr, pattern, .. } => {
            walk_expr(expr, visitor);
            walk_expr(pattern, visitor);
        }
        Expr::InList { expr, list, .. } => {
            walk_expr(expr, visitor);
            for item in list {
                walk_expr(item, visitor);
            }
        }
        Expr::InSubquery { expr, subquery, .. } => {
            walk_expr(expr, visitor);
            walk_query(subquery, visitor);
        }
        Expr::Exists { subquery, .. } => walk_query(subquery, visitor),
        Expr::Subquery(subquery) => walk_query(subquery, visitor),
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand {
                walk_expr(operand, visitor);
            }
            for condition in conditions {
                walk_expr(condition, visitor);
            }
            for result in results {
                walk_expr(result, visitor);
            }
            if let Some(else_result) = else_result {
                walk_expr(else_result, visitor);
            }
        }
        Expr::Function(function) => {
            for arg in &function.args {
                if let FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))
                | FunctionArg::Named {
                    arg: FunctionArgExpr::Expr(expr),
                    ..
                } = arg
                {
                    walk_expr(expr, visitor);
                }
            }
        }
        Expr::Tuple(exprs) => {
            for expr in exprs {
                walk_expr(expr, visitor);
            }
        }
        Expr::Substring {
            expr,
            substring_from,
            substring_for,
            ..
        } => {
            walk_expr(expr, visitor);
            if let Some(from) = substring_from {
                walk_expr(from, visitor);
            }
            if let Some(length) = substring_for {
                walk_expr(length, visitor);
            }
        }
        Expr::Trim {
            expr, trim_what, ..
        } => {
            walk_expr(expr, visitor);
            if let Some(what) = trim_what {
                walk_expr(what, visitor);
            }
        }
        _ => {}
    }
}

/// Every table referenced anywhere in the statement, subqueries included, as
/// normalized name parts.
pub fn tables_referenced(stmt: &Statement) -> Vec<Vec<String>> {
    struct Tables(Vec<Vec<String>>);
    impl QueryVisitor for Tables {
        fn visit_table_factor(&mut self, factor: &TableFactor) {
            if let TableFactor::Table { name, .. } = factor {
                self.0.push(name_parts(name));
            }
        }
    }
    let mut tables = Tables(Vec::new());
    walk_statement(stmt, &mut tables);
    tables.0
}

/// Every function called anywhere in the statement, uppercased.
pub fn functions_used(stmt: &Statement) -> Vec<String> {
    struct Functions(Vec<String>);
    impl QueryVisitor for Functions {
        fn visit_expr(&mut self, expr: &Expr) {
            if let Expr::Function(function) = expr {
                if let Some(last) = function.name.0.last() {
                    self.0.push(last.value.to_uppercase());
                }
            }
        }
    }
    let mut functions = Functions(Vec::new());
    walk_statement(stmt, &mut functions);
    functions.0
}

/// Any JOIN anywhere: an explicit join list or a comma-separated FROM.
pub fn has_join(stmt: &Statement) -> bool {
    struct HasJoin(bool);
    impl QueryVisitor for HasJoin {
        fn visit_set_expr(&mut self, set_expr: &SetExpr) {
            if let SetExpr::Select(select) = set_expr {
                if select.from.len() > 1 {
                    self.0 = true;
                }
            }
        }
        fn visit_relation(&mut self, relation: &TableWithJoins) {
            if !relation.joins.is_empty() {
                self.0 = true;
            }
        }
    }
    let mut flag = HasJoin(false);
    walk_statement(stmt, &mut flag);
    flag.0
}

/// Any set operation (UNION and friends) anywhere.
pub fn has_union(stmt: &Statement) -> bool {
    struct HasUnion(bool);
    impl QueryVisitor for HasUnion {
        fn visit_set_expr(&mut self, set_expr: &SetExpr) {
            if matches!(set_expr, SetExpr::SetOperation { .. }) {
                self.0 = true;
            }
        }
    }
    let mut flag = HasUnion(false);
    walk_statement(stmt, &mut flag);
    flag.0
}

/// Any function call carrying an OVER clause.
pub fn has_window(stmt: &Statement) -> bool {
    struct HasWindow(bool);
    impl QueryVisitor for HasWindow {
        fn visit_expr(&mut self, expr: &Expr) {
            if let Expr::Function(function) = expr {
                if function.over.is_some() {
                    self.0 = true;
                }
            }
        }
    }
    let mut flag = HasWindow(false);
    walk_statement(stmt, &mut flag);
    flag.0
}

pub fn has_case(stmt: &Statement) -> bool {
    struct HasCase(bool);
    impl QueryVisitor for HasCase {
        fn visit_expr(&mut self, expr: &Expr) {
            if matches!(expr, Expr::Case { .. }) {
                self.0 = true;
            }
        }
    }
    let mut flag = HasCase(false);
    walk_statement(stmt, &mut flag);
    flag.0
}

pub fn is_aggregate_name(name: &str) -> bool {
    AGGREGATE_FUNCTIONS
        .iter()
        .any(|agg| name.eq_ignore_ascii_case(agg))
}

/// Whether the expression contains an aggregate call. Subqueries are opaque:
/// their aggregates belong to them.
pub fn expr_contains_aggregate(expr: &Expr) -> bool {
    match expr {
        Expr::Function(function) => {
            let own = function
                .name
                .0
                .last()
                .is_some_and(|n| is_aggregate_name(&n.value))
                && function.over.is_none();
            own || function.args.iter().any(|arg| match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                | FunctionArg::Named {
                    arg: FunctionArgExpr::Expr(e),
                    ..
                } => expr_contains_aggregate(e),
                _ => false,
            })
        }
        Expr::BinaryOp { left, right, .. } => {
            expr_contains_aggregate(left) || expr_contains_aggregate(right)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Cast { expr, .. } => {
            expr_contains_aggregate(expr)
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            operand.as_deref().is_some_and(expr_contains_aggregate)
                || conditions.iter().any(expr_contains_aggregate)
                || results.iter().any(expr_contains_aggregate)
                || else_result.as_deref().is_some_and(expr_contains_aggregate)
        }
        _ => false,
    }
}

/// Whether the boolean expression mentions `column` as a direct reference at
/// any depth. Mentions inside subqueries do not count.
pub fn expr_mentions_column(expr: &Expr, column: &str) -> bool {
    match expr {
        Expr::Identifier(ident) => ident_matches(ident, column),
        Expr::CompoundIdentifier(idents) => {
            idents.last().is_some_and(|i| ident_matches(i, column))
        }
        Expr::Subquery(_) | Expr::Exists { .. } => false,
        Expr::InSubquery { expr, .. } => expr_mentions_column(expr, column),
        Expr::BinaryOp { left, right, .. } => {
            expr_mentions_column(left, column) || expr_mentions_column(right, column)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Cast { expr, .. } => {
            expr_mentions_column(expr, column)
        }
        Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsNotTrue(expr)
        | Expr::IsFalse(expr)
        | Expr::IsNotFalse(expr) => expr_mentions_column(expr, column),
        Expr::Between {
            expr, low, high, ..
        } => {
            expr_mentions_column(expr, column)
                || expr_mentions_column(low, column)
                || expr_mentions_column(high, column)
        }
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            expr_mentions_column(expr, column) || expr_mentions_column(pattern, column)
        }
        Expr::InList { expr, list, .. } => {
            expr_mentions_column(expr, column)
                || list.iter().any(|e| expr_mentions_column(e, column))
        }
        Expr::Function(function) => function.args.iter().any(|arg| match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
            | FunctionArg::Named {
                arg: FunctionArgExpr::Expr(e),
                ..
            } => expr_mentions_column(e, column),
            _ => false,
        }),
        _ => false,
    }
}
