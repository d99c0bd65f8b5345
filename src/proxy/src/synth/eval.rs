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

//! Evaluator for static SELECTs: the session chatter BI clients send with no
//! FROM clause. Covers literals, arithmetic, string and date/time functions,
//! CAST, connection functions, and system/user variable reads resolved
//! against the session's shadow maps.

use chrono::{Local, Utc};
use sqlbridge_common::{ProxyError, Result};
use sqlparser::ast::{
    BinaryOperator, Expr, Function, FunctionArg, FunctionArgExpr, Query, UnaryOperator, Value,
};
use tracing::warn;

use super::LocalReply;
use crate::ast::{self, SelectView};
use crate::session::{ScalarValue, SessionState};

pub fn eval_static_select(query: &Query, state: &SessionState) -> Result<LocalReply> {
    let view = SelectView::from_query(query)
        .ok_or_else(|| ProxyError::unsupported("evaluating this statement locally"))?;

    let mut columns = Vec::with_capacity(view.projection().len());
    let mut cells = Vec::with_capacity(view.projection().len());
    for item in view.projection() {
        let Some(expr) = ast::projection_expr(item) else {
            // `SELECT *` with no FROM clause.
            return Err(ProxyError::Parse("no tables used".to_owned()));
        };
        columns.push(ast::projection_display_name(item));
        cells.push(eval_expr(expr, state)?.to_cell());
    }

    let mut rows = vec![cells];
    if let Some(limit) = view.limit() {
        if let ScalarValue::Int(n) = eval_expr(limit, state)? {
            rows.truncate(n.max(0) as usize);
        }
    }
    Ok(LocalReply { columns, rows })
}

pub fn eval_expr(expr: &Expr, state: &SessionState) -> Result<ScalarValue> {
    match expr {
        Expr::Value(value) => eval_value(value),
        Expr::Identifier(ident) => eval_identifier(&ident.value, state),
        Expr::CompoundIdentifier(idents) => {
            let first = idents.first().map(|i| i.value.as_str()).unwrap_or_default();
            let last = idents.last().map(|i| i.value.as_str()).unwrap_or_default();
            if first.starts_with("@@") {
                Ok(read_system_variable(last, state))
            } else {
                Err(unsupported(expr))
            }
        }
        Expr::Nested(inner) => eval_expr(inner, state),
        Expr::UnaryOp { op, expr } => {
            let value = eval_expr(expr, state)?;
            match op {
                UnaryOperator::Plus => Ok(value),
                UnaryOperator::Minus => match value {
                    ScalarValue::Int(i) => Ok(ScalarValue::Int(-i)),
                    ScalarValue::Float(f) => Ok(ScalarValue::Float(-f)),
                    ScalarValue::Null => Ok(ScalarValue::Null),
                    ScalarValue::Str(_) => Err(unsupported(expr)),
                },
                UnaryOperator::Not => Ok(ScalarValue::Int(!value.as_bool() as i64)),
                _ => Err(unsupported(expr)),
            }
        }
        Expr::BinaryOp { left, op, right } => {
            let lhs = eval_expr(left, state)?;
            let rhs = eval_expr(right, state)?;
            eval_binary_op(&lhs, op, &rhs).ok_or_else(|| unsupported(expr))
        }
        Expr::Cast {
            expr: inner,
            data_type,
            ..
        } => {
            let value = eval_expr(inner, state)?;
            Ok(cast_value(value, &data_type.to_string()))
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            for (condition, result) in conditions.iter().zip(results) {
                let fires = match operand {
                    Some(operand) => {
                        let lhs = eval_expr(operand, state)?;
                        let rhs = eval_expr(condition, state)?;
                        scalar_eq(&lhs, &rhs)
                    }
                    None => eval_expr(condition, state)?.as_bool(),
                };
                if fires {
                    return eval_expr(result, state);
                }
            }
            match else_result {
                Some(else_result) => eval_expr(else_result, state),
                None => Ok(ScalarValue::Null),
            }
        }
        Expr::Trim {
            expr: inner,
            trim_what,
            ..
        } => {
            if trim_what.is_some() {
                return Err(unsupported(expr));
            }
            let value = eval_expr(inner, state)?;
            Ok(ScalarValue::Str(value.to_string().trim().to_owned()))
        }
        Expr::Substring {
            expr: inner,
            substring_from,
            substring_for,
            ..
        } => {
            let value = eval_expr(inner, state)?.to_string();
            let from = match substring_from {
                Some(from) => int_arg(&eval_expr(from, state)?)?,
                None => 1,
            };
            let length = match substring_for {
                Some(length) => Some(int_arg(&eval_expr(length, state)?)? as usize),
                None => None,
            };
            Ok(ScalarValue::Str(substring(&value, from, length)))
        }
        Expr::Function(function) => eval_function(function, state),
        _ => Err(unsupported(expr)),
    }
}

fn eval_value(value: &Value) -> Result<ScalarValue> {
    match value {
        Value::Number(text, _) => {
            if let Ok(i) = text.parse::<i64>() {
                Ok(ScalarValue::Int(i))
            } else {
                text.parse::<f64>()
                    .map(ScalarValue::Float)
                    .map_err(|_| ProxyError::Parse(format!("bad numeric literal {text}")))
            }
        }
        Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => {
            Ok(ScalarValue::Str(s.clone()))
        }
        Value::Boolean(b) => Ok(ScalarValue::Int(*b as i64)),
        Value::Null => Ok(ScalarValue::Null),
        _ => Err(ProxyError::unsupported("this literal form")),
    }
}

fn eval_identifier(name: &str, state: &SessionState) -> Result<ScalarValue> {
    if let Some(variable) = name.strip_prefix("@@") {
        return Ok(read_system_variable(variable, state));
    }
    if let Some(variable) = name.strip_prefix('@') {
        return Ok(state
            .user_variable(variable)
            .cloned()
            .unwrap_or(ScalarValue::Null));
    }
    Err(ProxyError::unsupported(format!(
        "the bare identifier `{name}` outside a FROM clause"
    )))
}

fn read_system_variable(name: &str, state: &SessionState) -> ScalarValue {
    match state.system_variable(name) {
        Some(value) => value.clone(),
        None => {
            warn!(variable = name, "read of unknown system variable; returning NULL");
            ScalarValue::Null
        }
    }
}

fn eval_binary_op(lhs: &ScalarValue, op: &BinaryOperator, rhs: &ScalarValue) -> Option<ScalarValue> {
    use ScalarValue::*;
    if matches!(op, BinaryOperator::And) {
        return Some(Int((lhs.as_bool() && rhs.as_bool()) as i64));
    }
    if matches!(op, BinaryOperator::Or) {
        return Some(Int((lhs.as_bool() || rhs.as_bool()) as i64));
    }
    if matches!(lhs, Null) || matches!(rhs, Null) {
        return Some(Null);
    }
    match op {
        BinaryOperator::Plus | BinaryOperator::Minus | BinaryOperator::Multiply => {
            match (lhs, rhs) {
                (Int(a), Int(b)) => {
                    let (checked, fallback) = match op {
                        BinaryOperator::Plus => (a.checked_add(*b), *a as f64 + *b as f64),
                        BinaryOperator::Minus => (a.checked_sub(*b), *a as f64 - *b as f64),
                        _ => (a.checked_mul(*b), *a as f64 * *b as f64),
                    };
                    Some(checked.map(Int).unwrap_or(Float(fallback)))
                }
                _ => {
                    let (a, b) = (to_f64(lhs)?, to_f64(rhs)?);
                    let result = match op {
                        BinaryOperator::Plus => a + b,
                        BinaryOperator::Minus => a - b,
                        _ => a * b,
                    };
                    Some(Float(result))
                }
            }
        }
        BinaryOperator::Divide => {
            let (a, b) = (to_f64(lhs)?, to_f64(rhs)?);
            if b == 0.0 {
                Some(Null)
            } else {
                Some(Float(a / b))
            }
        }
        BinaryOperator::Modulo => match (to_f64(lhs)?, to_f64(rhs)?) {
            (_, b) if b == 0.0 => Some(Null),
            (a, b) => Some(Float(a % b)),
        },
        BinaryOperator::Eq => Some(Int(scalar_eq(lhs, rhs) as i64)),
        BinaryOperator::NotEq => Some(Int(!scalar_eq(lhs, rhs) as i64)),
        BinaryOperator::Lt | BinaryOperator::LtEq | BinaryOperator::Gt | BinaryOperator::GtEq => {
            let ordering = match (to_f64(lhs), to_f64(rhs)) {
                (Some(a), Some(b)) => a.partial_cmp(&b)?,
                _ => lhs.to_string().cmp(&rhs.to_string()),
            };
            let holds = match op {
                BinaryOperator::Lt => ordering.is_lt(),
                BinaryOperator::LtEq => ordering.is_le(),
                BinaryOperator::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Some(Int(holds as i64))
        }
        _ => None,
    }
}

fn scalar_eq(lhs: &ScalarValue, rhs: &ScalarValue) -> bool {
    match (to_f64(lhs), to_f64(rhs)) {
        (Some(a), Some(b)) => a == b,
        _ => lhs.to_string() == rhs.to_string(),
    }
}

fn to_f64(value: &ScalarValue) -> Option<f64> {
    match value {
        ScalarValue::Int(i) => Some(*i as f64),
        ScalarValue::Float(f) => Some(*f),
        ScalarValue::Str(s) => s.trim().parse().ok(),
        ScalarValue::Null => None,
    }
}

fn cast_value(value: ScalarValue, data_type: &str) -> ScalarValue {
    if matches!(value, ScalarValue::Null) {
        return ScalarValue::Null;
    }
    let ty = data_type.to_uppercase();
    if ty.starts_with("CHAR") || ty.starts_with("VARCHAR") || ty.starts_with("TEXT") {
        ScalarValue::Str(value.to_string())
    } else if ty.contains("INT") {
        to_f64(&value)
            .map(|f| ScalarValue::Int(f as i64))
            .unwrap_or(ScalarValue::Null)
    } else if ty.starts_with("DECIMAL") || ty.starts_with("FLOAT") || ty.starts_with("DOUBLE") {
        to_f64(&value)
            .map(ScalarValue::Float)
            .unwrap_or(ScalarValue::Null)
    } else {
        value
    }
}

fn eval_function(function: &Function, state: &SessionState) -> Result<ScalarValue> {
    let name = function
        .name
        .0
        .last()
        .map(|i| i.value.to_uppercase())
        .unwrap_or_default();
    let args = function_args(function)?;
    let arg = |i: usize| -> Result<ScalarValue> { eval_expr(args[i], state) };

    let value = match (name.as_str(), args.len()) {
        ("NOW" | "CURRENT_TIMESTAMP" | "LOCALTIME" | "LOCALTIMESTAMP" | "SYSDATE", 0) => {
            ScalarValue::Str(Local::now().format("%Y-%m-%d %H:%M:%S").to_string())
        }
        ("CURDATE" | "CURRENT_DATE", 0) => {
            ScalarValue::Str(Local::now().format("%Y-%m-%d").to_string())
        }
        ("CURTIME" | "CURRENT_TIME", 0) => {
            ScalarValue::Str(Local::now().format("%H:%M:%S").to_string())
        }
        ("UTC_TIMESTAMP", 0) => {
            ScalarValue::Str(Utc::now().format("%Y-%m-%d %H:%M:%S").to_string())
        }
        ("UNIX_TIMESTAMP", 0) => ScalarValue::Int(Utc::now().timestamp()),
        ("VERSION", 0) => read_system_variable("version", state),
        ("CONNECTION_ID", 0) => ScalarValue::Int(state.connection_id() as i64),
        ("DATABASE" | "SCHEMA", 0) => state
            .current_database()
            .map(|db| ScalarValue::Str(db.to_owned()))
            .unwrap_or(ScalarValue::Null),
        ("USER" | "CURRENT_USER" | "SESSION_USER" | "SYSTEM_USER", 0) => {
            ScalarValue::Str(state.user().to_owned())
        }
        ("LAST_INSERT_ID", 0) => ScalarValue::Int(0),
        ("PI", 0) => ScalarValue::Float(std::f64::consts::PI),
        ("CONCAT", _) => {
            let mut out = String::new();
            for i in 0..args.len() {
                match arg(i)? {
                    ScalarValue::Null => return Ok(ScalarValue::Null),
                    value => out.push_str(&value.to_string()),
                }
            }
            ScalarValue::Str(out)
        }
        ("CONCAT_WS", n) if n >= 1 => {
            let separator = arg(0)?.to_string();
            let mut pieces = Vec::new();
            for i in 1..args.len() {
                match arg(i)? {
                    ScalarValue::Null => {}
                    value => pieces.push(value.to_string()),
                }
            }
            ScalarValue::Str(pieces.join(&separator))
        }
        ("UPPER" | "UCASE", 1) => ScalarValue::Str(arg(0)?.to_string().to_uppercase()),
        ("LOWER" | "LCASE", 1) => ScalarValue::Str(arg(0)?.to_string().to_lowercase()),
        ("LENGTH" | "OCTET_LENGTH", 1) => ScalarValue::Int(arg(0)?.to_string().len() as i64),
        ("CHAR_LENGTH" | "CHARACTER_LENGTH", 1) => {
            ScalarValue::Int(arg(0)?.to_string().chars().count() as i64)
        }
        ("TRIM", 1) => ScalarValue::Str(arg(0)?.to_string().trim().to_owned()),
        ("LTRIM", 1) => ScalarValue::Str(arg(0)?.to_string().trim_start().to_owned()),
        ("RTRIM", 1) => ScalarValue::Str(arg(0)?.to_string().trim_end().to_owned()),
        ("REPLACE", 3) => {
            let haystack = arg(0)?.to_string();
            ScalarValue::Str(haystack.replace(&arg(1)?.to_string(), &arg(2)?.to_string()))
        }
        ("SUBSTRING" | "SUBSTR" | "MID", 2 | 3) => {
            let text = arg(0)?.to_string();
            let from = int_arg(&arg(1)?)?;
            let length = if args.len() == 3 {
                Some(int_arg(&arg(2)?)? as usize)
            } else {
                None
            };
            ScalarValue::Str(substring(&text, from, length))
        }
        ("LEFT", 2) => {
            let text = arg(0)?.to_string();
            let n = int_arg(&arg(1)?)?.max(0) as usize;
            ScalarValue::Str(text.chars().take(n).collect())
        }
        ("RIGHT", 2) => {
            let text = arg(0)?.to_string();
            let n = int_arg(&arg(1)?)?.max(0) as usize;
            let skip = text.chars().count().saturating_sub(n);
            ScalarValue::Str(text.chars().skip(skip).collect())
        }
        ("COALESCE", _) => {
            let mut result = ScalarValue::Null;
            for i in 0..args.len() {
                let value = arg(i)?;
                if !matches!(value, ScalarValue::Null) {
                    result = value;
                    break;
                }
            }
            result
        }
        ("IFNULL", 2) => match arg(0)? {
            ScalarValue::Null => arg(1)?,
            value => value,
        },
        ("NULLIF", 2) => {
            let (a, b) = (arg(0)?, arg(1)?);
            if scalar_eq(&a, &b) {
                ScalarValue::Null
            } else {
                a
            }
        }
        ("IF", 3) => {
            if arg(0)?.as_bool() {
                arg(1)?
            } else {
                arg(2)?
            }
        }
        ("ABS", 1) => match arg(0)? {
            ScalarValue::Int(i) => ScalarValue::Int(i.abs()),
            ScalarValue::Float(f) => ScalarValue::Float(f.abs()),
            ScalarValue::Null => ScalarValue::Null,
            other => to_f64(&other)
                .map(|f| ScalarValue::Float(f.abs()))
                .unwrap_or(ScalarValue::Null),
        },
        ("FLOOR", 1) => numeric_unary(&arg(0)?, f64::floor)?,
        ("CEIL" | "CEILING", 1) => numeric_unary(&arg(0)?, f64::ceil)?,
        ("ROUND", 1) => numeric_unary(&arg(0)?, f64::round)?,
        ("ROUND", 2) => {
            let value = to_f64(&arg(0)?).unwrap_or(0.0);
            let digits = int_arg(&arg(1)?)?;
            let factor = 10f64.powi(digits as i32);
            ScalarValue::Float((value * factor).round() / factor)
        }
        _ => {
            return Err(ProxyError::unsupported(format!(
                "evaluating {name}() locally"
            )))
        }
    };
    Ok(value)
}

fn numeric_unary(value: &ScalarValue, f: fn(f64) -> f64) -> Result<ScalarValue> {
    Ok(match value {
        ScalarValue::Null => ScalarValue::Null,
        other => to_f64(other)
            .map(|v| ScalarValue::Int(f(v) as i64))
            .unwrap_or(ScalarValue::Null),
    })
}

fn function_args(function: &Function) -> Result<Vec<&Expr>> {
    function
        .args
        .iter()
        .map(|arg| match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))
            | FunctionArg::Named {
                arg: FunctionArgExpr::Expr(expr),
                ..
            } => Ok(expr),
            _ => Err(ProxyError::unsupported(
                "wildcard arguments in a static SELECT",
            )),
        })
        .collect()
}

fn int_arg(value: &ScalarValue) -> Result<i64> {
    match value {
        ScalarValue::Int(i) => Ok(*i),
        ScalarValue::Float(f) => Ok(*f as i64),
        other => to_f64(other)
            .map(|f| f as i64)
            .ok_or_else(|| ProxyError::Parse(format!("expected a number, got {other}"))),
    }
}

/// MySQL SUBSTRING: 1-based; a negative `from` counts from the end.
fn substring(text: &str, from: i64, length: Option<usize>) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = if from > 0 {
        (from - 1) as usize
    } else if from < 0 {
        chars.len().saturating_sub((-from) as usize)
    } else {
        return String::new();
    };
    let iter = chars.iter().skip(start);
    match length {
        Some(n) => iter.take(n).collect(),
        None => iter.collect(),
    }
}

fn unsupported(expr: &Expr) -> ProxyError {
    ProxyError::unsupported(format!("evaluating `{expr}` locally"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse_one;

    fn eval(sql: &str) -> LocalReply {
        eval_with(sql, &SessionState::new(42))
    }

    fn eval_with(sql: &str, state: &SessionState) -> LocalReply {
        let stmt = parse_one(sql).unwrap();
        let sqlparser::ast::Statement::Query(query) = stmt else {
            panic!("not a query: {sql}");
        };
        eval_static_select(&query, state).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        let reply = eval("SELECT 1 + 1, 3 * 4, 10 - 2");
        assert_eq!(reply.columns, vec!["1 + 1", "3 * 4", "10 - 2"]);
        assert_eq!(
            reply.rows,
            vec![vec![
                Some("2".to_owned()),
                Some("12".to_owned()),
                Some("8".to_owned())
            ]]
        );
    }

    #[test]
    fn test_division_yields_null_on_zero() {
        let reply = eval("SELECT 1 / 0");
        assert_eq!(reply.rows, vec![vec![None]]);
    }

    #[test]
    fn test_connection_id() {
        let reply = eval("SELECT CONNECTION_ID()");
        assert_eq!(reply.columns, vec!["CONNECTION_ID()"]);
        assert_eq!(reply.rows, vec![vec![Some("42".to_owned())]]);
    }

    #[test]
    fn test_system_variable_reads() {
        let reply = eval("SELECT @@version_comment");
        assert_eq!(reply.rows, vec![vec![Some("SqlBridge proxy".to_owned())]]);
        let reply = eval("SELECT @@session.autocommit");
        assert_eq!(reply.rows, vec![vec![Some("1".to_owned())]]);
    }

    #[test]
    fn test_unknown_system_variable_is_null() {
        let reply = eval("SELECT @@no_such_thing");
        assert_eq!(reply.rows, vec![vec![None]]);
    }

    #[test]
    fn test_user_variable_read() {
        let mut state = SessionState::new(1);
        state.set_user_variable("answer", ScalarValue::Int(41));
        let reply = eval_with("SELECT @answer + 1", &state);
        assert_eq!(reply.rows, vec![vec![Some("42".to_owned())]]);
    }

    #[test]
    fn test_alias_names_column() {
        let reply = eval("SELECT 1 + 1 AS total");
        assert_eq!(reply.columns, vec!["total"]);
    }

    #[test]
    fn test_cast_to_char() {
        let reply = eval("SELECT CAST('test plain returns' AS CHAR(60)) AS anon_1");
        assert_eq!(reply.columns, vec!["anon_1"]);
        assert_eq!(reply.rows, vec![vec![Some("test plain returns".to_owned())]]);
    }

    #[test]
    fn test_string_functions() {
        let reply = eval("SELECT CONCAT('a', 'b', 'c'), UPPER('x'), LENGTH('abcd')");
        assert_eq!(
            reply.rows,
            vec![vec![
                Some("abc".to_owned()),
                Some("X".to_owned()),
                Some("4".to_owned())
            ]]
        );
    }

    #[test]
    fn test_substring_variants() {
        let reply = eval("SELECT SUBSTRING('hello world', 7), SUBSTRING('hello', 2, 3)");
        assert_eq!(
            reply.rows,
            vec![vec![Some("world".to_owned()), Some("ell".to_owned())]]
        );
    }

    #[test]
    fn test_concat_with_null_is_null() {
        let reply = eval("SELECT CONCAT('a', NULL, 'c')");
        assert_eq!(reply.rows, vec![vec![None]]);
    }

    #[test]
    fn test_limit_zero_drops_row() {
        let reply = eval("SELECT 1 LIMIT 0");
        assert_eq!(reply.columns, vec!["1"]);
        assert!(reply.rows.is_empty());
    }

    #[test]
    fn test_now_looks_like_datetime() {
        let reply = eval("SELECT NOW()");
        let cell = reply.rows[0][0].clone().unwrap();
        assert_eq!(cell.len(), 19, "{cell}");
        assert_eq!(&cell[4..5], "-");
    }

    #[test]
    fn test_case_expression() {
        let reply = eval("SELECT CASE WHEN 1 = 1 THEN 'yes' ELSE 'no' END");
        assert_eq!(reply.rows, vec![vec![Some("yes".to_owned())]]);
    }

    #[test]
    fn test_database_null_until_use() {
        let reply = eval("SELECT DATABASE()");
        assert_eq!(reply.rows, vec![vec![None]]);

        let mut state = SessionState::new(1);
        state.set_current_database("analytics");
        let reply = eval_with("SELECT DATABASE()", &state);
        assert_eq!(reply.rows, vec![vec![Some("analytics".to_owned())]]);
    }

    #[test]
    fn test_if_and_coalesce() {
        let reply = eval("SELECT IF(1 > 2, 'a', 'b'), COALESCE(NULL, NULL, 7)");
        assert_eq!(
            reply.rows,
            vec![vec![Some("b".to_owned()), Some("7".to_owned())]]
        );
    }
}
