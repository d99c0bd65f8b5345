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

//! The rewrite pipeline. Each rewriter takes statement text, applies one
//! transform and returns new text, or declines. The driver runs them in order
//! to a fixed point, re-parsing between steps; a rewrite that fails to
//! re-parse is discarded. Rewrites never raise user-visible errors.

mod flatten;
mod group_by;
mod unwrap;

pub use flatten::flatten_subquery;
pub use group_by::complete_group_by;
pub use unwrap::{paren_unwrap, wrapper_unwrap};

use sqlbridge_common::config::TransformationsSection;
use tracing::debug;

use crate::ast;

/// Hard bound on classify→rewrite iterations; prevents oscillation.
pub const MAX_REWRITE_ITERATIONS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteKind {
    ParenUnwrap,
    WrapperUnwrap,
    SubqueryFlatten,
    GroupByComplete,
}

impl std::fmt::Display for RewriteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ParenUnwrap => "PAREN_UNWRAP",
            Self::WrapperUnwrap => "WRAPPER_UNWRAP",
            Self::SubqueryFlatten => "SUBQUERY_FLATTEN",
            Self::GroupByComplete => "GROUP_BY_COMPLETE",
        };
        f.write_str(name)
    }
}

/// One applied transform, kept on the statement for audit. The final `after`
/// is what the backend (or the synthesizer) sees.
#[derive(Debug, Clone)]
pub struct Rewrite {
    pub seq: u32,
    pub kind: RewriteKind,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub sql: String,
    pub rewrites: Vec<Rewrite>,
}

/// Run the rewrite pipeline to a fixed point.
pub fn rewrite_statement(sql: &str, config: &TransformationsSection) -> RewriteOutcome {
    let mut current = sql.trim().trim_end_matches(';').trim_end().to_owned();
    let mut rewrites: Vec<Rewrite> = Vec::new();
    let mut flatten_applications: u32 = 0;

    for _ in 0..MAX_REWRITE_ITERATIONS {
        let mut changed = false;

        if let Some(next) = accept(&current, paren_unwrap(&current)) {
            record(&mut rewrites, RewriteKind::ParenUnwrap, &current, &next);
            current = next;
            changed = true;
        }

        if let Ok(stmt) = ast::parse_one(&current) {
            if let Some(next) = accept(&current, wrapper_unwrap(&stmt)) {
                record(&mut rewrites, RewriteKind::WrapperUnwrap, &current, &next);
                current = next;
                changed = true;
            }
        }

        if config.unwrap_subqueries && flatten_applications < config.max_subquery_depth {
            if let Ok(stmt) = ast::parse_one(&current) {
                if let Some(next) = accept(&current, flatten_subquery(&stmt)) {
                    record(&mut rewrites, RewriteKind::SubqueryFlatten, &current, &next);
                    current = next;
                    changed = true;
                    flatten_applications += 1;
                }
            }
        }

        if config.auto_fix_group_by {
            if let Ok(stmt) = ast::parse_one(&current) {
                if let Some(next) = accept(&current, complete_group_by(&stmt)) {
                    record(&mut rewrites, RewriteKind::GroupByComplete, &current, &next);
                    current = next;
                    changed = true;
                }
            }
        }

        if !changed {
            break;
        }
    }

    RewriteOutcome {
        sql: current,
        rewrites,
    }
}

/// A candidate rewrite is accepted only when it changes the text and still
/// parses.
fn accept(current: &str, candidate: Option<String>) -> Option<String> {
    let candidate = candidate?;
    if candidate == current {
        return None;
    }
    if ast::parse_one(&candidate).is_err() {
        debug!(candidate, "rewrite produced unparsable text; discarded");
        return None;
    }
    Some(candidate)
}

fn record(rewrites: &mut Vec<Rewrite>, kind: RewriteKind, before: &str, after: &str) {
    let seq = rewrites.len() as u32 + 1;
    debug!(seq, %kind, before, after, "rewrite applied");
    rewrites.push(Rewrite {
        seq,
        kind,
        before: before.to_owned(),
        after: after.to_owned(),
    });
}

#[cfg(test)]
mod tests {
    use expect_test::expect;
    use pretty_assertions::assert_eq;
    use sqlbridge_common::config::TransformationsSection;

    use super::*;

    fn rewrite(sql: &str) -> RewriteOutcome {
        rewrite_statement(sql, &TransformationsSection::default())
    }

    #[test]
    fn test_tableau_wrapper_with_group_by_completion() {
        let out = rewrite(
            "SELECT * FROM (SELECT category, SUM(amount) FROM sales \
             WHERE cob_date='2024-01-15') sub",
        );
        assert_eq!(
            out.sql,
            "SELECT category, SUM(amount) FROM sales WHERE cob_date = '2024-01-15' \
             GROUP BY category"
        );
        let kinds: Vec<_> = out.rewrites.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![RewriteKind::WrapperUnwrap, RewriteKind::GroupByComplete]
        );
    }

    #[test]
    fn test_paren_select_with_limit() {
        let out = rewrite("(SELECT col1, col2 FROM my_table WHERE date_index = -1) LIMIT 0");
        assert_eq!(
            out.sql,
            "SELECT col1, col2 FROM my_table WHERE date_index = -1 LIMIT 0"
        );
        let kinds: Vec<_> = out.rewrites.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![RewriteKind::ParenUnwrap]);
    }

    #[test]
    fn test_idempotence() {
        for sql in [
            "SELECT * FROM (SELECT category, SUM(amount) FROM sales \
             WHERE cob_date='2024-01-15') sub",
            "(SELECT col1, col2 FROM my_table WHERE date_index = -1) LIMIT 0",
            "SELECT a, SUM(b) FROM t WHERE cob_date = 1 GROUP BY a",
            "SELECT p.x FROM (SELECT x, y FROM t WHERE cob_date = 1) p WHERE p.y > 2",
        ] {
            let once = rewrite(sql);
            let twice = rewrite(&once.sql);
            assert_eq!(once.sql, twice.sql, "{sql}");
            assert!(twice.rewrites.is_empty(), "{sql}");
        }
    }

    #[test]
    fn test_untouched_statement_has_no_rewrites() {
        let out = rewrite("SELECT a FROM t WHERE cob_date = '2024-01-15'");
        assert_eq!(out.sql, "SELECT a FROM t WHERE cob_date = '2024-01-15'");
        assert!(out.rewrites.is_empty());
    }

    #[test]
    fn test_rewrite_audit_chain() {
        let out = rewrite("SELECT * FROM (SELECT a, SUM(b) FROM t WHERE cob_date = 1) x");
        assert!(!out.rewrites.is_empty());
        // The chain is contiguous: each `after` feeds the next `before`, and
        // the last `after` is the final text.
        for pair in out.rewrites.windows(2) {
            assert_eq!(pair[0].after, pair[1].before);
        }
        assert_eq!(out.rewrites.last().unwrap().after, out.sql);
        for (i, r) in out.rewrites.iter().enumerate() {
            assert_eq!(r.seq as usize, i + 1);
        }
    }

    #[test]
    fn test_flatten_golden() {
        let out = rewrite(
            "SELECT sub.region, sub.total FROM (SELECT region, SUM(amount) AS total FROM sales \
             WHERE cob_date = '2024-01-15' GROUP BY region) sub WHERE sub.region <> 'APAC'",
        );
        expect![[r#"SELECT region, SUM(amount) AS total FROM sales WHERE cob_date = '2024-01-15' AND region <> 'APAC' GROUP BY region"#]]
            .assert_eq(&out.sql);
    }

    #[test]
    fn test_flatten_depth_bound() {
        let section = TransformationsSection {
            max_subquery_depth: 1,
            ..Default::default()
        };
        // Two levels of nesting with outer filters: only one flatten may fire.
        let out = rewrite_statement(
            "SELECT p.a FROM (SELECT q.a, q.b FROM (SELECT a, b FROM t WHERE cob_date = 1) q \
             WHERE q.b > 0) p WHERE p.a < 9",
            &section,
        );
        let flattens = out
            .rewrites
            .iter()
            .filter(|r| r.kind == RewriteKind::SubqueryFlatten)
            .count();
        assert!(flattens <= 1, "{flattens} flattens: {:?}", out.rewrites);
    }
}
