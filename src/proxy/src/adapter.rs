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

//! Normalize every reply, backend or synthesized, into a shape the wire
//! codec can always deliver: matching arity, and column names that are
//! non-empty, non-`NULL` and unique. Adjustments are logged, never fatal.

use tracing::warn;

pub type Row = Vec<Option<String>>;

/// Enforce the result-shape invariants in place.
///
/// Arity: when rows are wider than the column list, synthetic `column_{i+1}`
/// names are appended; when the column list is wider, rows are padded with
/// NULL cells (real columns are never shed). Names: literal `NULL` becomes
/// `expr_{i+1}`, empty becomes `column_{i+1}`, duplicates get a positional
/// suffix.
pub fn adapt(statement_id: u64, columns: &mut Vec<String>, rows: &mut [Row]) {
    let width = rows.iter().map(Vec::len).max().unwrap_or(columns.len());

    if width > columns.len() {
        let missing = (columns.len()..width).map(|i| format!("column_{}", i + 1));
        warn!(
            statement_id,
            columns = columns.len(),
            row_width = width,
            "padding column list with synthetic names"
        );
        columns.extend(missing);
    }

    let target = columns.len();
    for row in rows.iter_mut() {
        if row.len() < target {
            warn!(
                statement_id,
                row_width = row.len(),
                target,
                "padding short row with NULLs"
            );
            row.resize(target, None);
        }
    }

    for (i, name) in columns.iter_mut().enumerate() {
        if name.trim().is_empty() {
            let replacement = format!("column_{}", i + 1);
            warn!(statement_id, index = i, replacement, "renaming empty column name");
            *name = replacement;
        } else if name.eq_ignore_ascii_case("null") {
            let replacement = format!("expr_{}", i + 1);
            warn!(statement_id, index = i, replacement, "renaming NULL column name");
            *name = replacement;
        }
    }

    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    for (i, name) in columns.iter_mut().enumerate() {
        if !seen.insert(name.to_lowercase()) {
            let replacement = format!("{}_{}", name, i + 1);
            warn!(statement_id, index = i, replacement, "renaming duplicate column name");
            *name = replacement.clone();
            seen.insert(replacement.to_lowercase());
        }
    }
}
