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

//! The per-statement state machine:
//!
//! ```text
//! received → classified → rewritten → gated → dispatched → adapted → replied
//!                                       ↘ synthesized ↗
//!                                       ↘ empty ↗
//!                                       ↘ rejected (terminal)
//! ```
//!
//! Classify→rewrite loops to a fixed point (hard-bounded); every transition
//! logs a structured record keyed by the statement id. A per-statement
//! deadline starts at entry; session mutations applied before an expiry are
//! not rolled back.

use std::time::{Duration, Instant};

use sqlbridge_common::{ProxyError, Result};
use tracing::{debug, info};

use crate::adapter;
use crate::ast;
use crate::classify::{classify, MetaKind, StatementKind};
use crate::policy;
use crate::rewrite::{rewrite_statement, Rewrite};
use crate::session::SessionState;
use crate::synth::{self, InfoSchemaPlan};
use crate::ProxyEnv;

/// The reply for one statement, shape-normalized. `|row| == |columns|` holds
/// for every row; empty columns mean an OK packet.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub rewrites: Vec<Rewrite>,
    pub elapsed: Duration,
}

pub async fn process_statement(
    env: &ProxyEnv,
    state: &mut SessionState,
    sql: &str,
) -> Result<PipelineResult> {
    let statement_id = env.next_statement_id();
    let started = Instant::now();
    let deadline = env.config().backend.statement_timeout();
    debug!(statement_id, sql, stage = "received", "statement received");

    let text = sql.trim().trim_end_matches(';').trim_end().to_owned();
    if text.is_empty() {
        return Err(ProxyError::Parse("empty statement".to_owned()));
    }
    let parsed = ast::parse_one(&text).ok();
    let kind = classify(&text, parsed.as_ref());
    debug!(statement_id, ?kind, stage = "classified", "statement classified");

    // Local middleware, in priority order: session-variable SET, general SET,
    // static SELECT, USE. These never reach rewrites, gates or the backend.
    if matches!(
        kind,
        StatementKind::Meta(MetaKind::Set) | StatementKind::Meta(MetaKind::Use)
            | StatementKind::StaticSelect
    ) {
        if let Some(reply) = synth::try_handle_local(&text, parsed.as_ref(), state) {
            let reply = reply?;
            debug!(statement_id, stage = "synthesized", "handled locally");
            return Ok(finish(statement_id, reply.columns, reply.rows, Vec::new(), started));
        }
    }

    // Rewrites apply to SELECT shapes only; everything else goes through
    // unchanged.
    let (text, rewrites) = if matches!(
        kind,
        StatementKind::ParenSelect | StatementKind::WrappedSelect | StatementKind::DataSelect
    ) {
        let outcome = rewrite_statement(&text, &env.config().transformations);
        (outcome.sql, outcome.rewrites)
    } else {
        (text, Vec::new())
    };
    let parsed = ast::parse_one(&text).ok();
    let kind = classify(&text, parsed.as_ref());
    debug!(
        statement_id,
        ?kind,
        rewrites = rewrites.len(),
        stage = "rewritten",
        "rewrites settled"
    );

    // Unwrapping may have exposed a statement the synthesizer owns.
    if kind == StatementKind::StaticSelect {
        if let Some(reply) = synth::try_handle_local(&text, parsed.as_ref(), state) {
            let reply = reply?;
            debug!(statement_id, stage = "synthesized", "handled locally after rewrite");
            return Ok(finish(statement_id, reply.columns, reply.rows, rewrites, started));
        }
    }

    // Residual paren/wrapped selects face the same gates as data selects.
    let gate_kind = match kind {
        StatementKind::ParenSelect | StatementKind::WrappedSelect => StatementKind::DataSelect,
        other => other,
    };
    policy::enforce(&text, parsed.as_ref(), gate_kind, env.config()).map_err(|e| {
        info!(statement_id, error = %e, stage = "rejected", "statement rejected");
        e
    })?;
    debug!(statement_id, stage = "gated", "gates passed");

    if !matches!(kind, StatementKind::Meta(_)) && parsed.is_none() {
        info!(statement_id, stage = "rejected", "statement does not parse");
        return Err(ProxyError::Parse(text));
    }

    // Dispatch.
    let remaining = deadline.saturating_sub(started.elapsed());
    let (columns, rows) = match kind {
        StatementKind::InfoSchemaSelect => {
            let plan = parsed
                .as_ref()
                .map(synth::plan_info_schema)
                .unwrap_or(InfoSchemaPlan::Empty);
            match plan {
                InfoSchemaPlan::Show { sql, column_names } => {
                    info!(statement_id, translated = %sql, "information_schema query translated");
                    let (backend_columns, rows) =
                        env.pool().execute(statement_id, &sql, remaining).await?;
                    (column_names.unwrap_or(backend_columns), rows)
                }
                InfoSchemaPlan::Empty => {
                    info!(statement_id, stage = "empty", "information_schema query answered empty");
                    (Vec::new(), Vec::new())
                }
            }
        }
        _ => {
            debug!(statement_id, stage = "dispatched", "forwarding to backend");
            env.pool().execute(statement_id, &text, remaining).await?
        }
    };

    Ok(finish(statement_id, columns, rows, rewrites, started))
}

fn finish(
    statement_id: u64,
    mut columns: Vec<String>,
    mut rows: Vec<Vec<Option<String>>>,
    rewrites: Vec<Rewrite>,
    started: Instant,
) -> PipelineResult {
    adapter::adapt(statement_id, &mut columns, &mut rows);
    let elapsed = started.elapsed();
    debug!(
        statement_id,
        columns = columns.len(),
        rows = rows.len(),
        ?elapsed,
        stage = "replied",
        "statement finished"
    );
    PipelineResult {
        columns,
        rows,
        rewrites,
        elapsed,
    }
}
