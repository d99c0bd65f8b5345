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

//! End-to-end pipeline scenarios against a recording mock backend.

use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use sqlbridge_common::{ProxyConfig, ProxyError};
use sqlbridge_proxy::backend::{BackendConnection, BackendError, Connector, Pool, Rows};
use sqlbridge_proxy::pipeline::process_statement;
use sqlbridge_proxy::session::SessionState;
use sqlbridge_proxy::{ProxyEnv, ProxyEnvRef, SessionImpl, SessionManagerImpl};
use sqlbridge_wire::{Session as WireSession, SessionManager};

/// Records every statement the pipeline dispatches; answers `SHOW DATABASES`
/// with two rows and everything else with a single-cell row.
#[derive(Default)]
struct RecordingConnector {
    statements: Arc<Mutex<Vec<String>>>,
}

impl RecordingConnector {
    /// Dispatched statements, health probes excluded.
    fn dispatched(&self) -> Vec<String> {
        self.statements
            .lock()
            .unwrap()
            .iter()
            .filter(|sql| !sql.starts_with("SHOW STATUS LIKE"))
            .cloned()
            .collect()
    }
}

struct RecordingConnection {
    statements: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Connector for RecordingConnector {
    async fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
        Ok(Box::new(RecordingConnection {
            statements: self.statements.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl BackendConnection for RecordingConnection {
    async fn execute(&mut self, sql: &str) -> Result<(Vec<String>, Rows), BackendError> {
        self.statements.lock().unwrap().push(sql.to_owned());
        if sql == "SHOW DATABASES" {
            return Ok((
                vec!["Database".to_owned()],
                vec![
                    vec![Some("analytics".to_owned())],
                    vec![Some("risk".to_owned())],
                ],
            ));
        }
        Ok((vec!["ok".to_owned()], vec![vec![Some("1".to_owned())]]))
    }

    async fn close(self: Box<Self>) {}
}

async fn test_env() -> (ProxyEnvRef, Arc<RecordingConnector>) {
    let connector = Arc::new(RecordingConnector::default());
    let mut config = ProxyConfig::from_yaml_str("{}").unwrap();
    config.backend.pool_pre_ping = false;
    let pool = Pool::connect(connector.clone(), &config.backend)
        .await
        .unwrap();
    (ProxyEnv::with_pool(config, pool), connector)
}

#[tokio::test]
async fn test_tableau_wrapper_unwrapped_and_group_by_completed() {
    let (env, connector) = test_env().await;
    let mut state = SessionState::new(1);
    let result = process_statement(
        &env,
        &mut state,
        "SELECT * FROM (SELECT category, SUM(amount) FROM sales WHERE cob_date='2024-01-15') sub",
    )
    .await
    .unwrap();

    assert_eq!(
        connector.dispatched(),
        vec![
            "SELECT category, SUM(amount) FROM sales WHERE cob_date = '2024-01-15' \
             GROUP BY category"
        ]
    );
    let kinds: Vec<String> = result.rewrites.iter().map(|r| r.kind.to_string()).collect();
    assert_eq!(kinds, vec!["WRAPPER_UNWRAP", "GROUP_BY_COMPLETE"]);
}

#[tokio::test]
async fn test_paren_select_unwrapped_with_limit() {
    let (env, connector) = test_env().await;
    let mut state = SessionState::new(1);
    process_statement(
        &env,
        &mut state,
        "(SELECT col1, col2 FROM my_table WHERE date_index = -1) LIMIT 0",
    )
    .await
    .unwrap();
    assert_eq!(
        connector.dispatched(),
        vec!["SELECT col1, col2 FROM my_table WHERE date_index = -1 LIMIT 0"]
    );
}

#[tokio::test]
async fn test_schemata_translated_and_result_adapted() {
    let (env, connector) = test_env().await;
    let mut state = SessionState::new(1);
    let result = process_statement(
        &env,
        &mut state,
        "SELECT NULL, NULL, NULL, SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA \
         WHERE SCHEMA_NAME LIKE '%' ORDER BY SCHEMA_NAME",
    )
    .await
    .unwrap();

    assert_eq!(connector.dispatched(), vec!["SHOW DATABASES"]);
    assert_eq!(result.columns, vec!["expr_1", "expr_2", "expr_3", "SCHEMA_NAME"]);
    for row in &result.rows {
        assert_eq!(row.len(), 4);
    }
    assert_eq!(result.rows[0][0], Some("analytics".to_owned()));
    assert_eq!(result.rows[1][0], Some("risk".to_owned()));
}

#[tokio::test]
async fn test_unsupported_info_schema_answered_empty() {
    let (env, connector) = test_env().await;
    let mut state = SessionState::new(1);
    let result = process_statement(
        &env,
        &mut state,
        "SELECT table_name, column_name FROM information_schema.columns \
         WHERE data_type='enum' AND table_schema=''",
    )
    .await
    .unwrap();
    assert!(result.columns.is_empty());
    assert!(result.rows.is_empty());
    assert!(connector.dispatched().is_empty(), "no backend call expected");
}

#[tokio::test]
async fn test_connection_id_synthesized() {
    let (env, connector) = test_env().await;
    let mut state = SessionState::new(7);
    let result = process_statement(&env, &mut state, "SELECT CONNECTION_ID()")
        .await
        .unwrap();
    assert_eq!(result.columns, vec!["CONNECTION_ID()"]);
    assert_eq!(result.rows, vec![vec![Some("7".to_owned())]]);
    assert!(connector.dispatched().is_empty());
}

#[tokio::test]
async fn test_insert_rejected_before_backend() {
    let (env, connector) = test_env().await;
    let mut state = SessionState::new(1);
    let err = process_statement(&env, &mut state, "INSERT INTO t VALUES (1)")
        .await
        .unwrap_err();
    assert_matches!(err, ProxyError::WriteBlocked { .. });
    assert!(connector.dispatched().is_empty(), "write must never reach the backend");
}

#[tokio::test]
async fn test_missing_date_predicate_rejected() {
    let (env, connector) = test_env().await;
    let mut state = SessionState::new(1);
    let err = process_statement(&env, &mut state, "SELECT a FROM t WHERE b = 1")
        .await
        .unwrap_err();
    assert_matches!(err, ProxyError::MissingDatePredicate { .. });
    assert!(connector.dispatched().is_empty());
}

#[tokio::test]
async fn test_rewrite_preserves_date_gate() {
    // A statement that passes the gate keeps passing after rewriting.
    let (env, connector) = test_env().await;
    let mut state = SessionState::new(1);
    process_statement(
        &env,
        &mut state,
        "SELECT p.x FROM (SELECT x, y FROM t WHERE cob_date = '2024-01-15') p WHERE p.y > 2",
    )
    .await
    .unwrap();
    let dispatched = connector.dispatched();
    assert_eq!(dispatched.len(), 1);
    assert!(dispatched[0].contains("cob_date = '2024-01-15'"), "{dispatched:?}");
}

#[tokio::test]
async fn test_meta_statements_bypass_gates() {
    let (env, connector) = test_env().await;
    let mut state = SessionState::new(1);
    // None of these carries a date predicate; none may be rejected.
    for sql in [
        "SHOW TABLES",
        "DESCRIBE trades",
        "SELECT 1 + 1",
        "SELECT * FROM information_schema.tables",
    ] {
        process_statement(&env, &mut state, sql).await.unwrap();
    }
    assert_eq!(
        connector.dispatched(),
        vec!["SHOW TABLES", "DESCRIBE trades", "SHOW TABLES"]
    );
}

#[tokio::test]
async fn test_join_rejected_after_unwrap() {
    // The wrapper hides a JOIN; gates run on the rewritten form and reject.
    let (env, connector) = test_env().await;
    let mut state = SessionState::new(1);
    let err = process_statement(
        &env,
        &mut state,
        "SELECT * FROM (SELECT a.x FROM a JOIN b ON a.i = b.i WHERE cob_date = 1) sub",
    )
    .await
    .unwrap_err();
    assert_matches!(err, ProxyError::Unsupported { .. });
    assert!(connector.dispatched().is_empty());
}

#[tokio::test]
async fn test_arity_invariant_on_every_success() {
    let (env, _connector) = test_env().await;
    let mut state = SessionState::new(1);
    for sql in [
        "SELECT a FROM t WHERE cob_date = 1",
        "SELECT NOW()",
        "SHOW DATABASES",
        "SELECT NULL, NULL, NULL, SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA",
    ] {
        let result = process_statement(&env, &mut state, sql).await.unwrap();
        for row in &result.rows {
            assert_eq!(row.len(), result.columns.len(), "{sql}");
        }
        for name in &result.columns {
            assert!(!name.trim().is_empty(), "{sql}");
            assert!(!name.eq_ignore_ascii_case("null"), "{sql}");
        }
    }
}

#[tokio::test]
async fn test_session_state_flows_through_statements() {
    let (env, _connector) = test_env().await;
    let mut state = SessionState::new(1);

    process_statement(&env, &mut state, "SET NAMES latin1")
        .await
        .unwrap();
    let result = process_statement(&env, &mut state, "SELECT @@character_set_client")
        .await
        .unwrap();
    assert_eq!(result.rows, vec![vec![Some("latin1".to_owned())]]);

    process_statement(&env, &mut state, "USE analytics")
        .await
        .unwrap();
    let result = process_statement(&env, &mut state, "SELECT DATABASE()")
        .await
        .unwrap();
    assert_eq!(result.rows, vec![vec![Some("analytics".to_owned())]]);
}

#[tokio::test]
async fn test_static_select_exposed_by_unwrap_is_synthesized() {
    let (env, connector) = test_env().await;
    let mut state = SessionState::new(1);
    let result = process_statement(&env, &mut state, "SELECT * FROM (SELECT 1 + 1) calc")
        .await
        .unwrap();
    assert_eq!(result.rows, vec![vec![Some("2".to_owned())]]);
    assert!(connector.dispatched().is_empty());
}

#[tokio::test]
async fn test_wire_session_surface() {
    let (env, _connector) = test_env().await;
    let mgr = SessionManagerImpl::new(env);
    let session = mgr.connect();

    let response = session
        .clone()
        .run_statement("SELECT a FROM t WHERE date_index = -1")
        .await
        .unwrap();
    assert_eq!(response.columns, vec!["ok"]);

    let err = session
        .clone()
        .run_statement("INSERT INTO t VALUES (1)")
        .await
        .unwrap_err();
    assert_eq!(err.code, 1290);

    session.clone().init_database("risk").await.unwrap();
    let response = session.run_statement("SELECT DATABASE()").await.unwrap();
    assert_eq!(response.rows, vec![vec![Some("risk".to_owned())]]);
}

#[tokio::test]
async fn test_session_impl_connection_ids_are_distinct() {
    let (env, _connector) = test_env().await;
    let a = SessionImpl::new(env.clone());
    let b = SessionImpl::new(env);
    assert_ne!(
        WireSession::connection_id(&a),
        WireSession::connection_id(&b)
    );
}
