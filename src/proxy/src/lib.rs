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

//! The SqlBridge statement pipeline: classification, rewriting, policy,
//! metadata synthesis and backend dispatch behind the wire codec's
//! `Session` traits.

pub mod adapter;
pub mod ast;
pub mod backend;
pub mod classify;
pub mod pipeline;
pub mod policy;
pub mod rewrite;
pub mod session;
pub mod synth;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use sqlbridge_common::config::ConnectionType;
use sqlbridge_common::{ProxyConfig, ProxyError, Result};
use sqlbridge_wire::{Response, Session, SessionManager, WireError};
use tokio::sync::Mutex;
use tracing::info;

use crate::backend::{NativeConnector, Pool, PoolRef};
use crate::session::SessionState;

/// The read-only environment shared by every connection: configuration and
/// the backend pool. Constructed once at startup and passed by reference.
pub struct ProxyEnv {
    config: Arc<ProxyConfig>,
    pool: PoolRef,
    statement_counter: AtomicU64,
    connection_counter: AtomicU32,
}

pub type ProxyEnvRef = Arc<ProxyEnv>;

impl ProxyEnv {
    /// Build the connector named by the configuration and bring the pool up,
    /// probing the backend once.
    pub async fn connect(config: ProxyConfig) -> Result<ProxyEnvRef> {
        let connector = match config.backend.connection_type {
            ConnectionType::Native => {
                Arc::new(NativeConnector::new(&config.backend.connection_string)
                    .map_err(|e| ProxyError::Config(e.message.clone()))?)
            }
            ConnectionType::Odbc => {
                return Err(ProxyError::Config(
                    "odbc connector not available in this build; use connection_type: native"
                        .to_owned(),
                ));
            }
        };
        let pool = Pool::connect(connector, &config.backend).await?;
        Ok(Self::with_pool(config, pool))
    }

    /// Assemble from an existing pool; the seam tests use to inject mock
    /// backends.
    pub fn with_pool(config: ProxyConfig, pool: PoolRef) -> ProxyEnvRef {
        Arc::new(Self {
            config: Arc::new(config),
            pool,
            statement_counter: AtomicU64::new(0),
            connection_counter: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn next_statement_id(&self) -> u64 {
        self.statement_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn next_connection_id(&self) -> u32 {
        self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// One instance serves the whole process; `connect` mints a session per
/// accepted client connection.
pub struct SessionManagerImpl {
    env: ProxyEnvRef,
}

impl SessionManagerImpl {
    pub fn new(env: ProxyEnvRef) -> Self {
        Self { env }
    }
}

impl SessionManager for SessionManagerImpl {
    fn connect(&self) -> Arc<dyn Session> {
        let session = SessionImpl::new(self.env.clone());
        info!(connection_id = session.connection_id(), "session created");
        Arc::new(session)
    }
}

/// A client session: exclusive owner of its [`SessionState`]. The mutex is
/// uncontended (the wire codec feeds one statement at a time) and only
/// makes the exclusivity explicit across await points.
pub struct SessionImpl {
    env: ProxyEnvRef,
    connection_id: u32,
    state: Mutex<SessionState>,
}

impl SessionImpl {
    pub fn new(env: ProxyEnvRef) -> Self {
        let connection_id = env.next_connection_id();
        Self {
            env,
            connection_id,
            state: Mutex::new(SessionState::new(connection_id)),
        }
    }
}

#[async_trait::async_trait]
impl Session for SessionImpl {
    async fn run_statement(self: Arc<Self>, sql: &str) -> std::result::Result<Response, WireError> {
        let mut state = self.state.lock().await;
        match pipeline::process_statement(&self.env, &mut state, sql).await {
            Ok(result) => Ok(Response::result_set(result.columns, result.rows)),
            Err(e) => Err(WireError::new(e.mysql_code(), e.to_string())),
        }
    }

    async fn init_database(self: Arc<Self>, database: &str) -> std::result::Result<(), WireError> {
        let mut state = self.state.lock().await;
        let statement = format!("USE `{database}`");
        match synth::handle_use(&statement, &mut state) {
            Some(Ok(_)) => Ok(()),
            _ => Err(WireError::new(1049, format!("unknown database '{database}'"))),
        }
    }

    fn connection_id(&self) -> u32 {
        self.connection_id
    }
}
