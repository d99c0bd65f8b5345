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

//! The wire-codec facade: the interface a statement processor presents to the
//! MySQL protocol layer. The codec owns handshake, auth, packet framing and
//! prepared-statement bookkeeping; implementors of [`Session`] own everything
//! semantic. We can mock either side for testing purposes.

mod server;

use std::sync::Arc;

pub use server::serve;

/// A single result cell, rendered through the text protocol.
pub type Cell = Option<String>;

/// What a statement produced. An empty `columns` means there is no result set
/// and the codec replies with an OK packet instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Response {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn result_set(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_ok_packet(&self) -> bool {
        self.columns.is_empty()
    }
}

/// An error surfaced to the client with a MySQL error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
    pub code: u16,
    pub message: String,
}

impl WireError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ERROR {}: {}", self.code, self.message)
    }
}

impl std::error::Error for WireError {}

/// One client connection's view of the statement processor.
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    /// Run one statement to completion and return its reply.
    async fn run_statement(self: Arc<Self>, sql: &str) -> Result<Response, WireError>;

    /// `COM_INIT_DB`: the client switched database.
    async fn init_database(self: Arc<Self>, database: &str) -> Result<(), WireError>;

    /// The id reported in the handshake and by `CONNECTION_ID()`.
    fn connection_id(&self) -> u32;
}

/// The statement processor behind the codec; creates one [`Session`] per
/// accepted client connection.
pub trait SessionManager: Send + Sync {
    fn connect(&self) -> Arc<dyn Session>;
}
