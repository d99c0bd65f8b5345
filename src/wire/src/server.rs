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

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use opensrv_mysql::{
    AsyncMysqlIntermediary, AsyncMysqlShim, Column, ColumnFlags, ColumnType, ErrorKind,
    InitWriter, ParamParser, QueryResultWriter, StatementMetaWriter,
};
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::{Response, Session, SessionManager};

const SERVER_VERSION: &str = "8.0.26-sqlbridge";

/// Per-connection cap on registered prepared statements.
const MAX_PREPARED_STATEMENTS: usize = 512;

/// Bind `addr` and serve until `shutdown` flips to `true`. Each accepted
/// connection runs in its own task; admission above `max_connections` is
/// refused at accept time.
pub async fn serve(
    addr: &str,
    max_connections: usize,
    session_mgr: Arc<dyn SessionManager>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let admission = Arc::new(Semaphore::new(max_connections));
    info!(%addr, max_connections, "listening for MySQL clients");

    loop {
        let (stream, peer) = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("accept loop stopping");
                    return Ok(());
                }
                continue;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "accept failure");
                    continue;
                }
            },
        };

        let Ok(permit) = admission.clone().try_acquire_owned() else {
            warn!(%peer, "connection refused: max_connections reached");
            drop(stream);
            continue;
        };

        let session = session_mgr.connect();
        let connection_id = session.connection_id();
        info!(%peer, connection_id, "new client connection");

        tokio::spawn(async move {
            let shim = Connection {
                session,
                statements: HashMap::new(),
                next_statement_id: 0,
            };
            let (r, w) = stream.into_split();
            if let Err(e) = AsyncMysqlIntermediary::run_on(shim, r, w).await {
                debug!(connection_id, error = %e, "connection closed by error");
            } else {
                debug!(connection_id, "connection closed");
            }
            drop(permit);
        });
    }
}

struct Connection {
    session: Arc<dyn Session>,
    /// Prepared-statement id → registered raw text. The proxy advertises zero
    /// parameters and an empty result schema, so execution re-enters the text
    /// pipeline untouched.
    statements: HashMap<u32, String>,
    next_statement_id: u32,
}

impl Connection {
    async fn reply<'a, W: AsyncWrite + Send + Unpin>(
        &'a mut self,
        sql: &'a str,
        results: QueryResultWriter<'a, W>,
    ) -> io::Result<()> {
        match self.session.clone().run_statement(sql).await {
            Ok(response) => write_response(&response, results).await,
            Err(e) => {
                results
                    .error(error_kind(e.code), e.message.as_bytes())
                    .await
            }
        }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Send + Unpin> AsyncMysqlShim<W> for Connection {
    type Error = io::Error;

    fn version(&self) -> String {
        SERVER_VERSION.to_owned()
    }

    fn connect_id(&self) -> u32 {
        self.session.connection_id()
    }

    async fn on_prepare<'a>(
        &'a mut self,
        query: &'a str,
        info: StatementMetaWriter<'a, W>,
    ) -> io::Result<()> {
        debug!(connection_id = self.session.connection_id(), query, "on_prepare");
        if self.statements.len() >= MAX_PREPARED_STATEMENTS {
            return info
                .error(
                    ErrorKind::ER_UNKNOWN_ERROR,
                    b"too many prepared statements on this connection",
                )
                .await;
        }
        self.next_statement_id += 1;
        let id = self.next_statement_id;
        self.statements.insert(id, query.to_owned());
        // Empty parameter and column sets: the schema callback of this proxy
        // is deliberately empty.
        info.reply(id, &[], &[]).await
    }

    async fn on_execute<'a>(
        &'a mut self,
        id: u32,
        _params: ParamParser<'a>,
        results: QueryResultWriter<'a, W>,
    ) -> io::Result<()> {
        debug!(connection_id = self.session.connection_id(), id, "on_execute");
        let Some(sql) = self.statements.get(&id).cloned() else {
            return results
                .error(ErrorKind::ER_UNKNOWN_ERROR, b"unknown prepared statement")
                .await;
        };
        self.reply(&sql, results).await
    }

    async fn on_close<'a>(&'a mut self, id: u32)
    where
        W: 'async_trait,
    {
        if self.statements.remove(&id).is_none() {
            debug!(id, "client deallocated unknown prepared statement");
        }
    }

    async fn on_query<'a>(
        &'a mut self,
        query: &'a str,
        results: QueryResultWriter<'a, W>,
    ) -> io::Result<()> {
        debug!(connection_id = self.session.connection_id(), query, "on_query");
        self.reply(query, results).await
    }

    async fn on_init<'a>(
        &'a mut self,
        database: &'a str,
        writer: InitWriter<'a, W>,
    ) -> io::Result<()> {
        debug!(connection_id = self.session.connection_id(), database, "on_init");
        match self.session.clone().init_database(database).await {
            Ok(()) => writer.ok().await,
            Err(e) => {
                writer
                    .error(ErrorKind::ER_BAD_DB_ERROR, e.message.as_bytes())
                    .await
            }
        }
    }
}

async fn write_response<'a, W: AsyncWrite + Send + Unpin>(
    response: &Response,
    results: QueryResultWriter<'a, W>,
) -> io::Result<()> {
    if response.is_ok_packet() {
        return results.completed(opensrv_mysql::OkResponse::default()).await;
    }
    let columns: Vec<Column> = response
        .columns
        .iter()
        .map(|name| Column {
            table: String::new(),
            column: name.clone(),
            coltype: ColumnType::MYSQL_TYPE_VAR_STRING,
            colflags: ColumnFlags::empty(),
        })
        .collect();
    let mut rw = results.start(&columns).await?;
    for row in &response.rows {
        for cell in row {
            rw.write_col(cell.as_deref())?;
        }
        rw.end_row().await?;
    }
    rw.finish().await
}

/// Downgrade a numeric MySQL error code to the codec's `ErrorKind`. Backend
/// codes without a wire-level counterpart fall back to `ER_UNKNOWN_ERROR`;
/// the message always carries the backend's own text.
fn error_kind(code: u16) -> ErrorKind {
    match code {
        1044 => ErrorKind::ER_DBACCESS_DENIED_ERROR,
        1046 => ErrorKind::ER_NO_DB_ERROR,
        1049 => ErrorKind::ER_BAD_DB_ERROR,
        1053 => ErrorKind::ER_SERVER_SHUTDOWN,
        1064 => ErrorKind::ER_PARSE_ERROR,
        1146 => ErrorKind::ER_NO_SUCH_TABLE,
        1205 => ErrorKind::ER_LOCK_WAIT_TIMEOUT,
        1235 => ErrorKind::ER_NOT_SUPPORTED_YET,
        1290 => ErrorKind::ER_OPTION_PREVENTS_STATEMENT,
        1815 => ErrorKind::ER_INTERNAL_ERROR,
        _ => ErrorKind::ER_UNKNOWN_ERROR,
    }
}
