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

//! The backend gateway: a bounded FIFO pool of backend connections with
//! health probing, recycling and per-statement deadlines. With capacity 1
//! (the common case) every backend statement in the process is serialized.

mod native;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use native::NativeConnector;
use parking_lot::Mutex;
use sqlbridge_common::config::BackendSection;
use sqlbridge_common::{ProxyError, Result};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Statement the pool health-probes slots with. Chosen because it bypasses
/// downstream policy gates on systems that layer a proxy on top of a proxy.
const HEALTH_PROBE_SQL: &str = "SHOW STATUS LIKE 'Threads_connected'";

pub type Rows = Vec<Vec<Option<String>>>;

/// How a backend failure affects the slot that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connectivity-shaped; the slot is destroyed and the pool self-heals.
    Transient,
    /// The statement failed but the connection is fine; the slot is kept.
    Query,
    /// Unusable configuration or endpoint; give up.
    Fatal,
}

#[derive(Debug, Clone)]
pub struct BackendError {
    pub class: ErrorClass,
    pub code: Option<u16>,
    pub message: String,
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            code: None,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Fatal,
            code: None,
            message: message.into(),
        }
    }
}

impl From<BackendError> for ProxyError {
    fn from(e: BackendError) -> Self {
        match e.class {
            ErrorClass::Transient => ProxyError::BackendTransient(e.message),
            ErrorClass::Query => ProxyError::BackendQuery {
                code: e.code,
                message: e.message,
            },
            ErrorClass::Fatal => ProxyError::Fatal(e.message),
        }
    }
}

/// One open backend connection, lent exclusively for a round-trip.
#[async_trait::async_trait]
pub trait BackendConnection: Send {
    async fn execute(&mut self, sql: &str) -> std::result::Result<(Vec<String>, Rows), BackendError>;
    async fn close(self: Box<Self>);
}

/// The connector contract: `connect`, `execute` (on the connection), `close`.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> std::result::Result<Box<dyn BackendConnection>, BackendError>;
}

struct BackendSlot {
    id: u64,
    conn: Box<dyn BackendConnection>,
    created_at: Instant,
    last_used: Instant,
}

pub type PoolRef = Arc<Pool>;

/// Bounded set of backend slots. A fair semaphore orders waiters FIFO; the
/// mutex guards the idle list only and is never held across an await.
pub struct Pool {
    connector: Arc<dyn Connector>,
    idle: Mutex<VecDeque<BackendSlot>>,
    loans: Semaphore,
    capacity: usize,
    pre_ping: bool,
    recycle_after: Option<Duration>,
    next_slot_id: AtomicU64,
}

impl Pool {
    /// Create the pool and probe the backend once; a failed initial probe is
    /// a startup error.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        config: &BackendSection,
    ) -> Result<PoolRef> {
        let pool = Arc::new(Self {
            connector,
            idle: Mutex::new(VecDeque::new()),
            loans: Semaphore::new(config.pool_size),
            capacity: config.pool_size,
            pre_ping: config.pool_pre_ping,
            recycle_after: config.recycle_after(),
            next_slot_id: AtomicU64::new(0),
        });

        let mut slot = pool.open_slot().await.map_err(|e| {
            ProxyError::Fatal(format!("initial backend probe failed: {}", e.message))
        })?;
        slot.conn.execute(HEALTH_PROBE_SQL).await.map_err(|e| {
            ProxyError::Fatal(format!("initial backend probe failed: {}", e.message))
        })?;
        info!(capacity = pool.capacity, "backend pool ready");
        pool.idle.lock().push_back(slot);
        Ok(pool)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Run one statement against a pooled slot, within what remains of the
    /// statement's deadline. Acquisition is FIFO; expiry while waiting
    /// surfaces as a timeout, expiry mid-flight also destroys the slot.
    pub async fn execute(
        &self,
        statement_id: u64,
        sql: &str,
        deadline: Duration,
    ) -> Result<(Vec<String>, Rows)> {
        let started = Instant::now();
        let permit = timeout(deadline, self.loans.acquire())
            .await
            .map_err(|_| {
                warn!(statement_id, "timed out waiting for a backend slot");
                ProxyError::Timeout(deadline)
            })?
            .expect("pool semaphore closed");

        let mut slot = match self.checkout().await {
            Ok(slot) => slot,
            Err(e) => {
                drop(permit);
                return Err(e.into());
            }
        };

        let remaining = deadline.saturating_sub(started.elapsed());
        debug!(statement_id, slot = slot.id, "dispatching to backend");
        let outcome = timeout(remaining, slot.conn.execute(sql)).await;
        let result = match outcome {
            Err(_) => {
                // The connector call is abandoned; the slot goes with it.
                warn!(statement_id, slot = slot.id, "backend call timed out; destroying slot");
                slot.conn.close().await;
                Err(ProxyError::Timeout(deadline))
            }
            Ok(Err(e)) if e.class == ErrorClass::Query => {
                slot.last_used = Instant::now();
                self.idle.lock().push_back(slot);
                Err(e.into())
            }
            Ok(Err(e)) => {
                warn!(
                    statement_id,
                    slot = slot.id,
                    error = %e.message,
                    "backend error; destroying slot"
                );
                slot.conn.close().await;
                Err(e.into())
            }
            Ok(Ok(reply)) => {
                slot.last_used = Instant::now();
                self.idle.lock().push_back(slot);
                Ok(reply)
            }
        };
        drop(permit);
        result
    }

    /// Take an idle slot, recycling or replacing it as needed; open a fresh
    /// one when the idle list is empty. Caller holds a loan permit.
    async fn checkout(&self) -> std::result::Result<BackendSlot, BackendError> {
        let candidate = self.idle.lock().pop_front();
        let candidate = match candidate {
            Some(slot) => {
                if let Some(max_age) = self.recycle_after {
                    if slot.created_at.elapsed() > max_age {
                        debug!(slot = slot.id, "recycling aged slot");
                        slot.conn.close().await;
                        return self.open_slot().await;
                    }
                }
                Some(slot)
            }
            None => None,
        };

        let mut slot = match candidate {
            Some(slot) => slot,
            None => self.open_slot().await?,
        };

        if self.pre_ping {
            if let Err(e) = slot.conn.execute(HEALTH_PROBE_SQL).await {
                warn!(slot = slot.id, error = %e.message, "health probe failed; replacing slot");
                slot.conn.close().await;
                slot = self.open_slot().await?;
            }
        }
        Ok(slot)
    }

    async fn open_slot(&self) -> std::result::Result<BackendSlot, BackendError> {
        let conn = self.connector.connect().await?;
        let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        debug!(slot = id, "opened backend slot");
        Ok(BackendSlot {
            id,
            conn,
            created_at: now,
            last_used: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;

    use super::*;

    /// A scriptable connector for pool tests.
    struct MockConnector {
        connects: AtomicUsize,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        fail_probe_on_connection: Option<usize>,
        execute_delay: Duration,
    }

    impl MockConnector {
        fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
                fail_probe_on_connection: None,
                execute_delay: Duration::ZERO,
            }
        }
    }

    struct MockConnection {
        number: usize,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        fail_probe: bool,
        execute_delay: Duration,
    }

    #[async_trait::async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> std::result::Result<Box<dyn BackendConnection>, BackendError> {
            let number = self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockConnection {
                number,
                in_flight: self.in_flight.clone(),
                max_in_flight: self.max_in_flight.clone(),
                fail_probe: self.fail_probe_on_connection == Some(number),
                execute_delay: self.execute_delay,
            }))
        }
    }

    #[async_trait::async_trait]
    impl BackendConnection for MockConnection {
        async fn execute(
            &mut self,
            sql: &str,
        ) -> std::result::Result<(Vec<String>, Rows), BackendError> {
            if sql == HEALTH_PROBE_SQL && self.fail_probe {
                return Err(BackendError::transient("probe failed"));
            }
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if !self.execute_delay.is_zero() {
                tokio::time::sleep(self.execute_delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if sql.starts_with("ERR") {
                return Err(BackendError {
                    class: ErrorClass::Query,
                    code: Some(1146),
                    message: "no such table".to_owned(),
                });
            }
            if sql.starts_with("GONE") {
                return Err(BackendError::transient("connection lost"));
            }
            Ok((
                vec!["conn".to_owned()],
                vec![vec![Some(self.number.to_string())]],
            ))
        }

        async fn close(self: Box<Self>) {}
    }

    async fn pool_with(connector: Arc<MockConnector>, size: usize) -> PoolRef {
        let config = BackendSection {
            pool_size: size,
            pool_pre_ping: false,
            ..Default::default()
        };
        Pool::connect(connector, &config).await.unwrap()
    }

    #[tokio::test]
    async fn test_single_slot_reused() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool_with(connector.clone(), 1).await;
        for _ in 0..3 {
            let (_, rows) = pool.execute(1, "SELECT 1", Duration::from_secs(1)).await.unwrap();
            assert_eq!(rows[0][0], Some("0".to_owned()));
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_query_error_keeps_slot() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool_with(connector.clone(), 1).await;
        let err = pool
            .execute(1, "ERR SELECT", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_matches!(err, ProxyError::BackendQuery { code: Some(1146), .. });
        // Same connection serves the next statement.
        pool.execute(2, "SELECT 1", Duration::from_secs(1)).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_error_destroys_slot() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool_with(connector.clone(), 1).await;
        let err = pool
            .execute(1, "GONE", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_matches!(err, ProxyError::BackendTransient(_));
        let (_, rows) = pool.execute(2, "SELECT 1", Duration::from_secs(1)).await.unwrap();
        // A fresh connection replaced the destroyed one.
        assert_eq!(rows[0][0], Some("1".to_owned()));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pre_ping_replaces_dead_slot() {
        let mut connector = MockConnector::new();
        // Connection 0 (the startup probe slot) fails its next health probe.
        connector.fail_probe_on_connection = Some(0);
        let connector = Arc::new(connector);
        let config = BackendSection {
            pool_size: 1,
            pool_pre_ping: true,
            ..Default::default()
        };
        // Startup probe runs on execute() directly, not through pre-ping, so
        // construction must still succeed.
        let pool = Pool::connect(connector.clone(), &config).await.unwrap();
        let (_, rows) = pool.execute(1, "SELECT 1", Duration::from_secs(1)).await.unwrap();
        assert_eq!(rows[0][0], Some("1".to_owned()));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_in_flight_bounded_by_capacity() {
        let mut connector = MockConnector::new();
        connector.execute_delay = Duration::from_millis(20);
        let connector = Arc::new(connector);
        let pool = pool_with(connector.clone(), 2).await;

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.execute(i, "SELECT 1", Duration::from_secs(5)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(
            connector.max_in_flight.load(Ordering::SeqCst) <= 2,
            "in-flight exceeded capacity"
        );
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let mut connector = MockConnector::new();
        connector.execute_delay = Duration::from_millis(200);
        let connector = Arc::new(connector);
        let pool = pool_with(connector, 1).await;

        let slow = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.execute(1, "SELECT 1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = pool
            .execute(2, "SELECT 1", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_matches!(err, ProxyError::Timeout(_));
        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_mid_flight_timeout_destroys_slot() {
        let mut connector = MockConnector::new();
        connector.execute_delay = Duration::from_millis(200);
        let connector = Arc::new(connector);
        let pool = pool_with(connector.clone(), 1).await;

        let err = pool
            .execute(1, "SELECT 1", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_matches!(err, ProxyError::Timeout(_));
        // Next statement opens a fresh connection.
        pool.execute(2, "SELECT 1", Duration::from_secs(5)).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }
}
