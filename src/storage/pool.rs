//! Database connection pool.
//!
//! Hands out connections FIFO to increase re-use. Callers get a guard
//! that checks the connection back in on drop; closed connections are
//! discarded instead of returned. A maintenance task closes idle
//! connections after the configured idle timeout.
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::error;

use crate::error::Error;

/// One open connection plus the task driving its socket.
pub struct Connection {
    client: tokio_postgres::Client,
    driver: JoinHandle<()>,
    last_used: Instant,
}

impl Connection {
    async fn open(url: &str) -> Result<Self, Error> {
        let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls).await?;

        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("database connection error: {}", err);
            }
        });

        Ok(Self {
            client,
            driver,
            last_used: Instant::now(),
        })
    }

    fn used(&mut self) {
        self.last_used = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

struct PoolInner {
    idle: VecDeque<Connection>,
    /// Idle plus checked-out connections.
    open: usize,
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub checkout_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            checkout_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(3600),
        }
    }
}

/// Connection pool that opens connections on demand up to its size limit.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Mutex<PoolInner>>,
    checkin_notify: Arc<Notify>,
    database_url: String,
    config: PoolConfig,
}

impl Pool {
    pub fn new(database_url: &str, config: PoolConfig) -> Self {
        let pool = Self {
            inner: Arc::new(Mutex::new(PoolInner {
                idle: VecDeque::new(),
                open: 0,
            })),
            checkin_notify: Arc::new(Notify::new()),
            database_url: database_url.to_string(),
            config,
        };

        let inner = pool.inner.clone();
        let idle_timeout = pool.config.idle_timeout;
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(1)).await;
                Self::maintenance(&inner, idle_timeout);
            }
        });

        pool
    }

    /// Close idle connections that outlived the idle timeout, and drop
    /// connections the server closed.
    fn maintenance(inner: &Mutex<PoolInner>, idle_timeout: Duration) {
        let mut inner = inner.lock();

        let before = inner.idle.len();
        inner
            .idle
            .retain(|connection| !connection.client.is_closed() && connection.idle_for() < idle_timeout);
        inner.open -= before - inner.idle.len();
    }

    /// Get a connection, waiting up to the checkout timeout for one to
    /// free up.
    pub async fn get(&self) -> Result<ConnectionGuard, Error> {
        let deadline = Instant::now() + self.config.checkout_timeout;

        loop {
            let open_new = {
                let mut inner = self.inner.lock();

                if let Some(connection) = inner.idle.pop_front() {
                    return Ok(ConnectionGuard::new(connection, self.clone()));
                }

                if inner.open < self.config.pool_size {
                    inner.open += 1;
                    true
                } else {
                    false
                }
            };

            if open_new {
                match Connection::open(&self.database_url).await {
                    Ok(connection) => return Ok(ConnectionGuard::new(connection, self.clone())),
                    Err(err) => {
                        self.inner.lock().open -= 1;
                        return Err(err);
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Storage("connection checkout timed out".into()));
            }

            // Wait for a checkin, then try again.
            let _ = timeout(remaining, self.checkin_notify.notified()).await;
        }
    }

    fn checkin(&self, mut connection: Connection) {
        connection.used();

        {
            let mut inner = self.inner.lock();

            if connection.client.is_closed() {
                inner.open -= 1;
            } else {
                inner.idle.push_back(connection);
            }
        }

        self.checkin_notify.notify_one();
    }
}

/// Smart pointer that returns the connection to the pool on drop.
pub struct ConnectionGuard {
    connection: Option<Connection>,
    pool: Pool,
}

impl ConnectionGuard {
    fn new(connection: Connection, pool: Pool) -> Self {
        Self {
            connection: Some(connection),
            pool,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.checkin(connection);
        }
    }
}

impl Deref for ConnectionGuard {
    type Target = tokio_postgres::Client;

    fn deref(&self) -> &Self::Target {
        &self.connection.as_ref().expect("connection checked in").client
    }
}

impl DerefMut for ConnectionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .connection
            .as_mut()
            .expect("connection checked in")
            .client
    }
}
