//! Bounded connection pool: a semaphore-gated FIFO of idle entries, handing
//! out [`ReconnectingConnection`]s and dialing fresh ones on a miss (spec
//! §4.9).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::protocol::codec::CodecRegistry;
use crate::protocol::descriptor::DescriptorCache;

use super::reconnecting::ReconnectingConnection;

/// How much earlier than the server's advertised `session_idle_timeout` an
/// idle entry is discarded, so a connection is never handed out right on
/// the edge of the server closing it out from under us.
const IDLE_SAFETY_MARGIN: Duration = Duration::from_secs(1);

/// Lifecycle events a pool emits, for callers that want to observe what the
/// pool is doing without threading logging through every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Dialed,
    Acquired,
    Released,
    Reconnected,
    IdleEvicted,
}

/// An idle, ready-to-reuse connection plus the time it was last handed back
/// (spec §3 `PoolEntry`).
struct PoolEntry {
    connection: Arc<ReconnectingConnection>,
    last_used_at: Instant,
}

struct Idle {
    entries: VecDeque<PoolEntry>,
}

/// A handle returned by [`Pool::acquire`]. Dropping it without calling
/// [`Pool::release`] is treated as a connection-death signal: the entry is
/// not returned to the idle queue, which keeps the failure mode safe by
/// default (a caller that panics or forgets to release never leaks a
/// poisoned connection back into rotation).
#[derive(Debug)]
pub struct Acquired {
    connection: Option<Arc<ReconnectingConnection>>,
    // Held so the slot is freed on drop regardless of whether the caller
    // calls `Pool::release`; `release` only decides idle-queue placement.
    _permit: OwnedSemaphorePermit,
}

impl Acquired {
    pub fn connection(&self) -> &Arc<ReconnectingConnection> {
        self.connection.as_ref().expect("connection already released")
    }
}

/// Bounded pool of connections to one server, built from a shared
/// [`DescriptorCache`] and [`CodecRegistry`] so every connection it dials
/// shares the same caches (spec §4.9, §5 "Shared-resource policy").
pub struct Pool {
    config: ConnectionConfig,
    descriptors: Arc<DescriptorCache>,
    codecs: Arc<CodecRegistry>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Idle>,
    closed: AtomicBool,
    on_event: Option<Arc<dyn Fn(ConnectionEvent) + Send + Sync>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("concurrency", &self.semaphore.available_permits())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Pool {
    pub fn new(config: ConnectionConfig, concurrency: usize) -> Self {
        Self::with_caches(
            config,
            concurrency,
            Arc::new(DescriptorCache::new()),
            Arc::new(CodecRegistry::new()),
        )
    }

    /// Like [`Pool::new`], but with caller-supplied caches instead of
    /// private per-pool ones — tests want an isolated cache rather than
    /// the process-wide one a real client would share (per the design
    /// notes on the descriptor cache).
    pub fn with_caches(
        config: ConnectionConfig,
        concurrency: usize,
        descriptors: Arc<DescriptorCache>,
        codecs: Arc<CodecRegistry>,
    ) -> Self {
        Pool {
            config,
            descriptors,
            codecs,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            idle: Mutex::new(Idle {
                entries: VecDeque::new(),
            }),
            closed: AtomicBool::new(false),
            on_event: None,
        }
    }

    /// Registers a callback invoked for every lifecycle event. Intended for
    /// tests and diagnostics; the callback runs inline on the caller's task,
    /// so it must not block.
    pub fn with_event_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(callback));
        self
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(cb) = &self.on_event {
            cb(event);
        }
    }

    /// Claims one connection, reusing an idle entry when one is fresh
    /// enough or dialing a new one otherwise (spec §4.9 `acquire`).
    pub async fn acquire(&self) -> Result<Acquired> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Interface("client closed".into()));
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Interface("client closed".into()))?;

        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Interface("client closed".into()));
        }

        loop {
            let popped = {
                let mut idle = self.idle.lock().await;
                idle.entries.pop_front()
            };

            let Some(entry) = popped else {
                let conn = ReconnectingConnection::connect_with_events(
                    self.config.clone(),
                    self.descriptors.clone(),
                    self.codecs.clone(),
                    self.on_event.clone(),
                )
                .await?;
                self.emit(ConnectionEvent::Dialed);
                self.emit(ConnectionEvent::Acquired);
                return Ok(Acquired {
                    connection: Some(Arc::new(conn)),
                    _permit: permit,
                });
            };

            if self.is_stale(&entry).await {
                self.emit(ConnectionEvent::IdleEvicted);
                continue;
            }

            self.emit(ConnectionEvent::Acquired);
            return Ok(Acquired {
                connection: Some(entry.connection),
                _permit: permit,
            });
        }
    }

    /// An idle entry is stale once it's been sitting longer than
    /// `session_idle_timeout - safety_margin` (spec §4.9 step 2, §8 "Pool
    /// idleness"). Connections that haven't heard a `session_idle_timeout`
    /// from the server yet are never considered stale.
    async fn is_stale(&self, entry: &PoolEntry) -> bool {
        let Some(timeout) = entry.connection.session_idle_timeout().await else {
            return false;
        };
        let Some(usable_for) = timeout.checked_sub(IDLE_SAFETY_MARGIN) else {
            return true;
        };
        entry.last_used_at.elapsed() >= usable_for
    }

    /// Returns a connection to the pool, or closes it if `err` indicates
    /// the connection (rather than the query) is at fault, or if the pool
    /// is shutting down (spec §4.9 `release`).
    pub async fn release(&self, mut acquired: Acquired, err: Option<&Error>) {
        let Some(conn) = acquired.connection.take() else {
            return;
        };

        let dead = self.closed.load(Ordering::Acquire)
            || conn.is_closed().await
            || err.is_some_and(|e| e.has_tag(crate::error::ErrorTag::ShouldReconnect));

        if dead {
            return;
        }

        let mut idle = self.idle.lock().await;
        idle.entries.push_back(PoolEntry {
            connection: conn,
            last_used_at: Instant::now(),
        });
        drop(idle);
        self.emit(ConnectionEvent::Released);
    }

    /// Idempotently closes every idle entry and marks the pool closed; any
    /// acquire after the first `close` call fails immediately (spec §4.9
    /// `close`, §8 "Close idempotency one-shot").
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Interface("client closed".into()));
        }

        self.semaphore.close();
        let mut idle = self.idle.lock().await;
        idle.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn base_config() -> ConnectionConfig {
        ConnectionConfig {
            addr: crate::config::Addr::Tcp {
                host: "localhost".into(),
                port: 5656,
            },
            user: "admin".into(),
            password: None,
            database: Some("mydb".into()),
            branch: Some("main".into()),
            secret_key: None,
            connect_timeout: Duration::from_millis(1),
            wait_until_available: Duration::from_millis(1),
            tls_ca_pem: None,
            tls_security: crate::config::TlsSecurity::Strict,
            tls_server_name: None,
            server_settings: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn acquire_after_close_fails_with_interface_error() {
        let pool = Pool::new(base_config(), 4);
        pool.close().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::Interface(msg) if msg == "client closed"));
    }

    #[tokio::test]
    async fn close_is_idempotent_one_shot() {
        let pool = Pool::new(base_config(), 1);
        assert!(pool.close().await.is_ok());
        assert!(matches!(pool.close().await, Err(Error::Interface(_))));
    }

    #[tokio::test]
    async fn close_with_no_idle_entries_does_not_panic() {
        let pool = Pool::new(base_config(), 2);
        pool.close().await.unwrap();
    }

    #[test]
    fn event_callback_runs_for_idle_evicted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let pool = Pool::new(base_config(), 1).with_event_callback(move |event| {
            if event == ConnectionEvent::IdleEvicted {
                calls2.fetch_add(1, Ordering::Relaxed);
            }
        });
        pool.emit(ConnectionEvent::IdleEvicted);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
