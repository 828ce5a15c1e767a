//! Single-owner wrapper around one [`ProtocolConnection`] that reconnects
//! transparently on connection-death and enforces exclusive use (spec
//! §4.7).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::ConnectionConfig;
use crate::error::{Error, ErrorTag, Result};
use crate::protocol::codec::CodecRegistry;
use crate::protocol::descriptor::DescriptorCache;
use crate::query::Query;

use super::pool::ConnectionEvent;
use super::ProtocolConnection;

/// A pool-supplied hook, fired on lifecycle events this connection can't
/// see from outside (currently: a transparent reconnect).
type EventCallback = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Guards exclusive use of a [`ReconnectingConnection`]. Releases on drop;
/// [`ReconnectingConnection::unborrow`] is the explicit spelling of the
/// same thing for callers that want to give the intent a name.
#[derive(Debug)]
pub struct Borrow<'a> {
    owner: &'a ReconnectingConnection,
}

impl Drop for Borrow<'_> {
    fn drop(&mut self) {
        self.owner.borrowed.store(false, Ordering::Release);
    }
}

/// Owns exactly one [`ProtocolConnection`], replacing it transparently
/// across reconnects (spec §4.7, §3 `ReconnectingConnection`).
pub struct ReconnectingConnection {
    config: ConnectionConfig,
    descriptors: Arc<DescriptorCache>,
    codecs: Arc<CodecRegistry>,
    conn: Mutex<ProtocolConnection>,
    borrowed: AtomicBool,
    on_event: Option<EventCallback>,
}

impl std::fmt::Debug for ReconnectingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingConnection")
            .field("borrowed", &self.borrowed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ReconnectingConnection {
    pub async fn connect(
        config: ConnectionConfig,
        descriptors: Arc<DescriptorCache>,
        codecs: Arc<CodecRegistry>,
    ) -> Result<Self> {
        Self::connect_with_events(config, descriptors, codecs, None).await
    }

    pub(crate) async fn connect_with_events(
        config: ConnectionConfig,
        descriptors: Arc<DescriptorCache>,
        codecs: Arc<CodecRegistry>,
        on_event: Option<EventCallback>,
    ) -> Result<Self> {
        let conn = super::dial_with_retry(&config, descriptors.clone(), codecs.clone()).await?;
        Ok(ReconnectingConnection {
            config,
            descriptors,
            codecs,
            conn: Mutex::new(conn),
            borrowed: AtomicBool::new(false),
            on_event,
        })
    }

    /// Claims exclusive use of this connection for `reason`. Fails rather
    /// than blocking if another borrower is already active.
    pub fn borrow(&self, reason: &str) -> Result<Borrow<'_>> {
        if self.borrowed.swap(true, Ordering::AcqRel) {
            return Err(Error::Interface(format!(
                "connection already borrowed; requested for {reason}"
            )));
        }
        Ok(Borrow { owner: self })
    }

    pub fn unborrow(&self, guard: Borrow<'_>) {
        drop(guard);
    }

    pub(crate) async fn is_closed(&self) -> bool {
        self.conn.lock().await.is_closed()
    }

    /// The server-advertised idle timeout, if the underlying connection has
    /// received a `system_config` yet (used by the pool to decide whether
    /// an idle entry is still fresh).
    pub(crate) async fn session_idle_timeout(&self) -> Option<std::time::Duration> {
        self.conn.lock().await.system_config().session_idle_timeout
    }

    /// Replaces the underlying connection with a freshly dialed one,
    /// honouring `wait_until_available` (spec §4.7).
    pub(crate) async fn reconnect(&self) -> Result<()> {
        let fresh =
            super::dial_with_retry(&self.config, self.descriptors.clone(), self.codecs.clone()).await?;
        *self.conn.lock().await = fresh;
        if let Some(cb) = &self.on_event {
            cb(ConnectionEvent::Reconnected);
        }
        Ok(())
    }

    /// Runs `query` once against the current underlying connection, with
    /// no reconnect/retry of its own.
    pub(crate) async fn execute(&self, query: &mut Query) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.granular_flow(query).await
    }

    /// `granular_flow`, assuming the caller already holds a [`Borrow`] for
    /// the whole span this call is part of (used by
    /// [`Transactable`](super::transactable::Transactable), which borrows
    /// once per transaction rather than once per statement).
    pub(crate) async fn granular_flow_borrowed(&self, query: &mut Query) -> Result<()> {
        match self.execute(query).await {
            Ok(()) => Ok(()),
            Err(e) if e.has_tag(ErrorTag::ShouldReconnect) => {
                self.reconnect().await?;
                self.execute(query).await
            }
            Err(e) => Err(e),
        }
    }

    /// Runs `query` to completion, reconnecting and retrying exactly once
    /// if the underlying socket turned out to be dead (spec §4.7).
    pub async fn granular_flow(&self, query: &mut Query) -> Result<()> {
        let _guard = self.borrow("granular_flow")?;
        self.granular_flow_borrowed(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_borrow_is_rejected_while_first_is_held() {
        // `ReconnectingConnection` can't be constructed without a live
        // socket, so this only exercises the atomic directly via a
        // minimal stand-in of the borrow bookkeeping.
        let borrowed = AtomicBool::new(false);
        assert!(!borrowed.swap(true, Ordering::AcqRel));
        assert!(borrowed.swap(true, Ordering::AcqRel));
    }
}
