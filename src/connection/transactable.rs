//! Transaction runner: `START`/action/`COMMIT`/`ROLLBACK` plus the
//! retry-with-backoff loop around conflicts (spec §4.8).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::sleep;

use crate::config::ConnectionConfig;
use crate::error::{Error, ErrorCategory, ErrorTag, Result};
use crate::protocol::codec::CodecRegistry;
use crate::protocol::descriptor::DescriptorCache;
use crate::protocol::Capabilities;
use crate::query::Query;
use crate::retry::{RetryRules, TxOptions};

use super::reconnecting::ReconnectingConnection;

/// A handle an `action` closure uses to run statements inside the open
/// transaction (spec §4.8 `action(tx)`).
#[derive(Debug)]
pub struct Tx<'a> {
    conn: &'a ReconnectingConnection,
    last_capabilities: &'a AtomicU64,
}

impl Tx<'_> {
    pub async fn granular_flow(&self, query: &mut Query) -> Result<()> {
        self.last_capabilities
            .store(query.capabilities_mask.bits(), Ordering::Relaxed);
        self.conn.granular_flow_borrowed(query).await
    }
}

/// Wraps a [`ReconnectingConnection`], adding the per-statement retry
/// wrapper and the transaction attempt loop (spec §3, §4.8).
#[derive(Debug)]
pub struct Transactable {
    conn: ReconnectingConnection,
    retry_rules: RetryRules,
}

impl Transactable {
    pub async fn connect(
        config: ConnectionConfig,
        descriptors: Arc<DescriptorCache>,
        codecs: Arc<CodecRegistry>,
        retry_rules: RetryRules,
    ) -> Result<Self> {
        let conn = ReconnectingConnection::connect(config, descriptors, codecs).await?;
        Ok(Transactable { conn, retry_rules })
    }

    /// A single statement outside any transaction, with the reconnecting
    /// connection's own reconnect-and-retry-once behavior (spec §4.7).
    pub async fn granular_flow(&self, query: &mut Query) -> Result<()> {
        self.conn.granular_flow(query).await
    }

    /// Runs `action` inside `START TRANSACTION ...; ...; COMMIT`, retrying
    /// the whole attempt on a retriable conflict per `RetryRule` (spec
    /// §4.8).
    pub async fn tx<F, Fut, T>(&self, options: TxOptions, action: F) -> Result<T>
    where
        F: Fn(Tx<'_>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let _guard = self.conn.borrow("tx")?;
        let mut attempt: u32 = 1;

        loop {
            if self.conn.is_closed().await {
                self.conn.reconnect().await?;
            }

            let mut start = Query::script(options.to_command_text(), Capabilities::TRANSACTION);
            if let Err(e) = self.conn.granular_flow_borrowed(&mut start).await {
                match retry_or_fail(&self.retry_rules, &e, Capabilities::TRANSACTION, &mut attempt).await {
                    Some(stop_err) => return Err(stop_err),
                    None => continue,
                }
            }

            let last_capabilities = AtomicU64::new(0);
            let tx_handle = Tx {
                conn: &self.conn,
                last_capabilities: &last_capabilities,
            };

            match action(tx_handle).await {
                Ok(value) => {
                    let mut commit = Query::script("COMMIT", Capabilities::TRANSACTION);
                    match self.conn.granular_flow_borrowed(&mut commit).await {
                        Ok(()) => return Ok(value),
                        Err(e) => {
                            match retry_or_fail(&self.retry_rules, &e, Capabilities::TRANSACTION, &mut attempt).await
                            {
                                Some(stop_err) => return Err(stop_err),
                                None => continue,
                            }
                        }
                    }
                }
                Err(action_err) => {
                    let is_connection_error = matches!(
                        action_err.category(),
                        ErrorCategory::ClientConnectionFailed
                            | ErrorCategory::ClientConnectionFailedTemporarily
                            | ErrorCategory::ClientConnectionTimeout
                            | ErrorCategory::ClientConnectionClosed
                    );

                    if !is_connection_error {
                        let mut rollback = Query::script("ROLLBACK", Capabilities::TRANSACTION);
                        let _ = self.conn.granular_flow_borrowed(&mut rollback).await;
                        return Err(action_err);
                    }

                    let capabilities =
                        Capabilities::from_bits_retain(last_capabilities.load(Ordering::Relaxed));
                    match retry_or_fail(&self.retry_rules, &action_err, capabilities, &mut attempt).await {
                        Some(stop_err) => return Err(stop_err),
                        None => continue,
                    }
                }
            }
        }
    }
}

/// Classifies `err` against `capabilities` (the most recent statement's
/// capability mask, used for the "query was read-only" condition):
/// retriable errors sleep the configured backoff and return `None` ("try
/// again"); everything else returns `Some(err)` ("stop here") (spec
/// §4.8's Error step).
async fn retry_or_fail(
    retry_rules: &RetryRules,
    err: &Error,
    capabilities: Capabilities,
    attempt: &mut u32,
) -> Option<Error> {
    let retriable = err.has_tag(ErrorTag::ShouldRetry)
        && (capabilities.is_read_only() || err.category() == ErrorCategory::TransactionConflict);

    if !retriable {
        return Some(clone_error(err));
    }

    let rule = retry_rules.rule_for(err.category());
    if *attempt < rule.attempts {
        sleep(rule.backoff_for(*attempt)).await;
        *attempt += 1;
        None
    } else {
        Some(clone_error(err))
    }
}

/// `Error` has no `Clone` (its I/O variant doesn't support it); this
/// rebuilds an equivalent value from the parts retry classification
/// cares about, which is all a caller sees after `tx` gives up.
fn clone_error(err: &Error) -> Error {
    match err {
        Error::Interface(msg) => Error::Interface(msg.clone()),
        Error::TransactionConflict(msg) => Error::TransactionConflict(msg.clone()),
        Error::Transaction(msg) => Error::Transaction(msg.clone()),
        Error::ClientConnectionFailed(msg) => Error::ClientConnectionFailed(msg.clone()),
        Error::ClientConnectionFailedTemporarily(msg) => {
            Error::ClientConnectionFailedTemporarily(msg.clone())
        }
        Error::ClientConnectionTimeout(msg) => Error::ClientConnectionTimeout(msg.clone()),
        Error::ClientConnectionClosed => Error::ClientConnectionClosed,
        Error::BinaryProtocol(msg) => Error::BinaryProtocol(msg.clone()),
        Error::UnexpectedMessage(msg) => Error::UnexpectedMessage(msg.clone()),
        Error::InvalidArgument(msg) => Error::InvalidArgument(msg.clone()),
        Error::NoData(msg) => Error::NoData(msg.clone()),
        Error::ResultCardinalityMismatch(msg) => Error::ResultCardinalityMismatch(msg.clone()),
        Error::DisabledCapability(msg) => Error::DisabledCapability(msg.clone()),
        Error::Authentication(msg) => Error::Authentication(msg.clone()),
        Error::Configuration(msg) => Error::Configuration(msg.clone()),
        Error::Io(e) => Error::ClientConnectionFailed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryRule;
    use std::time::Duration;

    fn instant_rules() -> RetryRules {
        RetryRules::default().with_rule(
            ErrorCategory::TransactionConflict,
            RetryRule::new(3, |_| Duration::from_millis(0)),
        )
    }

    #[tokio::test]
    async fn non_retriable_category_stops_immediately() {
        let rules = instant_rules();
        let err = Error::InvalidArgument("bad arg".into());
        let mut attempt = 1;
        let outcome = retry_or_fail(&rules, &err, Capabilities::empty(), &mut attempt).await;
        assert!(matches!(outcome, Some(Error::InvalidArgument(_))));
        assert_eq!(attempt, 1);
    }

    #[tokio::test]
    async fn transaction_conflict_retries_until_attempts_exhausted() {
        let rules = instant_rules();
        let err = Error::TransactionConflict("serialization failure".into());
        let mut attempt = 1;

        assert!(retry_or_fail(&rules, &err, Capabilities::TRANSACTION, &mut attempt)
            .await
            .is_none());
        assert_eq!(attempt, 2);
        assert!(retry_or_fail(&rules, &err, Capabilities::TRANSACTION, &mut attempt)
            .await
            .is_none());
        assert_eq!(attempt, 3);
        assert!(retry_or_fail(&rules, &err, Capabilities::TRANSACTION, &mut attempt)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn temporary_connection_failure_only_retries_when_read_only() {
        let rules = instant_rules();
        let err = Error::ClientConnectionFailedTemporarily("reset".into());
        let mut attempt = 1;

        let stopped = retry_or_fail(&rules, &err, Capabilities::MODIFICATIONS, &mut attempt).await;
        assert!(stopped.is_some());
        assert_eq!(attempt, 1);

        let retried = retry_or_fail(&rules, &err, Capabilities::empty(), &mut attempt).await;
        assert!(retried.is_none());
        assert_eq!(attempt, 2);
    }
}
